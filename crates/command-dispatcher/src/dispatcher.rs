//! Command Dispatcher Implementation

use crate::command::{parse_request, Command, Request};
use crate::status::{CommandError, StatusEvent};
use acquisition_supervisor::Supervisor;
use feature_engine::decode_upload;
use inference_engine::{AnomalyDetector, ScoreRequest, TrainRequest, WindowSource};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use storage::TelemetryStore;
use tracing::{debug, info, warn};

/// Keys owned by the status event envelope
const RESERVED_KEYS: [&str; 6] = ["status", "type", "request_id", "vehicle_id", "error", "code"];

/// Routes commands to the supervisor and the anomaly detector
pub struct Dispatcher<S> {
    supervisor: Arc<Supervisor>,
    detector: AnomalyDetector<S>,
}

impl<S: TelemetryStore> Dispatcher<S> {
    pub fn new(supervisor: Arc<Supervisor>, detector: AnomalyDetector<S>) -> Self {
        Self {
            supervisor,
            detector,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Parse and run one raw message. Always yields exactly one event.
    pub async fn handle(&self, raw: &[u8]) -> StatusEvent {
        match parse_request(raw) {
            Ok(request) => self.dispatch(request).await,
            Err(rejected) => {
                let error = CommandError::from(rejected.error);
                warn!(
                    "Rejected command {:?} (request {:?}): {}",
                    rejected.kind, rejected.request_id, error.message
                );
                counter!("commands_received_total", "kind" => "invalid").increment(1);
                counter!("commands_failed_total", "kind" => "invalid", "error" => error.kind.as_str())
                    .increment(1);
                StatusEvent::failed(rejected.kind.as_deref(), &error)
                    .with_request_id(rejected.request_id)
                    .with_vehicle_id(rejected.vehicle_id)
            }
        }
    }

    /// Run a validated command
    pub async fn dispatch(&self, request: Request) -> StatusEvent {
        let kind = request.command.kind();
        let vehicle_id = request.command.vehicle_id().map(str::to_string);
        counter!("commands_received_total", "kind" => kind.as_str()).increment(1);
        debug!("Dispatching {} for vehicle {:?}", kind.as_str(), vehicle_id);

        let started = Instant::now();
        let event = match self.execute(request.command).await {
            Ok(mut result) => {
                for key in RESERVED_KEYS {
                    result.remove(key);
                }
                let message = match result.remove("message") {
                    Some(Value::String(message)) => Some(message),
                    _ => None,
                };
                let mut event = StatusEvent::ok(kind.as_str(), result);
                event.message = message;
                event
            }
            Err(error) => {
                warn!(
                    "Command {} for vehicle {:?} failed: {}",
                    kind.as_str(),
                    vehicle_id,
                    error
                );
                counter!("commands_failed_total", "kind" => kind.as_str(), "error" => error.kind.as_str())
                    .increment(1);
                StatusEvent::failed(Some(kind.as_str()), &error)
            }
        };
        histogram!("command_duration_seconds", "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64());

        event
            .with_request_id(request.request_id)
            .with_vehicle_id(vehicle_id)
    }

    async fn execute(&self, command: Command) -> Result<Map<String, Value>, CommandError> {
        match command {
            Command::StartAcquisition { vehicle_id } => {
                let report = self.supervisor.start(&vehicle_id).await?;
                let mut result = to_map(&report)?;
                if let Some(running_for) = result.remove("vehicle_id") {
                    result.insert("worker_vehicle_id".to_string(), running_for);
                }
                let (state, message) = if report.already_running {
                    ("running", "Acquisition already running")
                } else {
                    ("started", "Acquisition started")
                };
                result.insert("state".to_string(), state.into());
                result.insert("message".to_string(), message.into());
                Ok(result)
            }

            Command::StopAcquisition => {
                let outcome = self.supervisor.stop().await?;
                let mut result = to_map(&outcome)?;
                if let Some(stopped_for) = result.remove("vehicle_id") {
                    result.insert("worker_vehicle_id".to_string(), stopped_for);
                }
                result.insert("stopped".to_string(), outcome.stopped_anything().into());
                result.insert(
                    "message".to_string(),
                    if outcome.stopped_anything() {
                        "Acquisition stopped"
                    } else {
                        "No acquisition running"
                    }
                    .into(),
                );
                Ok(result)
            }

            Command::Status => {
                let status = self.supervisor.status().await;
                let mut result = to_map(&status)?;
                if let Some(running_for) = result.remove("vehicle_id") {
                    result.insert("worker_vehicle_id".to_string(), running_for);
                }
                let latest = self
                    .supervisor
                    .live_cache()
                    .latest()
                    .map(|sample| Value::Object(sample.to_record()))
                    .unwrap_or(Value::Null);
                result.insert("latest".to_string(), latest);
                Ok(result)
            }

            Command::TrainModel {
                vehicle_id,
                brand,
                minutes,
            } => {
                info!("Training model for vehicle {} ({}) over {} min", vehicle_id, brand, minutes);
                let report = self
                    .detector
                    .train(TrainRequest {
                        vehicle_id,
                        brand,
                        minutes,
                    })
                    .await?;
                let mut result = to_map(&report)?;
                result.insert("message".to_string(), "Model trained".into());
                Ok(result)
            }

            Command::Score {
                vehicle_id,
                brand,
                model_name,
                minutes,
            } => {
                let request = ScoreRequest {
                    vehicle_id,
                    brand,
                    model_name,
                };
                let report = self
                    .detector
                    .score(request, WindowSource::Store { minutes })
                    .await?;
                to_map(&report)
            }

            Command::ScoreFromUpload {
                vehicle_id,
                brand,
                model_name,
                file_base64,
            } => {
                let window = decode_upload(&vehicle_id, &file_base64)?;
                let request = ScoreRequest {
                    vehicle_id,
                    brand,
                    model_name,
                };
                let report = self
                    .detector
                    .score(request, WindowSource::Supplied(window))
                    .await?;
                to_map(&report)
            }

            Command::FetchWindow { vehicle_id, minutes } => {
                let window = self
                    .detector
                    .extractor()
                    .fetch_window(&vehicle_id, minutes)
                    .await?;
                let rows: Vec<Value> = window.to_records().into_iter().map(Value::Object).collect();

                let mut result = Map::new();
                result.insert("minutes".to_string(), minutes.into());
                result.insert("count".to_string(), rows.len().into());
                result.insert("rows".to_string(), Value::Array(rows));
                Ok(result)
            }

            Command::Report { vehicle_id, minutes, .. } => {
                let report = self
                    .detector
                    .extractor()
                    .channel_report(&vehicle_id, minutes)
                    .await?;
                let mut result = to_map(&report)?;
                result.insert("minutes".to_string(), minutes.into());
                Ok(result)
            }
        }
    }
}

fn to_map<T: Serialize>(value: &T) -> Result<Map<String, Value>, CommandError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            Ok(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{ErrorKind, Outcome};
    use acquisition_supervisor::{ProcessScanner, SupervisorConfig, SupervisorError, WorkerSignature};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use chrono::{Duration, Utc};
    use feature_engine::{ExtractorConfig, WindowExtractor};
    use inference_engine::{ForestConfig, ModelRegistry};
    use storage::MemoryStore;
    use telemetry::{Channel, LiveCache, TelemetrySample};

    struct Fixture {
        dispatcher: Dispatcher<MemoryStore>,
        models: tempfile::TempDir,
    }

    fn idle_sample(vehicle: &str, secs_ago: i64) -> TelemetrySample {
        TelemetrySample::new(vehicle, Utc::now() - Duration::seconds(secs_ago))
            .with_reading(Channel::Rpm, 1450.0 + (secs_ago % 11) as f64)
            .with_reading(Channel::EngineLoad, 20.0 + (secs_ago % 3) as f64)
            .with_reading(Channel::ThrottlePos, 0.0)
            .with_reading(Channel::FuelTrim, -1.5)
            .with_reading(Channel::CoolantTemp, 88.0 + (secs_ago % 5) as f64)
            .with_reading(Channel::SupplyVoltage, 13.6)
    }

    fn fixture(samples: Vec<TelemetrySample>) -> Fixture {
        fixture_with_scanner(samples, None)
    }

    fn fixture_with_scanner(samples: Vec<TelemetrySample>, scanner: Option<Arc<dyn ProcessScanner>>) -> Fixture {
        let models = tempfile::tempdir().unwrap();
        let extractor = WindowExtractor::new(
            Arc::new(MemoryStore::from_samples(samples)),
            ExtractorConfig::default(),
        );
        let detector = AnomalyDetector::new(
            extractor,
            ModelRegistry::new(models.path()),
            ForestConfig::default(),
        );
        let config = SupervisorConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "while true; do sleep 0.1; done".to_string()],
            marker: format!("--acquisition-worker-{}", uuid::Uuid::new_v4().simple()),
            stop_timeout_ms: 2000,
        };
        let mut supervisor = Supervisor::new(config, LiveCache::new());
        if let Some(scanner) = scanner {
            supervisor = supervisor.with_scanner(scanner);
        }
        let supervisor = Arc::new(supervisor);
        Fixture {
            dispatcher: Dispatcher::new(supervisor, detector),
            models,
        }
    }

    async fn send(fixture: &Fixture, json: &str) -> StatusEvent {
        fixture.dispatcher.handle(json.as_bytes()).await
    }

    fn assert_error(event: &StatusEvent, kind: ErrorKind) {
        assert_eq!(event.status, Outcome::Error, "unexpected success: {:?}", event);
        assert_eq!(event.error, Some(kind));
        assert_eq!(event.code, Some(kind.code()));
    }

    #[tokio::test]
    async fn test_unknown_command_is_validation_error() {
        let fixture = fixture(Vec::new());
        let event = send(&fixture, r#"{"command": "launch", "motorcycle_id": "4", "request_id": "r-9"}"#).await;

        assert_error(&event, ErrorKind::ValidationError);
        assert_eq!(event.kind.as_deref(), Some("launch"));
        assert_eq!(event.request_id.as_deref(), Some("r-9"));
        assert!(event.message.unwrap().contains("launch"));
    }

    #[tokio::test]
    async fn test_missing_fields_and_garbage() {
        let fixture = fixture(Vec::new());

        let event = send(&fixture, r#"{"command": "train-model", "motorcycle_id": "4"}"#).await;
        assert_error(&event, ErrorKind::ValidationError);
        assert_eq!(event.vehicle_id.as_deref(), Some("4"));

        let event = send(&fixture, "\u{1}\u{2} not json").await;
        assert_error(&event, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_score_before_train_is_not_found() {
        let fixture = fixture(Vec::new());
        let event = send(
            &fixture,
            r#"{"command": "predict", "motorcycle_id": "77", "brand": "Yamaha NMAX", "model": "nmax"}"#,
        )
        .await;

        assert_error(&event, ErrorKind::ModelNotFoundError);
        assert_eq!(event.kind.as_deref(), Some("score"));
        let expected = fixture.models.path().join("yamaha_nmax").join("idle_77.pkl");
        assert!(event.message.unwrap().contains(&expected.display().to_string()));
    }

    #[tokio::test]
    async fn test_train_then_score() {
        let samples = (0..120).map(|i| idle_sample("4", i * 10)).collect();
        let fixture = fixture(samples);

        let trained = send(
            &fixture,
            r#"{"command": "train-model", "motorcycle_id": 4, "brand": "Yamaha NMAX", "request_id": "t1"}"#,
        )
        .await;
        assert!(trained.is_ok(), "{:?}", trained);
        assert_eq!(trained.kind.as_deref(), Some("train-model"));
        assert_eq!(trained.vehicle_id.as_deref(), Some("4"));
        assert_eq!(trained.result["rows"], 120);
        assert!(trained.result["artifact"].as_str().unwrap().ends_with("idle_4.pkl"));

        let scored = send(
            &fixture,
            r#"{"command": "predict", "motorcycle_id": "4", "brand": "Yamaha NMAX", "model": "nmax", "minutes": 30}"#,
        )
        .await;
        assert!(scored.is_ok(), "{:?}", scored);
        assert!(matches!(scored.result["decision"].as_str(), Some("normal") | Some("anomalous")));
        assert_eq!(scored.result["model_name"], "nmax");
        assert!(!scored.result.contains_key("vehicle_id"));
    }

    #[tokio::test]
    async fn test_training_without_enough_rows() {
        let samples = (0..20).map(|i| idle_sample("4", i)).collect();
        let fixture = fixture(samples);
        let event = send(&fixture, r#"{"command": "train-model", "motorcycle_id": "4", "brand": "honda"}"#).await;
        assert_error(&event, ErrorKind::InsufficientDataError);
    }

    #[tokio::test]
    async fn test_score_from_upload() {
        let samples = (0..80).map(|i| idle_sample("4", i * 10)).collect();
        let fixture = fixture(samples);
        let trained = send(&fixture, r#"{"command": "train-model", "motorcycle_id": "4", "brand": "honda"}"#).await;
        assert!(trained.is_ok());

        let csv = "\
time,rpm,engine_load,throttle_pos,fuel_trim,coolant_temp,supply_voltage
2026-05-01T10:00:00Z,1450,20,0,-1.5,90,13.6
2026-05-01T10:00:01Z,1452,21,0,-1.5,90,13.6
2026-05-01T10:00:02Z,1449,20,0,-1.5,91,13.5
";
        let json = format!(
            r#"{{"command": "predict-from-csv", "motorcycle_id": "4", "brand": "honda", "model": "beat", "file_base64": "{}"}}"#,
            STANDARD.encode(csv)
        );
        let event = send(&fixture, &json).await;
        assert!(event.is_ok(), "{:?}", event);
        assert_eq!(event.kind.as_deref(), Some("score-from-upload"));
        assert_eq!(event.result["rows"], 3);

        let json = r#"{"command": "predict-from-csv", "motorcycle_id": "4", "brand": "honda", "model": "beat", "file_base64": "%%%"}"#;
        assert_error(&send(&fixture, json).await, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_fetch_window_drops_incomplete_rows() {
        let samples = (0..3)
            .map(|i| {
                let mut sample = idle_sample("4", i);
                sample.set(Channel::ALL[i as usize], None);
                sample
            })
            .collect();
        let fixture = fixture(samples);

        let event = send(&fixture, r#"{"command": "recent-data", "motorcycle_id": "4", "minutes": 30}"#).await;
        assert!(event.is_ok());
        assert_eq!(event.kind.as_deref(), Some("fetch-window"));
        assert_eq!(event.result["count"], 0);
        assert_eq!(event.result["rows"], Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn test_daily_report() {
        let samples = (0..10).map(|i| idle_sample("4", i * 60)).collect();
        let fixture = fixture(samples);
        let event = send(&fixture, r#"{"command": "report-daily", "motorcycle_id": "4"}"#).await;

        assert!(event.is_ok());
        assert_eq!(event.kind.as_deref(), Some("report-daily"));
        assert_eq!(event.result["samples"], 10);
        assert_eq!(event.result["means"]["fuel_trim"], -1.5);
    }

    #[tokio::test]
    async fn test_acquisition_lifecycle() {
        let fixture = fixture(Vec::new());

        let idle = send(&fixture, r#"{"command": "stop-obd"}"#).await;
        assert!(idle.is_ok());
        assert_eq!(idle.result["outcome"], "idle");
        assert_eq!(idle.result["stopped"], false);

        let started = send(&fixture, r#"{"command": "start-obd", "motorcycle_id": "4"}"#).await;
        assert!(started.is_ok(), "{:?}", started);
        assert_eq!(started.result["state"], "started");
        let pid = started.result["pid"].clone();

        let again = send(&fixture, r#"{"command": "start-acquisition", "motorcycle_id": "4"}"#).await;
        assert_eq!(again.result["state"], "running");
        assert_eq!(again.result["pid"], pid);

        let status = send(&fixture, r#"{"command": "status"}"#).await;
        assert_eq!(status.result["running"], true);
        assert_eq!(status.result["worker_vehicle_id"], "4");
        assert_eq!(status.result["latest"], Value::Null);

        let stopped = send(&fixture, r#"{"command": "stop-obd"}"#).await;
        assert_eq!(stopped.result["outcome"], "stopped");
        assert_eq!(stopped.result["pid"], pid);
        assert_eq!(stopped.message.as_deref(), Some("Acquisition stopped"));
    }

    struct UnreadableProcessTable;

    impl ProcessScanner for UnreadableProcessTable {
        fn find_workers(&self, _signature: &WorkerSignature) -> Result<Vec<u32>, SupervisorError> {
            Err(SupervisorError::Scan("permission denied".to_string()))
        }

        fn kill(&self, _pid: u32) -> Result<(), SupervisorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scan_failure_is_process_lifecycle_error() {
        let fixture = fixture_with_scanner(Vec::new(), Some(Arc::new(UnreadableProcessTable)));

        let failed = send(&fixture, r#"{"command": "stop-obd", "request_id": "s-1"}"#).await;
        assert_error(&failed, ErrorKind::ProcessLifecycleError);
        assert_eq!(failed.code, Some(500));
        assert_eq!(failed.request_id.as_deref(), Some("s-1"));
        assert!(failed.message.unwrap().contains("permission denied"));

        let started = send(&fixture, r#"{"command": "start-obd", "motorcycle_id": "4"}"#).await;
        assert!(started.is_ok(), "{:?}", started);
        let stopped = send(&fixture, r#"{"command": "stop-obd"}"#).await;
        assert!(stopped.is_ok(), "{:?}", stopped);
        assert_eq!(stopped.result["stopped"], true);
    }
}
