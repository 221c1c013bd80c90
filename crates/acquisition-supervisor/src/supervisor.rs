//! Worker Supervisor Implementation

use crate::scanner::{ProcessScanner, SysinfoScanner, WorkerSignature};
use crate::SupervisorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use telemetry::{LiveCache, TelemetrySample, WorkerPayload};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

const WORKER_LOG_TARGET: &str = "acquisition_worker";

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Worker executable
    pub program: String,
    /// Arguments placed before the vehicle id
    pub args: Vec<String>,
    /// Trailing argument identifying worker processes in the process table
    pub marker: String,
    /// Grace period between SIGTERM and force-kill (milliseconds)
    pub stop_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["obddata.py".to_string()],
            marker: "--acquisition-worker".to_string(),
            stop_timeout_ms: 5000,
        }
    }
}

impl SupervisorConfig {
    pub fn signature(&self) -> WorkerSignature {
        WorkerSignature::new(&self.program, &self.marker)
    }
}

/// Snapshot of the supervised worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub vehicle_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl WorkerStatus {
    fn idle() -> Self {
        Self {
            running: false,
            pid: None,
            vehicle_id: None,
            started_at: None,
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartReport {
    pub pid: u32,
    /// Vehicle the running worker was launched for
    pub vehicle_id: String,
    pub started_at: DateTime<Utc>,
    /// True when a worker was already live and nothing was spawned
    pub already_running: bool,
}

/// Result of a stop request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// The tracked worker exited
    Stopped {
        pid: u32,
        vehicle_id: String,
        forced: bool,
    },
    /// No tracked worker; leftover workers were killed
    OrphansKilled { pids: Vec<u32> },
    /// Nothing was running
    Idle,
}

impl StopOutcome {
    pub fn stopped_anything(&self) -> bool {
        !matches!(self, StopOutcome::Idle)
    }
}

struct ProcessHandle {
    child: Child,
    pid: u32,
    vehicle_id: String,
    started_at: DateTime<Utc>,
}

impl ProcessHandle {
    /// Reap the child if it has exited; `None` while it is still running
    fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("Could not poll worker {}: {}", self.pid, e);
                None
            }
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            running: true,
            pid: Some(self.pid),
            vehicle_id: Some(self.vehicle_id.clone()),
            started_at: Some(self.started_at),
        }
    }
}

/// Owner of the single acquisition worker.
///
/// Every read-modify-write of the worker slot happens under one async lock,
/// so two concurrent starts can never both observe an empty slot.
pub struct Supervisor {
    config: SupervisorConfig,
    current: Mutex<Option<ProcessHandle>>,
    cache: LiveCache,
    scanner: Arc<dyn ProcessScanner>,
    sample_tx: Option<mpsc::Sender<TelemetrySample>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, cache: LiveCache) -> Self {
        info!(
            "Creating acquisition supervisor for '{}' (marker {})",
            config.program, config.marker
        );
        Self {
            config,
            current: Mutex::new(None),
            cache,
            scanner: Arc::new(SysinfoScanner),
            sample_tx: None,
        }
    }

    /// Replace the orphan scanner
    pub fn with_scanner(mut self, scanner: Arc<dyn ProcessScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Forward every decoded worker sample to `tx`; a full channel pauses the stdout reader
    pub fn with_sample_sink(mut self, tx: mpsc::Sender<TelemetrySample>) -> Self {
        self.sample_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn live_cache(&self) -> &LiveCache {
        &self.cache
    }

    /// Launch a worker for `vehicle_id` unless one is already live.
    pub async fn start(&self, vehicle_id: &str) -> Result<StartReport, SupervisorError> {
        let mut slot = self.current.lock().await;

        if let Some(handle) = slot.as_mut() {
            match handle.exit_status() {
                None => {
                    if handle.vehicle_id != vehicle_id {
                        warn!(
                            "Start for vehicle {} ignored: worker {} is running for vehicle {}",
                            vehicle_id, handle.pid, handle.vehicle_id
                        );
                    }
                    return Ok(StartReport {
                        pid: handle.pid,
                        vehicle_id: handle.vehicle_id.clone(),
                        started_at: handle.started_at,
                        already_running: true,
                    });
                }
                Some(status) => {
                    info!("Worker {} had exited ({}); launching a new one", handle.pid, status);
                }
            }
        }

        let handle = self.spawn(vehicle_id)?;
        let report = StartReport {
            pid: handle.pid,
            vehicle_id: handle.vehicle_id.clone(),
            started_at: handle.started_at,
            already_running: false,
        };
        *slot = Some(handle);
        Ok(report)
    }

    fn spawn(&self, vehicle_id: &str) -> Result<ProcessHandle, SupervisorError> {
        let spawn_error = |reason: String| SupervisorError::Spawn {
            program: self.config.program.clone(),
            reason,
        };

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(vehicle_id)
            .arg(&self.config.marker)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| spawn_error("worker exited immediately".to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_stdout(
                stdout,
                pid,
                self.cache.clone(),
                self.sample_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, pid));
        }

        metrics::counter!("worker_spawns_total").increment(1);
        info!("Started acquisition worker {} for vehicle {}", pid, vehicle_id);

        Ok(ProcessHandle {
            child,
            pid,
            vehicle_id: vehicle_id.to_string(),
            started_at: Utc::now(),
        })
    }

    /// Stop the tracked worker, or kill orphaned workers if none is tracked.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let mut slot = self.current.lock().await;

        if let Some(mut handle) = slot.take() {
            match handle.exit_status() {
                None => {
                    return match self.terminate(&mut handle).await {
                        Ok(forced) => {
                            self.cache.clear();
                            Ok(StopOutcome::Stopped {
                                pid: handle.pid,
                                vehicle_id: handle.vehicle_id,
                                forced,
                            })
                        }
                        Err(e) => {
                            // Keep tracking it so a later stop can retry
                            *slot = Some(handle);
                            Err(e)
                        }
                    };
                }
                Some(status) => {
                    info!("Tracked worker {} already exited ({})", handle.pid, status);
                }
            }
        }

        let pids = self.kill_orphans().await?;
        if pids.is_empty() {
            debug!("Stop requested with no worker running");
            Ok(StopOutcome::Idle)
        } else {
            self.cache.clear();
            Ok(StopOutcome::OrphansKilled { pids })
        }
    }

    /// SIGTERM, bounded wait, then SIGKILL. Returns whether the kill was needed.
    async fn terminate(&self, handle: &mut ProcessHandle) -> Result<bool, SupervisorError> {
        let pid = handle.pid;
        let grace = Duration::from_millis(self.config.stop_timeout_ms);
        info!("Stopping acquisition worker {} (grace {:?})", pid, grace);

        if let Err(e) = request_termination(pid) {
            warn!("SIGTERM to worker {} failed: {}", pid, e);
        }

        match tokio::time::timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => {
                info!("Worker {} exited: {}", pid, status);
                Ok(false)
            }
            Ok(Err(e)) => Err(SupervisorError::Terminate {
                pid,
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!("Worker {} still alive after {:?}; killing", pid, grace);
                handle.child.kill().await.map_err(|e| {
                    error!("Force-kill of worker {} failed: {}", pid, e);
                    SupervisorError::ForceKill {
                        pid,
                        reason: e.to_string(),
                    }
                })?;
                Ok(true)
            }
        }
    }

    async fn kill_orphans(&self) -> Result<Vec<u32>, SupervisorError> {
        let scanner = Arc::clone(&self.scanner);
        let signature = self.config.signature();

        tokio::task::spawn_blocking(move || {
            let pids = scanner.find_workers(&signature)?;
            let mut killed = Vec::with_capacity(pids.len());
            for pid in pids {
                match scanner.kill(pid) {
                    Ok(()) => {
                        warn!("Killed orphaned acquisition worker {}", pid);
                        killed.push(pid);
                    }
                    Err(e) => warn!("Could not kill orphaned worker {}: {}", pid, e),
                }
            }
            Ok(killed)
        })
        .await
        .map_err(|e| SupervisorError::Scan(e.to_string()))?
    }

    /// Whether a worker is live, and which
    pub async fn status(&self) -> WorkerStatus {
        let mut slot = self.current.lock().await;
        let exited = match slot.as_mut() {
            Some(handle) => match handle.exit_status() {
                None => return handle.status(),
                Some(status) => {
                    info!("Worker {} exited on its own: {}", handle.pid, status);
                    true
                }
            },
            None => false,
        };
        if exited {
            *slot = None;
        }
        WorkerStatus::idle()
    }
}

#[cfg(unix)]
fn request_termination(pid: u32) -> std::io::Result<()> {
    crate::scanner::send_signal(pid, libc::SIGTERM)
}

// No graceful signal elsewhere; the wait times out into a kill.
#[cfg(not(unix))]
fn request_termination(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

async fn forward_stdout(
    stdout: impl AsyncRead + Unpin,
    pid: u32,
    cache: LiveCache,
    mut sample_tx: Option<mpsc::Sender<TelemetrySample>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(target: WORKER_LOG_TARGET, "[{}] {}", pid, line);
                if !line.trim_start().starts_with('{') {
                    continue;
                }
                match WorkerPayload::parse_line(&line).and_then(|p| p.into_sample(Utc::now())) {
                    Ok(sample) => {
                        cache.replace(sample.clone());
                        // A full queue holds the reader back, which in turn
                        // blocks the worker on its stdout pipe.
                        let closed = match &sample_tx {
                            Some(tx) => tx.send(sample).await.is_err(),
                            None => false,
                        };
                        if closed {
                            warn!("Sample sink closed; worker {} samples are no longer stored", pid);
                            metrics::counter!("worker_samples_dropped_total").increment(1);
                            sample_tx = None;
                        }
                    }
                    Err(e) => debug!("Worker {} line is not a sample: {}", pid, e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Reading worker {} stdout failed: {}", pid, e);
                break;
            }
        }
    }
    debug!("Worker {} stdout closed", pid);
}

async fn forward_stderr(stderr: impl AsyncRead + Unpin, pid: u32) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: WORKER_LOG_TARGET, "[{}] {}", pid, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry::Channel;

    const IDLE_LOOP: &str = "while true; do sleep 0.1; done";

    fn marker() -> String {
        format!("--acquisition-worker-{}", uuid::Uuid::new_v4().simple())
    }

    fn shell_config(script: &str, marker: &str) -> SupervisorConfig {
        SupervisorConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            marker: marker.to_string(),
            stop_timeout_ms: 2000,
        }
    }

    fn supervisor(script: &str, marker: &str) -> Supervisor {
        Supervisor::new(shell_config(script, marker), LiveCache::new())
    }

    fn live_workers(marker: &str) -> usize {
        SysinfoScanner
            .find_workers(&WorkerSignature::new("sh", marker))
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let marker = marker();
        let supervisor = supervisor(IDLE_LOOP, &marker);

        let first = supervisor.start("4").await.unwrap();
        let second = supervisor.start("4").await.unwrap();

        assert!(!first.already_running);
        assert!(second.already_running);
        assert_eq!(first.pid, second.pid);
        assert_eq!(live_workers(&marker), 1);

        let outcome = supervisor.stop().await.unwrap();
        assert!(matches!(outcome, StopOutcome::Stopped { pid, forced: false, .. } if pid == first.pid));
        assert_eq!(live_workers(&marker), 0);
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_once() {
        let marker = marker();
        let supervisor = Arc::new(supervisor(IDLE_LOOP, &marker));

        let (a, b) = tokio::join!(supervisor.start("4"), supervisor.start("4"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.pid, b.pid);
        assert!(a.already_running != b.already_running);
        assert_eq!(live_workers(&marker), 1);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_vehicle_does_not_spawn() {
        let marker = marker();
        let supervisor = supervisor(IDLE_LOOP, &marker);

        let first = supervisor.start("4").await.unwrap();
        let other = supervisor.start("9").await.unwrap();
        assert!(other.already_running);
        assert_eq!(other.pid, first.pid);
        assert_eq!(other.vehicle_id, "4");

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let supervisor = supervisor(IDLE_LOOP, &marker());
        assert_eq!(supervisor.stop().await.unwrap(), StopOutcome::Idle);
        assert!(!supervisor.status().await.running);
    }

    #[tokio::test]
    async fn test_status_tracks_worker() {
        let supervisor = supervisor(IDLE_LOOP, &marker());
        assert_eq!(supervisor.status().await, WorkerStatus::idle());

        let started = supervisor.start("4").await.unwrap();
        let status = supervisor.status().await;
        assert!(status.running);
        assert_eq!(status.pid, Some(started.pid));
        assert_eq!(status.vehicle_id.as_deref(), Some("4"));

        supervisor.stop().await.unwrap();
        assert!(!supervisor.status().await.running);
    }

    #[tokio::test]
    async fn test_exited_worker_is_not_live() {
        let supervisor = supervisor("exit 0", &marker());
        let first = supervisor.start("4").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while supervisor.status().await.running {
            assert!(tokio::time::Instant::now() < deadline, "worker never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let second = supervisor.start("4").await.unwrap();
        assert!(!second.already_running);
        assert_ne!(second.pid, first.pid);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stubborn_worker_is_force_killed() {
        let marker = marker();
        let mut config = shell_config(&format!("trap '' TERM; {}", IDLE_LOOP), &marker);
        config.stop_timeout_ms = 300;
        let supervisor = Supervisor::new(config, LiveCache::new());

        supervisor.start("4").await.unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = supervisor.stop().await.unwrap();
        assert!(matches!(outcome, StopOutcome::Stopped { forced: true, .. }));
        assert_eq!(live_workers(&marker), 0);
    }

    #[tokio::test]
    async fn test_orphans_from_previous_instance_are_killed() {
        let marker = marker();
        let mut orphan = std::process::Command::new("sh")
            .args(["-c", IDLE_LOOP, "4", marker.as_str()])
            .spawn()
            .unwrap();

        // A fresh supervisor has no handle for it
        let supervisor = supervisor(IDLE_LOOP, &marker);
        let outcome = supervisor.stop().await.unwrap();
        assert_eq!(outcome, StopOutcome::OrphansKilled { pids: vec![orphan.id()] });
        assert!(outcome.stopped_anything());

        orphan.wait().unwrap();
        assert_eq!(supervisor.stop().await.unwrap(), StopOutcome::Idle);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let config = SupervisorConfig {
            program: "/nonexistent/acquisition-worker".to_string(),
            args: Vec::new(),
            marker: marker(),
            stop_timeout_ms: 100,
        };
        let supervisor = Supervisor::new(config, LiveCache::new());

        assert!(matches!(supervisor.start("4").await, Err(SupervisorError::Spawn { .. })));
        assert!(!supervisor.status().await.running);
    }

    #[tokio::test]
    async fn test_worker_output_feeds_live_cache() {
        let script = format!(
            r#"echo 'booting'; echo '{{"motorcycle_id": "4", "data": {{"RPM": 850, "COOLANT_TEMP": 90.5}}}}'; {}"#,
            IDLE_LOOP
        );
        let (tx, mut rx) = mpsc::channel(8);
        let supervisor = supervisor(&script, &marker()).with_sample_sink(tx);
        supervisor.start("4").await.unwrap();

        let forwarded = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.vehicle_id, "4");

        let latest = supervisor.live_cache().latest().unwrap();
        assert_eq!(latest.get(Channel::Rpm), Some(850.0));
        assert_eq!(latest.get(Channel::CoolantTemp), Some(90.5));

        supervisor.stop().await.unwrap();
        assert!(supervisor.live_cache().latest().is_none());
    }

    #[tokio::test]
    async fn test_full_sample_sink_loses_nothing() {
        let script = format!(
            r#"i=0; while [ $i -lt 10 ]; do echo "{{\"motorcycle_id\": \"4\", \"data\": {{\"RPM\": $((800 + i))}}}}"; i=$((i + 1)); done; {}"#,
            IDLE_LOOP
        );
        let (tx, mut rx) = mpsc::channel(1);
        let supervisor = supervisor(&script, &marker()).with_sample_sink(tx);
        supervisor.start("4").await.unwrap();

        // Nobody drains the sink while the worker prints everything
        tokio::time::sleep(Duration::from_millis(700)).await;

        let mut rpms = Vec::new();
        for _ in 0..10 {
            let sample = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            rpms.push(sample.get(Channel::Rpm).unwrap());
        }
        assert_eq!(rpms, (800..810).map(f64::from).collect::<Vec<_>>());

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_sample_sink_keeps_live_cache() {
        let script = format!(
            r#"echo '{{"motorcycle_id": "4", "data": {{"RPM": 850}}}}'; sleep 0.3; echo '{{"motorcycle_id": "4", "data": {{"RPM": 900}}}}'; {}"#,
            IDLE_LOOP
        );
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let supervisor = supervisor(&script, &marker()).with_sample_sink(tx);
        supervisor.start("4").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let rpm = supervisor.live_cache().latest().and_then(|s| s.get(Channel::Rpm));
            if rpm == Some(900.0) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "cache stuck at {:?}", rpm);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        supervisor.stop().await.unwrap();
    }

    /// Scanner with a canned process table
    struct FakeScanner {
        found: Result<Vec<u32>, String>,
        unkillable: Vec<u32>,
        kill_calls: std::sync::Mutex<Vec<u32>>,
    }

    impl FakeScanner {
        fn new(found: Result<Vec<u32>, String>, unkillable: Vec<u32>) -> Arc<Self> {
            Arc::new(Self {
                found,
                unkillable,
                kill_calls: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    impl ProcessScanner for FakeScanner {
        fn find_workers(&self, _signature: &WorkerSignature) -> Result<Vec<u32>, SupervisorError> {
            self.found.clone().map_err(SupervisorError::Scan)
        }

        fn kill(&self, pid: u32) -> Result<(), SupervisorError> {
            self.kill_calls.lock().unwrap().push(pid);
            if self.unkillable.contains(&pid) {
                Err(SupervisorError::Scan(format!("kill({}) not permitted", pid)))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_scan_failure_is_reported_and_supervisor_recovers() {
        let scanner = FakeScanner::new(Err("process table unreadable".to_string()), Vec::new());
        let supervisor = supervisor(IDLE_LOOP, &marker()).with_scanner(scanner);

        let err = supervisor.stop().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Scan(ref msg) if msg.contains("unreadable")));

        let started = supervisor.start("4").await.unwrap();
        assert!(!started.already_running);
        // The tracked worker is stopped without consulting the scanner
        let outcome = supervisor.stop().await.unwrap();
        assert!(matches!(outcome, StopOutcome::Stopped { pid, .. } if pid == started.pid));
    }

    #[tokio::test]
    async fn test_orphan_kill_failures_are_not_reported_as_killed() {
        let scanner = FakeScanner::new(Ok(vec![101, 102, 103]), vec![102]);
        let supervisor = supervisor(IDLE_LOOP, &marker()).with_scanner(Arc::clone(&scanner) as Arc<dyn ProcessScanner>);

        let outcome = supervisor.stop().await.unwrap();
        assert_eq!(outcome, StopOutcome::OrphansKilled { pids: vec![101, 103] });
        assert_eq!(*scanner.kill_calls.lock().unwrap(), vec![101, 102, 103]);
    }
}
