//! Command Parsing and Validation

use crate::ValidationError;
use inference_engine::{DEFAULT_SCORE_MINUTES, DEFAULT_TRAIN_MINUTES};
use serde_json::{Map, Value};

/// Default look-back for live windows
pub const DEFAULT_WINDOW_MINUTES: u64 = 30;

const DAY_MINUTES: u64 = 24 * 60;

/// Command kinds accepted on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    StartAcquisition,
    StopAcquisition,
    Status,
    TrainModel,
    Score,
    ScoreFromUpload,
    FetchWindow,
    ReportDaily,
    ReportWeekly,
}

impl CommandKind {
    pub const ALL: [CommandKind; 9] = [
        CommandKind::StartAcquisition,
        CommandKind::StopAcquisition,
        CommandKind::Status,
        CommandKind::TrainModel,
        CommandKind::Score,
        CommandKind::ScoreFromUpload,
        CommandKind::FetchWindow,
        CommandKind::ReportDaily,
        CommandKind::ReportWeekly,
    ];

    /// Canonical name, echoed as the status event `type`
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::StartAcquisition => "start-acquisition",
            CommandKind::StopAcquisition => "stop-acquisition",
            CommandKind::Status => "status",
            CommandKind::TrainModel => "train-model",
            CommandKind::Score => "score",
            CommandKind::ScoreFromUpload => "score-from-upload",
            CommandKind::FetchWindow => "fetch-window",
            CommandKind::ReportDaily => "report-daily",
            CommandKind::ReportWeekly => "report-weekly",
        }
    }

    /// Resolve a canonical name or legacy alias
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name.trim() {
            "start-acquisition" | "start-obd" => CommandKind::StartAcquisition,
            "stop-acquisition" | "stop-obd" => CommandKind::StopAcquisition,
            "status" => CommandKind::Status,
            "train-model" => CommandKind::TrainModel,
            "score" | "predict" => CommandKind::Score,
            "score-from-upload" | "predict-from-csv" => CommandKind::ScoreFromUpload,
            "fetch-window" | "recent-data" => CommandKind::FetchWindow,
            "report-daily" => CommandKind::ReportDaily,
            "report-weekly" => CommandKind::ReportWeekly,
            _ => return None,
        };
        Some(kind)
    }
}

/// A validated command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartAcquisition {
        vehicle_id: String,
    },
    StopAcquisition,
    Status,
    TrainModel {
        vehicle_id: String,
        brand: String,
        minutes: u64,
    },
    Score {
        vehicle_id: String,
        brand: String,
        model_name: String,
        minutes: u64,
    },
    ScoreFromUpload {
        vehicle_id: String,
        brand: String,
        model_name: String,
        file_base64: String,
    },
    FetchWindow {
        vehicle_id: String,
        minutes: u64,
    },
    Report {
        vehicle_id: String,
        kind: CommandKind,
        minutes: u64,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::StartAcquisition { .. } => CommandKind::StartAcquisition,
            Command::StopAcquisition => CommandKind::StopAcquisition,
            Command::Status => CommandKind::Status,
            Command::TrainModel { .. } => CommandKind::TrainModel,
            Command::Score { .. } => CommandKind::Score,
            Command::ScoreFromUpload { .. } => CommandKind::ScoreFromUpload,
            Command::FetchWindow { .. } => CommandKind::FetchWindow,
            Command::Report { kind, .. } => *kind,
        }
    }

    pub fn vehicle_id(&self) -> Option<&str> {
        match self {
            Command::StartAcquisition { vehicle_id }
            | Command::TrainModel { vehicle_id, .. }
            | Command::Score { vehicle_id, .. }
            | Command::ScoreFromUpload { vehicle_id, .. }
            | Command::FetchWindow { vehicle_id, .. }
            | Command::Report { vehicle_id, .. } => Some(vehicle_id),
            Command::StopAcquisition | Command::Status => None,
        }
    }
}

/// A command plus its correlation id
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: Option<String>,
    pub command: Command,
}

/// A message that could not be turned into a command.
///
/// Carries whatever could be recovered so the error event still correlates.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub request_id: Option<String>,
    /// The `command` field as sent, when present
    pub kind: Option<String>,
    pub vehicle_id: Option<String>,
    pub error: ValidationError,
}

/// Parse one raw control-channel message
pub fn parse_request(raw: &[u8]) -> Result<Request, Rejected> {
    let object = match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(object)) => object,
        Ok(_) => {
            return Err(Rejected {
                request_id: None,
                kind: None,
                vehicle_id: None,
                error: ValidationError::Malformed("command must be a JSON object".to_string()),
            })
        }
        Err(e) => {
            return Err(Rejected {
                request_id: None,
                kind: None,
                vehicle_id: None,
                error: ValidationError::Malformed(e.to_string()),
            })
        }
    };

    let fields = Fields(&object);
    let request_id = fields.request_id();
    let kind_name = object.get("command").and_then(Value::as_str).map(str::to_string);
    let reject = |error: ValidationError| Rejected {
        request_id: request_id.clone(),
        kind: kind_name.clone(),
        vehicle_id: fields.vehicle_id().ok(),
        error,
    };

    let kind = match &kind_name {
        Some(name) => CommandKind::from_name(name)
            .ok_or_else(|| reject(ValidationError::UnknownCommand(name.clone())))?,
        None => return Err(reject(ValidationError::MissingField("command"))),
    };

    let command = parse_command(kind, &fields).map_err(reject)?;
    Ok(Request {
        request_id,
        command,
    })
}

fn parse_command(kind: CommandKind, fields: &Fields<'_>) -> Result<Command, ValidationError> {
    let command = match kind {
        CommandKind::StartAcquisition => Command::StartAcquisition {
            vehicle_id: fields.vehicle_id()?,
        },
        CommandKind::StopAcquisition => Command::StopAcquisition,
        CommandKind::Status => Command::Status,
        CommandKind::TrainModel => Command::TrainModel {
            vehicle_id: fields.vehicle_id()?,
            brand: fields.required_str("brand", &["brand"])?,
            minutes: fields.minutes(DEFAULT_TRAIN_MINUTES)?,
        },
        CommandKind::Score => Command::Score {
            vehicle_id: fields.vehicle_id()?,
            brand: fields.required_str("brand", &["brand"])?,
            model_name: fields.required_str("model", &["model", "model_name"])?,
            minutes: fields.minutes(DEFAULT_SCORE_MINUTES)?,
        },
        CommandKind::ScoreFromUpload => Command::ScoreFromUpload {
            vehicle_id: fields.vehicle_id()?,
            brand: fields.required_str("brand", &["brand"])?,
            model_name: fields.required_str("model", &["model", "model_name"])?,
            file_base64: fields.required_str("file_base64", &["file_base64"])?,
        },
        CommandKind::FetchWindow => Command::FetchWindow {
            vehicle_id: fields.vehicle_id()?,
            minutes: fields.minutes(DEFAULT_WINDOW_MINUTES)?,
        },
        CommandKind::ReportDaily => Command::Report {
            vehicle_id: fields.vehicle_id()?,
            kind,
            minutes: DAY_MINUTES,
        },
        CommandKind::ReportWeekly => Command::Report {
            vehicle_id: fields.vehicle_id()?,
            kind,
            minutes: 7 * DAY_MINUTES,
        },
    };
    Ok(command)
}

struct Fields<'a>(&'a Map<String, Value>);

impl Fields<'_> {
    fn first<'n>(&self, names: &[&'n str]) -> Option<(&'n str, &Value)> {
        names
            .iter()
            .find_map(|name| self.0.get(*name).filter(|v| !v.is_null()).map(|v| (*name, v)))
    }

    /// Non-empty string or number, as a string
    fn required_str(&self, field: &'static str, names: &[&str]) -> Result<String, ValidationError> {
        match self.first(names) {
            None => Err(ValidationError::MissingField(field)),
            Some((_, Value::String(s))) if s.trim().is_empty() => Err(ValidationError::MissingField(field)),
            Some((_, Value::String(s))) => Ok(s.trim().to_string()),
            Some((_, Value::Number(n))) => Ok(n.to_string()),
            Some((name, other)) => Err(ValidationError::InvalidField {
                field: name.to_string(),
                reason: format!("expected a string, got {}", type_name(other)),
            }),
        }
    }

    fn vehicle_id(&self) -> Result<String, ValidationError> {
        self.required_str("motorcycle_id", &["motorcycle_id", "vehicle_id"])
    }

    fn request_id(&self) -> Option<String> {
        match self.first(&["request_id"]) {
            Some((_, Value::String(s))) => Some(s.clone()),
            Some((_, Value::Number(n))) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Positive whole minutes, `default` when absent
    fn minutes(&self, default: u64) -> Result<u64, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidField {
            field: "minutes".to_string(),
            reason,
        };
        let minutes = match self.first(&["minutes"]) {
            None => return Ok(default),
            Some((_, Value::Number(n))) => n
                .as_u64()
                .ok_or_else(|| invalid(format!("{} is not a whole number of minutes", n)))?,
            Some((_, Value::String(s))) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| invalid(format!("'{}' is not a whole number of minutes", s)))?,
            Some((_, other)) => return Err(invalid(format!("expected a number, got {}", type_name(other)))),
        };
        if minutes == 0 {
            return Err(invalid("must be at least 1".to_string()));
        }
        Ok(minutes)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
