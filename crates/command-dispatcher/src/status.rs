//! Status Events and Error Classification

use crate::ValidationError;
use acquisition_supervisor::SupervisorError;
use feature_engine::FeatureError;
use inference_engine::InferenceError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error categories reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    DataSourceError,
    InsufficientDataError,
    ModelNotFoundError,
    ProcessLifecycleError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::DataSourceError => "data_source_error",
            ErrorKind::InsufficientDataError => "insufficient_data_error",
            ErrorKind::ModelNotFoundError => "model_not_found_error",
            ErrorKind::ProcessLifecycleError => "process_lifecycle_error",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// HTTP-style status code for front ends
    pub fn code(&self) -> u16 {
        match self {
            ErrorKind::ValidationError => 400,
            ErrorKind::ModelNotFoundError => 404,
            ErrorKind::InsufficientDataError => 422,
            ErrorKind::DataSourceError => 503,
            ErrorKind::ProcessLifecycleError | ErrorKind::InternalError => 500,
        }
    }
}

/// A handler failure, classified
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl From<ValidationError> for CommandError {
    fn from(e: ValidationError) -> Self {
        Self::new(ErrorKind::ValidationError, e.to_string())
    }
}

impl From<FeatureError> for CommandError {
    fn from(e: FeatureError) -> Self {
        let kind = match &e {
            FeatureError::DataSource(_) => ErrorKind::DataSourceError,
            FeatureError::InsufficientData { .. } => ErrorKind::InsufficientDataError,
            FeatureError::Decode(_) => ErrorKind::ValidationError,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<InferenceError> for CommandError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::Feature(inner) => inner.into(),
            InferenceError::ModelNotFound { .. } => Self::new(ErrorKind::ModelNotFoundError, e.to_string()),
            InferenceError::InvalidKey(_) => Self::new(ErrorKind::ValidationError, e.to_string()),
            InferenceError::Artifact(_) | InferenceError::Task(_) | InferenceError::Forest(_) => {
                Self::internal(e.to_string())
            }
        }
    }
}

impl From<SupervisorError> for CommandError {
    fn from(e: SupervisorError) -> Self {
        Self::new(ErrorKind::ProcessLifecycleError, e.to_string())
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(format!("failed to encode result: {}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Error,
}

/// The single reply published for every command.
///
/// Success events carry the handler's result fields at the top level; error
/// events carry `error`, `code` and `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: Outcome,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub result: Map<String, Value>,
}

impl StatusEvent {
    pub fn ok(kind: &str, result: Map<String, Value>) -> Self {
        Self {
            status: Outcome::Ok,
            kind: Some(kind.to_string()),
            request_id: None,
            vehicle_id: None,
            error: None,
            code: None,
            message: None,
            result,
        }
    }

    pub fn failed(kind: Option<&str>, error: &CommandError) -> Self {
        Self {
            status: Outcome::Error,
            kind: kind.map(str::to_string),
            request_id: None,
            vehicle_id: None,
            error: Some(error.kind),
            code: Some(error.kind.code()),
            message: Some(error.message.clone()),
            result: Map::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_vehicle_id(mut self, vehicle_id: Option<String>) -> Self {
        self.vehicle_id = vehicle_id;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Outcome::Ok
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|e| {
            format!(
                r#"{{"status":"error","error":"internal_error","code":500,"message":"unencodable status event: {}"}}"#,
                e
            )
            .into_bytes()
        })
    }
}
