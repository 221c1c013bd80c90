//! Command Dispatch
//!
//! Turns control-channel messages into supervisor and model operations and
//! answers every message with exactly one status event:
//! - Command parsing with legacy aliases and field validation
//! - Error classification into caller-facing kinds and codes
//! - MQTT command bus with one task per command

mod bus;
mod command;
mod dispatcher;
mod status;

pub use bus::{BusConfig, CommandBus};
pub use command::{parse_request, Command, CommandKind, Rejected, Request, DEFAULT_WINDOW_MINUTES};
pub use dispatcher::Dispatcher;
pub use status::{CommandError, ErrorKind, Outcome, StatusEvent};

use thiserror::Error;

/// Malformed or incomplete commands
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Malformed command: {0}")]
    Malformed(String),
}

/// Command bus errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
    #[error("Publish failed: {0}")]
    Publish(String),
}
