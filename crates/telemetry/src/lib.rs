//! Vehicle Telemetry Model
//!
//! Defines the fixed set of tracked sensor channels, the immutable telemetry
//! sample produced by the acquisition worker, and the live cache holding the
//! most recent sample seen on the worker's output.

mod cache;
mod channel;
mod sample;

pub use cache::LiveCache;
pub use channel::{Channel, CHANNEL_COUNT};
pub use sample::{TelemetrySample, WorkerPayload};

use thiserror::Error;

/// Errors while decoding telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    #[error("Invalid worker payload: {0}")]
    InvalidPayload(String),
}
