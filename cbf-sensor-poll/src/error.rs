//! Error taxonomy for the poller
//!
//! Per-host and per-array failures are contained by the caller; only
//! connection and discovery failures travel up to the supervisor.

use crate::katcp::Endpoint;
use crate::literal::LiteralError;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, PollError>;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Transport never reached the running state in time
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: Endpoint, timeout: Duration },

    /// Reply was not ok, never arrived, or could not be parsed
    #[error("KATCP ?{request} failed: {reason}")]
    Protocol { request: String, reason: String },

    #[error("session to {0} is disconnected")]
    Disconnected(Endpoint),

    #[error("no running array on {0}")]
    NoRunningArray(Endpoint),

    /// One of the mapping sensors could not be fetched or parsed
    #[error("missing sensor {sensor}: {reason}")]
    MissingSensor { sensor: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("literal payload error: {0}")]
    Literal(#[from] LiteralError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PollError {
    pub fn protocol(request: &str, reason: impl Into<String>) -> Self {
        PollError::Protocol {
            request: request.to_string(),
            reason: reason.into(),
        }
    }

    pub fn missing_sensor(sensor: &str, reason: impl Into<String>) -> Self {
        PollError::MissingSensor {
            sensor: sensor.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the error means the underlying connection is gone and the
    /// owning session has to be replaced.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            PollError::Disconnected(_) | PollError::ConnectTimeout { .. }
        )
    }
}
