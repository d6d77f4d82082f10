//! Error handling for the heating gateway
//!
//! Bus-side and broker-side failures share one error type so callers can propagate
//! with `?`, but none of them is fatal to the process: the correlator and the publish
//! queue log and keep running.

use std::time::Duration;

use thiserror::Error;

use crate::protocols::elster::ElsterQuery;
use crate::transport::TransportError;

/// Heating gateway error type
#[derive(Error, Debug, Clone)]
pub enum HeatSrvError {
    /// Query outside the Elster address or parameter code space
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A request for the same triple is still waiting for its response
    #[error("Request already pending: {0}")]
    AlreadyPending(ElsterQuery),

    /// No matching response arrived within the bound
    #[error("Timeout after {timeout:?} waiting for {query}")]
    Timeout {
        query: ElsterQuery,
        timeout: Duration,
    },

    /// Frame transport failures (serial port, SLCAN adapter)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Broker connection could not be established
    #[error("Connect error: {0}")]
    Connect(String),

    /// Broker rejected or failed a publish
    #[error("Publish error: {0}")]
    Publish(String),

    /// Operation requires a broker connection
    #[error("Not connected")]
    NotConnected,

    /// Publish queue no longer accepts items (after shutdown)
    #[error("Publish queue closed")]
    QueueClosed,

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(String),
}

impl HeatSrvError {
    /// Whether the error only means the bus participant did not answer
    pub fn is_timeout(&self) -> bool {
        matches!(self, HeatSrvError::Timeout { .. })
    }
}

/// Result type alias for the heating gateway
pub type Result<T> = std::result::Result<T, HeatSrvError>;

impl From<std::io::Error> for HeatSrvError {
    fn from(err: std::io::Error) -> Self {
        HeatSrvError::Io(err.to_string())
    }
}

impl From<figment::Error> for HeatSrvError {
    fn from(err: figment::Error) -> Self {
        HeatSrvError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for HeatSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        HeatSrvError::Config(format!("YAML error: {err}"))
    }
}

impl From<tokio_serial::Error> for HeatSrvError {
    fn from(err: tokio_serial::Error) -> Self {
        HeatSrvError::Transport(err.into())
    }
}

impl From<rumqttc::ClientError> for HeatSrvError {
    fn from(err: rumqttc::ClientError) -> Self {
        HeatSrvError::Publish(err.to_string())
    }
}
