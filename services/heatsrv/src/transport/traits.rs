//! Frame Transport Traits
//!
//! The gateway only needs two things from the bus: a way to put a frame on it and
//! a stream of everything that comes back. Outbound frames go through
//! [`FrameTransport::send`]; inbound frames are pushed by the transport into the
//! `mpsc::Sender<CanFrame>` it was created with.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

use crate::protocols::can::CanFrame;

/// Frame transport error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport has not been opened or was closed
    #[error("Transport not open")]
    NotOpen,

    /// Frame violates CAN 2.0 limits
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Opening the device failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Adapter rejected a command or sent garbage
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::IoError(err.to_string())
    }
}

impl From<tokio_serial::Error> for TransportError {
    fn from(err: tokio_serial::Error) -> Self {
        TransportError::ConnectionFailed(err.to_string())
    }
}

/// Frame counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub last_activity: Option<SystemTime>,
}

impl TransportStats {
    pub fn record_sent(&mut self) {
        self.frames_sent += 1;
        self.last_activity = Some(SystemTime::now());
    }

    pub fn record_received(&mut self) {
        self.frames_received += 1;
        self.last_activity = Some(SystemTime::now());
    }

    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    pub fn record_receive_error(&mut self) {
        self.receive_errors += 1;
    }
}

/// Outbound half of a CAN bus transport
#[async_trait]
pub trait FrameTransport: Send + Sync + fmt::Debug {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Put one frame on the bus
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Snapshot of the frame counters
    fn stats(&self) -> TransportStats;
}
