//! Outbound publishing
//!
//! Readings produced on the bus side are cached, deduplicated and drained to
//! the MQTT broker independently of broker availability.

pub mod client;
pub mod manager;
pub mod mock;
pub mod queue;
pub mod readings;
pub mod reconnect;

pub use client::{BrokerAddress, MessageTransport, RumqttcTransport};
pub use manager::{PublishQueue, PublishStats, PublisherSettings};
pub use mock::{MockMessageTransport, PublishedMessage};
pub use queue::{OutboundItem, OutboundQueue};
pub use readings::{Reading, ReadingCache};
pub use reconnect::{ReconnectHelper, ReconnectPolicy, ReconnectStats};

use serde::Serialize;
use std::fmt;

/// Broker session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(text)
    }
}
