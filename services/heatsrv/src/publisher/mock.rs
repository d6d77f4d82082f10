//! Mock Message Transport for Testing
//!
//! Records every publish and lets tests script broker availability.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::MessageTransport;
use crate::error::{HeatSrvError, Result};

/// One recorded publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    fail_connect: bool,
    fail_publish: bool,
    connect_attempts: u32,
    disconnects: u32,
    publish_attempts: u32,
    published: Vec<PublishedMessage>,
}

/// Mock broker session
#[derive(Debug, Default)]
pub struct MockMessageTransport {
    state: Mutex<MockState>,
}

impl MockMessageTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connection attempts fail (for testing)
    pub fn set_connect_failure(&self, should_fail: bool) {
        self.state.lock().fail_connect = should_fail;
    }

    /// Make publishes fail while staying connected (for testing)
    pub fn set_publish_failure(&self, should_fail: bool) {
        self.state.lock().fail_publish = should_fail;
    }

    /// Simulate the broker going away
    pub fn drop_connection(&self) {
        self.state.lock().connected = false;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn disconnects(&self) -> u32 {
        self.state.lock().disconnects
    }

    /// Publishes tried, successful or not
    pub fn publish_attempts(&self) -> u32 {
        self.state.lock().publish_attempts
    }

    /// Successfully published messages in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }
}

#[async_trait]
impl MessageTransport for MockMessageTransport {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.fail_connect {
            return Err(HeatSrvError::Connect("mock broker unavailable".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.connected = false;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.publish_attempts += 1;
        if !state.connected {
            return Err(HeatSrvError::NotConnected);
        }
        if state.fail_publish {
            return Err(HeatSrvError::Publish("mock publish failure".to_string()));
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}
