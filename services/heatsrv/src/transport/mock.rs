//! Mock Frame Transport for Testing
//!
//! Records every frame sent and answers Elster read requests from a scripted
//! table, so correlator and scanner logic can be exercised without a USBtin.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::traits::{FrameTransport, TransportError, TransportStats};
use crate::protocols::can::CanFrame;
use crate::protocols::elster::{decode_frame, encode_telegram, TelegramType};

#[derive(Debug, Default)]
struct MockState {
    /// History of sent frames
    sent: Vec<CanFrame>,
    /// (receiver, index) -> raw value answered to read requests
    answers: HashMap<(u16, u16), u16>,
    should_fail_send: bool,
    stats: TransportStats,
}

/// Mock transport implementation
#[derive(Debug)]
pub struct MockFrameTransport {
    name: String,
    inbound: mpsc::Sender<CanFrame>,
    state: Mutex<MockState>,
}

impl MockFrameTransport {
    /// Create a mock that delivers its replies into `inbound`
    pub fn new(inbound: mpsc::Sender<CanFrame>) -> Self {
        Self {
            name: "Mock Transport".to_string(),
            inbound,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Answer read requests for `index` on `receiver` with `raw`
    pub fn answer(&self, receiver: u16, index: u16, raw: u16) {
        self.state.lock().answers.insert((receiver, index), raw);
    }

    /// Stop answering a previously scripted parameter
    pub fn forget(&self, receiver: u16, index: u16) {
        self.state.lock().answers.remove(&(receiver, index));
    }

    /// Set send failure mode (for testing)
    pub fn set_send_failure(&self, should_fail: bool) {
        self.state.lock().should_fail_send = should_fail;
    }

    /// Get all sent frames (for testing)
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.state.lock().sent.clone()
    }

    /// Clear all sent frames (for testing)
    pub fn clear_sent_frames(&self) {
        self.state.lock().sent.clear();
    }

    /// Deliver an unsolicited frame as if it came from the bus
    pub fn inject(&self, frame: CanFrame) -> Result<(), TransportError> {
        self.inbound
            .try_send(frame)
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        self.state.lock().stats.record_received();
        Ok(())
    }

    fn scripted_reply(&self, frame: &CanFrame) -> Option<CanFrame> {
        let telegram = decode_frame(frame).ok()?;
        if telegram.kind != TelegramType::Read {
            return None;
        }

        let raw = *self
            .state
            .lock()
            .answers
            .get(&(telegram.receiver, telegram.index()))?;

        encode_telegram(
            telegram.receiver,
            telegram.sender,
            TelegramType::Response,
            telegram.index(),
            raw,
        )
        .ok()
    }
}

#[async_trait]
impl FrameTransport for MockFrameTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.should_fail_send {
                state.stats.record_send_error();
                return Err(TransportError::SendFailed(
                    "Mock send failure".to_string(),
                ));
            }
            state.sent.push(*frame);
            state.stats.record_sent();
        }
        debug!("Mock tx {}", frame);

        if let Some(reply) = self.scripted_reply(frame) {
            debug!("Mock rx {}", reply);
            self.inject(reply)?;
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.state.lock().stats.clone()
    }
}
