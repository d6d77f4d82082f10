//! Elster Gateway
//!
//! Turns the broadcast CAN bus into request/response semantics:
//! - `correlator`: matches responses to pending reads
//! - `scanner`: discovers bus participants
//! - `passive`: keeps what nobody asked for
//! - `pump`: feeds inbound frames to the correlator

pub mod correlator;
pub mod passive;
pub mod pump;
pub mod scanner;

pub use correlator::{FrameDisposition, PendingInfo, RequestCorrelator};
pub use passive::{PassiveKey, PassiveTelegram, PassiveTelegramLog};
pub use pump::spawn_frame_pump;
pub use scanner::ModuleScanner;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ElsterConfig;
use crate::error::Result;
use crate::protocols::can::CanFrame;
use crate::protocols::elster::ElsterValue;
use crate::transport::FrameTransport;

/// Bus-side operations used by the service and the CLI
pub struct ElsterGateway {
    correlator: Arc<RequestCorrelator>,
    scanner: ModuleScanner,
    sender_id: u16,
    request_timeout: Duration,
}

impl ElsterGateway {
    pub fn new(transport: Arc<dyn FrameTransport>, sender_id: u16, config: &ElsterConfig) -> Self {
        let passive = Arc::new(PassiveTelegramLog::new(config.passive_capacity));
        let correlator = Arc::new(RequestCorrelator::new(transport, passive));
        let scanner = ModuleScanner::new(
            Arc::clone(&correlator),
            config.scan.receivers.clone(),
            config.scan.probe_indices.clone(),
            config.scan.timeout(),
        );

        Self {
            correlator,
            scanner,
            sender_id,
            request_timeout: config.request_timeout(),
        }
    }

    /// Start dispatching frames from the transport's inbound channel
    pub fn spawn_frame_pump(
        &self,
        frames: mpsc::Receiver<CanFrame>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        spawn_frame_pump(Arc::clone(&self.correlator), frames, cancel)
    }

    /// Read a parameter as our own sender address with the configured timeout
    pub async fn request_value(&self, receiver: u16, index: u16) -> Result<ElsterValue> {
        self.correlator
            .request_value(self.sender_id, receiver, index, self.request_timeout)
            .await
    }

    /// Read a parameter with full control over addressing and timeout
    pub async fn request_value_as(
        &self,
        sender: u16,
        receiver: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<ElsterValue> {
        self.correlator
            .request_value(sender, receiver, index, timeout)
            .await
    }

    /// Probe the configured receivers, as `sender` or our own address
    pub async fn scan_modules(&self, sender: Option<u16>) -> BTreeSet<u16> {
        self.scanner
            .scan_modules(sender.unwrap_or(self.sender_id))
            .await
    }

    /// Probe an explicit receiver range
    pub async fn scan_receivers<I>(&self, sender: Option<u16>, receivers: I) -> BTreeSet<u16>
    where
        I: IntoIterator<Item = u16>,
    {
        self.scanner
            .scan_receivers(sender.unwrap_or(self.sender_id), receivers)
            .await
    }

    pub fn list_passive_telegrams(&self) -> Vec<PassiveTelegram> {
        self.correlator.passive().list()
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn sender_id(&self) -> u16 {
        self.sender_id
    }
}
