//! Test Common Utilities
//!
//! Builds a gateway on top of the mock bus, with the frame pump running.

#![allow(dead_code)]

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use heatsrv::config::ElsterConfig;
use heatsrv::gateway::ElsterGateway;
use heatsrv::protocols::can::CanFrame;
use heatsrv::protocols::elster::{encode_telegram, TelegramType};
use heatsrv::transport::{FrameTransport, MockFrameTransport};

pub const GATEWAY_ID: u16 = 0x680;

pub struct TestBus {
    pub gateway: Arc<ElsterGateway>,
    pub bus: Arc<MockFrameTransport>,
    pub cancel: CancellationToken,
}

impl TestBus {
    pub fn new() -> Self {
        Self::with_config(&ElsterConfig::default())
    }

    pub fn with_config(config: &ElsterConfig) -> Self {
        let (tx, rx) = mpsc::channel::<CanFrame>(64);
        let bus = Arc::new(MockFrameTransport::new(tx));
        let transport: Arc<dyn FrameTransport> = bus.clone();
        let gateway = Arc::new(ElsterGateway::new(transport, GATEWAY_ID, config));
        let cancel = CancellationToken::new();
        gateway.spawn_frame_pump(rx, cancel.clone());

        Self {
            gateway,
            bus,
            cancel,
        }
    }

    /// Wait until the correlator holds `count` pending requests
    pub async fn wait_pending(&self, count: usize) {
        while self.gateway.correlator().pending_count() != count {
            tokio::task::yield_now().await;
        }
    }
}

impl Drop for TestBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Response telegram from `module` to `receiver`
pub fn response(module: u16, receiver: u16, index: u16, raw: u16) -> CanFrame {
    encode_telegram(module, receiver, TelegramType::Response, index, raw)
        .expect("valid telegram")
}
