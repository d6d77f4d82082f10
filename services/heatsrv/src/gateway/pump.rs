//! Inbound frame pump
//!
//! Drains the transport's frame channel into `RequestCorrelator::on_frame`.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::correlator::RequestCorrelator;
use crate::protocols::can::CanFrame;

/// Spawn the pump; it ends on cancellation or when every sender is gone
pub fn spawn_frame_pump(
    correlator: Arc<RequestCorrelator>,
    mut frames: mpsc::Receiver<CanFrame>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Frame pump started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        correlator.on_frame(&frame);
                    },
                    None => {
                        info!("Frame source closed");
                        break;
                    },
                },
            }
        }
        debug!("Frame pump stopped");
    })
}
