//! Module discovery
//!
//! A bus participant exists if it answers any of a few parameters every Elster
//! module implements (device id, software number).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::correlator::RequestCorrelator;
use crate::error::HeatSrvError;
use crate::protocols::elster::parameter_name;

/// Probes receiver addresses through the correlator
pub struct ModuleScanner {
    correlator: Arc<RequestCorrelator>,
    receivers: Vec<u16>,
    probe_indices: Vec<u16>,
    timeout: Duration,
}

impl ModuleScanner {
    pub fn new(
        correlator: Arc<RequestCorrelator>,
        receivers: Vec<u16>,
        probe_indices: Vec<u16>,
        timeout: Duration,
    ) -> Self {
        Self {
            correlator,
            receivers,
            probe_indices,
            timeout,
        }
    }

    /// Scan the configured candidate receivers
    pub async fn scan_modules(&self, sender: u16) -> BTreeSet<u16> {
        self.scan_receivers(sender, self.receivers.iter().copied())
            .await
    }

    /// Scan an explicit set of receivers
    ///
    /// A receiver that times out on every probe is simply absent. A probe another
    /// caller already has in flight is skipped. Other errors are logged and the
    /// receiver is skipped.
    pub async fn scan_receivers<I>(&self, sender: u16, receivers: I) -> BTreeSet<u16>
    where
        I: IntoIterator<Item = u16>,
    {
        let mut found = BTreeSet::new();
        info!("Scanning Elster modules as 0x{:03x}", sender);

        for receiver in receivers {
            for &index in &self.probe_indices {
                match self
                    .correlator
                    .request_value(sender, receiver, index, self.timeout)
                    .await
                {
                    Ok(value) => {
                        info!(
                            "Found module 0x{:03x} ({} = {})",
                            receiver,
                            parameter_name(index),
                            value
                        );
                        found.insert(receiver);
                        break;
                    },
                    Err(e) if e.is_timeout() => {
                        debug!("No answer from 0x{:03x} for index 0x{:04x}", receiver, index);
                    },
                    Err(HeatSrvError::AlreadyPending(query)) => {
                        debug!("{} already in flight, trying next probe", query);
                    },
                    Err(e) => {
                        warn!("Probe of 0x{:03x} failed: {}", receiver, e);
                        break;
                    },
                }
            }
        }

        let list: Vec<String> = found.iter().map(|r| format!("0x{:03x}", r)).collect();
        info!(
            "Scan complete: {} module(s) found [{}]",
            found.len(),
            list.join(", ")
        );
        found
    }

    pub fn receivers(&self) -> &[u16] {
        &self.receivers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{spawn_frame_pump, PassiveTelegramLog};
    use crate::protocols::can::CanFrame;
    use crate::transport::{FrameTransport, MockFrameTransport};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    fn scanner(receivers: Vec<u16>) -> (ModuleScanner, Arc<MockFrameTransport>, CancellationToken) {
        let (tx, rx) = mpsc::channel::<CanFrame>(32);
        let bus = Arc::new(MockFrameTransport::new(tx));
        let transport: Arc<dyn FrameTransport> = bus.clone();
        let correlator = Arc::new(RequestCorrelator::new(
            transport,
            Arc::new(PassiveTelegramLog::new(16)),
        ));
        let cancel = CancellationToken::new();
        spawn_frame_pump(Arc::clone(&correlator), rx, cancel.clone());

        let scanner = ModuleScanner::new(
            correlator,
            receivers,
            vec![0x000b, 0x0199],
            Duration::from_millis(500),
        );
        (scanner, bus, cancel)
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_scan_reports_responding_module() {
        let (scanner, bus, cancel) = scanner(vec![0x180, 0x181, 0x182, 0x183]);
        bus.answer(0x181, 0x000b, 0x0102);

        let found = scanner.scan_modules(0x680).await;

        assert_eq!(found, BTreeSet::from([0x181]));
        assert!(logs_contain("Found module 0x181"));
        assert!(logs_contain("Scan complete: 1 module(s) found [0x181]"));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_probe_detects_module() {
        let (scanner, bus, cancel) = scanner(vec![0x301]);
        bus.answer(0x301, 0x0199, 0x1234);

        let found = scanner.scan_modules(0x680).await;
        assert_eq!(found, BTreeSet::from([0x301]));
        // both probes went out, the first one unanswered
        assert_eq!(bus.sent_frames().len(), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_in_flight_elsewhere_moves_to_next_index() {
        let (scanner, bus, cancel) = scanner(vec![0x181]);
        bus.answer(0x181, 0x0199, 0x1234);

        let correlator = Arc::clone(&scanner.correlator);
        let other = tokio::spawn(async move {
            correlator
                .request_value(0x680, 0x181, 0x000b, Duration::from_secs(3))
                .await
        });
        while scanner.correlator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let found = scanner.scan_modules(0x680).await;
        assert_eq!(found, BTreeSet::from([0x181]));

        assert!(other.await.unwrap().unwrap_err().is_timeout());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_skips_receiver() {
        let (scanner, bus, cancel) = scanner(vec![0x180, 0x181]);
        bus.set_send_failure(true);

        let found = scanner.scan_modules(0x680).await;
        assert!(found.is_empty());
        // one failed probe per receiver, no retry of the second index
        assert_eq!(bus.stats().send_errors, 2);
        cancel.cancel();
    }
}
