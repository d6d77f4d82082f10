//! Request correlator
//!
//! Elster responses carry no request id. A response from `R` to `S` for index
//! `I` is matched to the pending read `S -> R, I`, so only one read per triple
//! may be in flight at a time.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::passive::PassiveTelegramLog;
use crate::error::{HeatSrvError, Result};
use crate::protocols::can::CanFrame;
use crate::protocols::elster::{
    decode_frame, encode_query, ElsterQuery, ElsterValue, TelegramType,
};
use crate::transport::FrameTransport;

struct PendingRequest {
    id: u64,
    created_at: Instant,
    responder: oneshot::Sender<ElsterValue>,
}

type PendingMap = Mutex<HashMap<ElsterQuery, PendingRequest>>;

/// Removes this call's entry on every exit path, unless a newer request for the
/// same triple has taken the slot in the meantime.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    query: ElsterQuery,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.get(&self.query).is_some_and(|entry| entry.id == self.id) {
            pending.remove(&self.query);
        }
    }
}

/// What `on_frame` did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Woke the caller waiting for this query
    Resolved(ElsterQuery),
    /// Filed in the passive telegram log
    Passive,
}

/// In-flight request, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct PendingInfo {
    pub query: ElsterQuery,
    pub age: Duration,
}

/// Matches bus responses to outstanding reads
pub struct RequestCorrelator {
    transport: Arc<dyn FrameTransport>,
    passive: Arc<PassiveTelegramLog>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl RequestCorrelator {
    pub fn new(transport: Arc<dyn FrameTransport>, passive: Arc<PassiveTelegramLog>) -> Self {
        Self {
            transport,
            passive,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Read one parameter and wait up to `timeout` for the answer
    ///
    /// Fails fast with `AlreadyPending` if the same triple is already in flight.
    /// On `Timeout` the pending entry is gone, so the caller may retry at once.
    pub async fn request_value(
        &self,
        sender: u16,
        receiver: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<ElsterValue> {
        let query = ElsterQuery::new(sender, receiver, index);
        let frame = encode_query(&query)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, mut response) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&query) {
                return Err(HeatSrvError::AlreadyPending(query));
            }
            pending.insert(
                query,
                PendingRequest {
                    id,
                    created_at: Instant::now(),
                    responder,
                },
            );
        }
        let guard = PendingGuard {
            pending: &self.pending,
            query,
            id,
        };

        if let Err(e) = self.transport.send(&frame).await {
            warn!("Failed to send request {}: {}", query, e);
            return Err(e.into());
        }
        debug!("Request {} sent via {}", query, self.transport.name());

        match tokio::time::timeout(timeout, &mut response).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(HeatSrvError::Timeout { query, timeout }),
            Err(_) => {
                drop(guard);
                // on_frame resolves under the same lock, so a value that won the
                // race is already in the channel
                match response.try_recv() {
                    Ok(value) => Ok(value),
                    Err(_) => {
                        debug!("Request {} timed out after {:?}", query, timeout);
                        Err(HeatSrvError::Timeout { query, timeout })
                    },
                }
            },
        }
    }

    /// Dispatch one inbound frame
    ///
    /// Runs on the frame delivery path: decode, one map lookup, no awaiting.
    pub fn on_frame(&self, frame: &CanFrame) -> FrameDisposition {
        let decoded = decode_frame(frame);

        match &decoded {
            Ok(telegram) if telegram.kind == TelegramType::Response => {
                let query = telegram.answers();
                let mut pending = self.pending.lock();
                if let Some(entry) = pending.remove(&query) {
                    let elapsed = entry.created_at.elapsed();
                    if entry.responder.send(telegram.value.clone()).is_ok() {
                        drop(pending);
                        debug!(
                            "Resolved {} = {} after {:?}",
                            query, telegram.value, elapsed
                        );
                        return FrameDisposition::Resolved(query);
                    }
                    debug!("Caller for {} already gone", query);
                }
            },
            Ok(_) => {},
            Err(reason) => debug!("Unrecognized frame {}: {}", frame, reason),
        }

        self.passive.record(frame, &decoded);
        FrameDisposition::Passive
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, query: &ElsterQuery) -> bool {
        self.pending.lock().contains_key(query)
    }

    /// In-flight requests, oldest first
    pub fn pending(&self) -> Vec<PendingInfo> {
        let pending = self.pending.lock();
        let mut list: Vec<_> = pending
            .iter()
            .map(|(query, entry)| PendingInfo {
                query: *query,
                age: entry.created_at.elapsed(),
            })
            .collect();
        list.sort_by(|a, b| b.age.cmp(&a.age));
        list
    }

    pub fn passive(&self) -> &Arc<PassiveTelegramLog> {
        &self.passive
    }

    pub fn transport(&self) -> &Arc<dyn FrameTransport> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::elster::{encode_telegram, DecodedValue};
    use crate::transport::{MockFrameTransport, TransportError};
    use tokio::sync::mpsc;

    fn setup() -> (
        Arc<RequestCorrelator>,
        Arc<MockFrameTransport>,
        mpsc::Receiver<CanFrame>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let transport = Arc::new(MockFrameTransport::new(tx));
        let correlator = Arc::new(RequestCorrelator::new(
            transport.clone(),
            Arc::new(PassiveTelegramLog::new(16)),
        ));
        (correlator, transport, rx)
    }

    fn response(sender: u16, receiver: u16, index: u16, raw: u16) -> CanFrame {
        encode_telegram(sender, receiver, TelegramType::Response, index, raw).unwrap()
    }

    #[tokio::test]
    async fn test_request_resolved_by_matching_response() {
        let (correlator, transport, _rx) = setup();

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .request_value(0x680, 0x180, 0x000c, Duration::from_secs(3))
                    .await
            })
        };

        while correlator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.sent_frames().len(), 1);

        let disposition = correlator.on_frame(&response(0x180, 0x680, 0x000c, 0x0037));
        assert_eq!(
            disposition,
            FrameDisposition::Resolved(ElsterQuery::new(0x680, 0x180, 0x000c))
        );

        let value = task.await.unwrap().unwrap();
        assert_eq!(
            value.decoded,
            DecodedValue::Fixed {
                value: 5.5,
                decimals: 1
            }
        );
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_for_other_triple_is_passive() {
        let (correlator, _transport, _rx) = setup();
        let disposition = correlator.on_frame(&response(0x180, 0x680, 0x000c, 0x0037));
        assert_eq!(disposition, FrameDisposition::Passive);
        assert_eq!(correlator.passive().len(), 1);
    }

    #[tokio::test]
    async fn test_read_telegram_never_resolves() {
        let (correlator, _transport, _rx) = setup();
        // another bus master reading from us looks like our triple but is a read
        let read = encode_telegram(0x180, 0x680, TelegramType::Read, 0x000c, 0).unwrap();
        assert_eq!(correlator.on_frame(&read), FrameDisposition::Passive);
    }

    #[tokio::test]
    async fn test_invalid_parameter_rejected_before_registering() {
        let (correlator, transport, _rx) = setup();
        let err = correlator
            .request_value(0x680, 0x180, 0xFFFF, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HeatSrvError::InvalidParameter(_)));
        assert_eq!(correlator.pending_count(), 0);
        assert!(transport.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_clears_pending() {
        let (correlator, transport, _rx) = setup();
        transport.set_send_failure(true);

        let err = correlator
            .request_value(0x680, 0x180, 0x000c, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HeatSrvError::Transport(TransportError::SendFailed(_))
        ));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_retry() {
        let (correlator, _transport, _rx) = setup();

        let err = correlator
            .request_value(0x680, 0x180, 0x000c, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(correlator.pending_count(), 0);

        // the slot is free again
        let err = correlator
            .request_value(0x680, 0x180, 0x000c, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_after_timeout_is_passive() {
        let (correlator, _transport, _rx) = setup();

        let err = correlator
            .request_value(0x680, 0x180, 0x000c, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let disposition = correlator.on_frame(&response(0x180, 0x680, 0x000c, 0x0037));
        assert_eq!(disposition, FrameDisposition::Passive);
        assert_eq!(correlator.passive().len(), 1);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_listing() {
        let (correlator, _transport, _rx) = setup();
        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .request_value(0x680, 0x301, 0x0011, Duration::from_secs(3))
                    .await
            })
        };
        while correlator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let query = ElsterQuery::new(0x680, 0x301, 0x0011);
        assert!(correlator.is_pending(&query));
        assert_eq!(correlator.pending()[0].query, query);

        correlator.on_frame(&response(0x301, 0x680, 0x0011, 0x00D2));
        assert_eq!(task.await.unwrap().unwrap().to_string(), "21.0");
    }
}
