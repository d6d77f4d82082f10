//! Publish queue and broker connection manager
//!
//! Two background tasks share the connection state and the outbound queue:
//! - the reconnect loop ticks at the reconnect interval, connecting while
//!   Disconnected and checking liveness while Connected
//! - the drain loop publishes the oldest item while Connected and otherwise
//!   sleeps until a push, a state change or the wake interval
//!
//! `set_reading` never waits for either of them.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::client::MessageTransport;
use super::queue::{OutboundItem, OutboundQueue};
use super::readings::{Reading, ReadingCache};
use super::reconnect::{ReconnectHelper, ReconnectPolicy, ReconnectStats};
use super::ConnectionState;
use crate::config::MqttConfig;
use crate::error::Result;

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime settings of the publish queue
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Topic root, readings go to `<topic_root>/<name>`
    pub topic_root: String,
    /// Upper bound on how long the idle drain loop sleeps
    pub wake_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self::from_config(&MqttConfig::default())
    }
}

impl PublisherSettings {
    pub fn from_config(config: &MqttConfig) -> Self {
        Self {
            topic_root: config.topic.clone(),
            wake_interval: config.wake_interval(),
            reconnect: ReconnectPolicy::from_config(config),
        }
    }
}

/// Publish counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct PublishStats {
    pub enqueued: u64,
    /// `set_reading` calls skipped because the value was unchanged
    pub unchanged: u64,
    pub published: u64,
    /// Items dropped after a failed publish
    pub failed: u64,
    /// Items still queued at shutdown
    pub dropped_on_shutdown: u64,
}

pub struct PublishQueue {
    transport: Arc<dyn MessageTransport>,
    settings: PublisherSettings,
    readings: Mutex<ReadingCache>,
    queue: OutboundQueue,
    state_tx: watch::Sender<ConnectionState>,
    stats: Mutex<PublishStats>,
    reconnect_stats: Mutex<ReconnectStats>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PublishQueue {
    /// Create a stopped queue; its tasks stop when `cancel` (or `shutdown`) fires
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        settings: PublisherSettings,
        cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            transport,
            settings,
            readings: Mutex::new(ReadingCache::new()),
            queue: OutboundQueue::new(),
            state_tx,
            stats: Mutex::new(PublishStats::default()),
            reconnect_stats: Mutex::new(ReconnectStats::default()),
            cancel: cancel.child_token(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the reconnect and drain loops
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Publish queue already started");
            return;
        }

        let helper = ReconnectHelper::new(self.settings.reconnect.clone());
        tasks.push(tokio::spawn(Arc::clone(self).reconnect_loop(helper)));
        tasks.push(tokio::spawn(Arc::clone(self).drain_loop()));
        info!(
            "Publish queue started (topic root '{}')",
            self.settings.topic_root
        );
    }

    /// Record a reading and enqueue it if it changed or `force_send` is set
    ///
    /// Returns whether an item was enqueued. The cache only changes when the
    /// enqueue succeeded.
    pub fn set_reading(&self, name: &str, value: &str, force_send: bool) -> Result<bool> {
        let mut readings = self.readings.lock();
        if !force_send && !readings.is_changed(name, value) {
            trace!("Reading {} unchanged ({})", name, value);
            self.stats.lock().unchanged += 1;
            return Ok(false);
        }

        self.queue.push(OutboundItem {
            name: name.to_string(),
            value: value.to_string(),
        })?;
        readings.update(name, value);
        self.stats.lock().enqueued += 1;
        debug!("Queued {} = {}", name, value);
        Ok(true)
    }

    pub fn topic_for(&self, name: &str) -> String {
        format!("{}/{}", self.settings.topic_root.trim_end_matches('/'), name)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn reading(&self, name: &str) -> Option<Reading> {
        self.readings.lock().get(name).cloned()
    }

    /// All cached readings ordered by name
    pub fn readings(&self) -> Vec<Reading> {
        self.readings.lock().snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> PublishStats {
        self.stats.lock().clone()
    }

    pub fn reconnect_stats(&self) -> ReconnectStats {
        self.reconnect_stats.lock().clone()
    }

    pub fn log_all_readings(&self) {
        let readings = self.readings();
        info!(
            "{} reading(s), broker {}",
            readings.len(),
            self.state()
        );
        for reading in readings {
            let marker = if reading.is_published() { "" } else { " (unpublished)" };
            info!(
                "  {} = {}{} [updated {}]",
                self.topic_for(&reading.name),
                reading.value,
                marker,
                reading.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    /// Stop both loops and disconnect; queued items are not flushed
    pub async fn shutdown(&self) {
        let remaining = self.queue.close();
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
                warn!("Publish task did not stop in {:?}, aborting", TASK_JOIN_TIMEOUT);
                abort.abort();
            }
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect during shutdown failed: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);

        self.stats.lock().dropped_on_shutdown += remaining as u64;
        info!("Publish queue stopped, {} queued item(s) dropped", remaining);
    }

    fn set_state(&self, new: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == new {
                return false;
            }
            debug!("Connection state {} -> {}", state, new);
            *state = new;
            true
        });
    }

    async fn reconnect_loop(self: Arc<Self>, mut helper: ReconnectHelper) {
        let tick = self.settings.reconnect.initial_delay;
        let mut delay = Duration::ZERO;

        loop {
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {},
                }
            } else if self.cancel.is_cancelled() {
                break;
            }

            if self.state() == ConnectionState::Connected {
                if self.transport.is_connected() {
                    delay = tick;
                    continue;
                }
                warn!("Broker connection lost");
                self.set_state(ConnectionState::Disconnected);
                helper.mark_disconnected();
            }

            self.set_state(ConnectionState::Connecting);
            let transport = &self.transport;
            let outcome = helper.execute_reconnect(|| transport.connect()).await;
            *self.reconnect_stats.lock() = helper.stats().clone();

            match outcome {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    delay = tick;
                },
                Err(_) => {
                    // execute_reconnect already logged the failure
                    self.set_state(ConnectionState::Disconnected);
                    delay = helper.calculate_next_delay();
                },
            }
        }
        debug!("Reconnect loop stopped");
    }

    async fn drain_loop(self: Arc<Self>) {
        let mut state_rx = self.state_tx.subscribe();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let connected = *state_rx.borrow_and_update() == ConnectionState::Connected;
            if connected {
                if let Some(item) = self.queue.pop() {
                    self.publish_item(item).await;
                    continue;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.queue.notified() => {},
                _ = state_rx.changed() => {},
                _ = tokio::time::sleep(self.settings.wake_interval) => {},
            }
        }
        debug!("Drain loop stopped");
    }

    async fn publish_item(&self, item: OutboundItem) {
        let topic = self.topic_for(&item.name);
        match self.transport.publish(&topic, &item.value).await {
            Ok(()) => {
                self.readings
                    .lock()
                    .mark_published(&item.name, &item.value);
                self.stats.lock().published += 1;
                debug!("Published {} = {}", topic, item.value);
            },
            Err(e) => {
                self.stats.lock().failed += 1;
                warn!("Dropping {} = {}: {}", topic, item.value, e);
                if !self.transport.is_connected() {
                    self.set_state(ConnectionState::Disconnected);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HeatSrvError;
    use crate::publisher::mock::MockMessageTransport;

    fn settings() -> PublisherSettings {
        PublisherSettings {
            topic_root: "heating/".to_string(),
            wake_interval: Duration::from_secs(1),
            reconnect: ReconnectPolicy::fixed(Duration::from_secs(5)),
        }
    }

    fn queue_with(mock: &Arc<MockMessageTransport>) -> Arc<PublishQueue> {
        let transport: Arc<dyn MessageTransport> = mock.clone();
        PublishQueue::new(transport, settings(), &CancellationToken::new())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_topic_for_trims_separator() {
        let queue = queue_with(&Arc::new(MockMessageTransport::new()));
        assert_eq!(queue.topic_for("OutdoorTemp"), "heating/OutdoorTemp");
    }

    #[test]
    fn test_unchanged_value_is_not_enqueued() {
        let queue = queue_with(&Arc::new(MockMessageTransport::new()));

        assert!(queue.set_reading("OutdoorTemp", "5.5", false).unwrap());
        assert!(!queue.set_reading("OutdoorTemp", "5.5", false).unwrap());
        assert!(queue.set_reading("OutdoorTemp", "5.5", true).unwrap());
        assert!(queue.set_reading("OutdoorTemp", "5.6", false).unwrap());

        assert_eq!(queue.queue_len(), 3);
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(queue.reading("OutdoorTemp").unwrap().value, "5.6");
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_in_fifo_order_once_connected() {
        let mock = Arc::new(MockMessageTransport::new());
        let queue = queue_with(&mock);
        queue.set_reading("a", "1", false).unwrap();
        queue.set_reading("b", "2", false).unwrap();

        queue.start();
        settle().await;

        assert_eq!(queue.state(), ConnectionState::Connected);
        let topics: Vec<_> = mock.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["heating/a", "heating/b"]);
        assert!(queue.reading("a").unwrap().is_published());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_is_dropped() {
        let mock = Arc::new(MockMessageTransport::new());
        let queue = queue_with(&mock);
        queue.start();
        settle().await;

        mock.set_publish_failure(true);
        queue.set_reading("a", "1", false).unwrap();
        settle().await;
        assert_eq!(queue.queue_len(), 0);
        assert_eq!(queue.stats().failed, 1);
        // still connected, the broker only rejected the message
        assert_eq!(queue.state(), ConnectionState::Connected);

        mock.set_publish_failure(false);
        queue.set_reading("b", "2", false).unwrap();
        settle().await;

        let published = mock.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "heating/b");
        // the cache keeps the intended value even though it never went out
        assert_eq!(queue.reading("a").unwrap().value, "1");
        assert!(!queue.reading("a").unwrap().is_published());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_on_lost_connection_disconnects() {
        let mock = Arc::new(MockMessageTransport::new());
        let queue = queue_with(&mock);
        queue.start();
        settle().await;
        assert_eq!(queue.state(), ConnectionState::Connected);

        mock.drop_connection();
        queue.set_reading("a", "1", false).unwrap();
        settle().await;

        assert_eq!(queue.queue_len(), 0);
        assert_eq!(queue.stats().failed, 1);
        assert_eq!(queue.state(), ConnectionState::Disconnected);
        assert!(mock.published().is_empty());

        // next reconnect tick
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.state(), ConnectionState::Connected);
        assert_eq!(mock.connect_attempts(), 2);

        queue.set_reading("b", "2", false).unwrap();
        settle().await;
        let topics: Vec<_> = mock.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["heating/b"]);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_connection_loss() {
        let mock = Arc::new(MockMessageTransport::new());
        let queue = queue_with(&mock);
        queue.start();
        settle().await;
        assert_eq!(mock.connect_attempts(), 1);

        mock.drop_connection();
        mock.set_connect_failure(true);
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(queue.state(), ConnectionState::Disconnected);
        assert_eq!(mock.connect_attempts(), 2);

        mock.set_connect_failure(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.state(), ConnectionState::Connected);
        assert_eq!(mock.connect_attempts(), 3);

        let stats = queue.reconnect_stats();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.failed_reconnects, 1);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_attempts_while_connected() {
        let mock = Arc::new(MockMessageTransport::new());
        let queue = queue_with(&mock);
        queue.start();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.connect_attempts(), 1);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_queue() {
        let mock = Arc::new(MockMessageTransport::new());
        mock.set_connect_failure(true);
        let queue = queue_with(&mock);
        queue.start();
        settle().await;

        queue.set_reading("a", "1", false).unwrap();
        queue.shutdown().await;

        assert_eq!(queue.state(), ConnectionState::Disconnected);
        assert_eq!(queue.stats().dropped_on_shutdown, 1);
        assert_eq!(mock.disconnects(), 1);

        let err = queue.set_reading("a", "2", false).unwrap_err();
        assert!(matches!(err, HeatSrvError::QueueClosed));
        assert_eq!(queue.reading("a").unwrap().value, "1");
        assert_eq!(mock.publish_attempts(), 0);
    }
}
