//! Heating service
//!
//! Polls the configured readings over the Elster gateway and hands the values
//! to the publish queue. Bus and broker failures never stop the loop.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PollingConfig, ReadingConfig};
use crate::gateway::ElsterGateway;
use crate::publisher::PublishQueue;

/// Outcome of one polling cycle
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub requested: usize,
    /// Readings handed to the publish queue
    pub enqueued: usize,
    pub unchanged: usize,
    /// Parameters the module reported as not available
    pub unavailable: usize,
    pub timeouts: usize,
    pub errors: usize,
}

pub struct HeatingService {
    gateway: Arc<ElsterGateway>,
    publisher: Arc<PublishQueue>,
    polling: PollingConfig,
    passive_report_interval: Option<Duration>,
}

impl HeatingService {
    pub fn new(
        gateway: Arc<ElsterGateway>,
        publisher: Arc<PublishQueue>,
        polling: PollingConfig,
        passive_report_interval: Option<Duration>,
    ) -> Self {
        Self {
            gateway,
            publisher,
            polling,
            passive_report_interval,
        }
    }

    pub fn gateway(&self) -> &Arc<ElsterGateway> {
        &self.gateway
    }

    pub fn publisher(&self) -> &Arc<PublishQueue> {
        &self.publisher
    }

    /// Request every configured reading once
    pub async fn poll_once(&self, force_send: bool) -> PollSummary {
        let mut summary = PollSummary::default();

        for reading in &self.polling.readings {
            summary.requested += 1;
            self.poll_reading(reading, force_send, &mut summary).await;
        }

        debug!("Polling cycle done: {:?}", summary);
        summary
    }

    async fn poll_reading(&self, reading: &ReadingConfig, force_send: bool, summary: &mut PollSummary) {
        let value = match self
            .gateway
            .request_value(reading.receiver, reading.index)
            .await
        {
            Ok(value) => value,
            Err(e) if e.is_timeout() => {
                warn!("{}: {}", reading.name, e);
                summary.timeouts += 1;
                return;
            },
            Err(e) => {
                error!("{}: request failed: {}", reading.name, e);
                summary.errors += 1;
                return;
            },
        };

        if !value.is_available() {
            debug!("{}: not available on 0x{:03x}", reading.name, reading.receiver);
            summary.unavailable += 1;
            return;
        }

        match self
            .publisher
            .set_reading(&reading.name, &value.to_string(), force_send)
        {
            Ok(true) => summary.enqueued += 1,
            Ok(false) => summary.unchanged += 1,
            Err(e) => {
                warn!("{}: not queued: {}", reading.name, e);
                summary.errors += 1;
            },
        }
    }

    /// Poll until cancelled; every refresh interval a cycle republishes unchanged values
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.polling.readings.is_empty() {
            info!("No readings configured, polling disabled");
            return;
        }

        let polling_interval = self.polling.interval();
        let refresh_interval = self.polling.refresh_interval();
        let mut interval = tokio::time::interval(polling_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Polling {} reading(s) every {:?}",
            self.polling.readings.len(),
            polling_interval
        );

        let mut last_refresh = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {},
            }

            let force_send = refresh_interval.is_some_and(|refresh| last_refresh.elapsed() >= refresh);
            if force_send {
                debug!("Refresh cycle, republishing all readings");
                last_refresh = Instant::now();
            }

            let summary = tokio::select! {
                _ = cancel.cancelled() => break,
                summary = self.poll_once(force_send) => summary,
            };
            if summary.timeouts > 0 || summary.errors > 0 {
                info!(
                    "{} of {} reading(s) failed ({} timeout(s))",
                    summary.timeouts + summary.errors,
                    summary.requested,
                    summary.timeouts
                );
            }
        }
        debug!("Polling loop stopped");
    }

    /// Log the passive telegrams seen so far
    pub fn report_passive(&self) {
        let telegrams = self.gateway.list_passive_telegrams();
        info!("{} passive telegram(s) captured", telegrams.len());
        for telegram in telegrams {
            info!("  {}", telegram);
        }
    }

    async fn report_loop(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.report_passive();
                    self.publisher.log_all_readings();
                },
            }
        }
    }

    /// Spawn the polling loop and, if configured, the periodic passive report
    pub fn spawn(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![tokio::spawn(Arc::clone(self).run(cancel.clone()))];
        if let Some(period) = self.passive_report_interval {
            tasks.push(tokio::spawn(
                Arc::clone(self).report_loop(period, cancel.clone()),
            ));
        }
        tasks
    }
}
