//! Reconnection helper
//!
//! Computes the delay before the next broker connection attempt and keeps
//! attempt statistics. Attempts are unlimited; with a backoff multiplier of 1.0
//! every attempt waits exactly the initial delay.

use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::error::{HeatSrvError, Result};

/// Reconnection policy configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay after a disconnect and after the first failure
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Backoff multiplier per consecutive failure
    pub backoff_multiplier: f64,
    /// Whether to add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl ReconnectPolicy {
    /// Same delay before every attempt
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn from_config(config: &MqttConfig) -> Self {
        let initial_delay = Duration::from_millis(config.reconnect_interval_ms);
        Self {
            initial_delay,
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms).max(initial_delay),
            backoff_multiplier: config.reconnect_backoff,
            jitter: config.reconnect_jitter,
        }
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_reconnects: u64,
    pub failed_reconnects: u64,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub last_connected: Option<Instant>,
}

/// Backoff and statistics for the broker connection
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    consecutive_failures: u32,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            stats: ReconnectStats::default(),
        }
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Forget earlier failures after the connection dropped
    pub fn mark_disconnected(&mut self) {
        self.consecutive_failures = 0;
        debug!("Connection marked as disconnected");
    }

    /// Delay before the next attempt
    pub fn calculate_next_delay(&self) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1);
        let multiplier = self.policy.backoff_multiplier.max(1.0);

        // delay = initial_delay * (multiplier ^ (failures - 1))
        let mut delay = self
            .policy
            .initial_delay
            .mul_f64(multiplier.powi(exponent.min(64) as i32));

        if delay > self.policy.max_delay {
            delay = self.policy.max_delay;
        }

        if self.policy.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }

    /// Run one connection attempt and book the outcome
    pub async fn execute_reconnect<F, Fut, E>(&mut self, mut connect_fn: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: std::fmt::Display,
    {
        self.stats.total_attempts += 1;
        let attempt = self.consecutive_failures + 1;
        debug!("Connection attempt {}", attempt);

        let start_time = Instant::now();
        match connect_fn().await {
            Ok(()) => {
                info!(
                    "Connected after {:?} (attempt {})",
                    start_time.elapsed(),
                    attempt
                );
                self.consecutive_failures = 0;
                self.stats.successful_reconnects += 1;
                self.stats.last_connected = Some(Instant::now());
                self.stats.last_error = None;
                Ok(())
            },
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.stats.failed_reconnects += 1;
                self.stats.last_error = Some(e.to_string());
                warn!(
                    "Connection attempt {} failed: {}, retrying in {:?}",
                    attempt,
                    e,
                    self.calculate_next_delay()
                );
                Err(HeatSrvError::Connect(e.to_string()))
            },
        }
    }
}
