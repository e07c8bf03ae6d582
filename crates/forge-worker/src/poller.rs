//! Adaptive poll-interval control: backs off when the ledger has no pending work, resets
//! to the minimum interval the moment work appears.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_millis().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Tracks the current backoff interval and a shutdown signal. `poll()` callers report
/// whether the last poll found work via [`TaskPoller::record`], which drives the backoff.
pub struct TaskPoller {
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(config: PollerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Report the outcome of a poll: resets backoff on any work found, otherwise backs off.
    pub fn record(&mut self, found: usize) {
        if found == 0 {
            self.increase_backoff();
        } else {
            self.reset_backoff();
        }
    }

    /// Sleep for the current interval, waking early if shutdown is signaled. Returns whether
    /// shutdown was observed.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_increases_when_idle_and_resets_on_work() {
        let (_tx, rx) = watch::channel(false);
        let mut poller = TaskPoller::new(PollerConfig::default(), rx);
        poller.record(0);
        assert!(poller.current_interval() > PollerConfig::default().min_interval);
        poller.record(3);
        assert_eq!(poller.current_interval(), PollerConfig::default().min_interval);
    }

    #[test]
    fn backoff_caps_at_max_interval() {
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::default().with_max_interval(Duration::from_millis(300));
        let mut poller = TaskPoller::new(config.clone(), rx);
        for _ in 0..20 {
            poller.record(0);
        }
        assert_eq!(poller.current_interval(), config.max_interval);
    }

    #[tokio::test]
    async fn wait_returns_early_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let mut poller = TaskPoller::new(
            PollerConfig::default().with_min_interval(Duration::from_secs(30)),
            rx,
        );
        let handle = tokio::spawn(async move { poller.wait().await });
        tx.send(true).unwrap();
        let shutdown_observed = handle.await.unwrap();
        assert!(shutdown_observed);
    }
}
