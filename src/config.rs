use std::{sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    message::DEFAULT_MAX_RETRIES,
    retry::{ExponentialBackoff, RetryStrategy},
};

pub const DEFAULT_MAX_SIZE: usize = 1000;
pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DEAD_LETTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_DLQ_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime configuration of a [`MessageQueue`](crate::queue::MessageQueue).
///
/// ```
/// use std::time::Duration;
/// use nudgeq::config::QueueConfig;
///
/// let config = QueueConfig::builder()
///     .workers(2)
///     .poll_interval(Duration::from_millis(50))
///     .build();
/// assert_eq!(config.max_size, 1000);
/// ```
#[derive(Clone, Debug, bon::Builder)]
pub struct QueueConfig {
    /// Capacity of the primary buffer
    #[builder(default = DEFAULT_MAX_SIZE)]
    pub max_size: usize,
    /// Number of concurrent workers
    #[builder(default = DEFAULT_WORKERS)]
    pub workers: usize,
    /// Messages drained per micro-batch
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    /// Batch flush cadence
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,
    #[builder(default = default_retry_strategy())]
    pub retry_strategy: Arc<dyn RetryStrategy>,
    /// Retention of dead-lettered messages
    #[builder(default = DEFAULT_DEAD_LETTER_TTL)]
    pub dead_letter_ttl: Duration,
    /// Periodically log a metrics snapshot
    #[builder(default)]
    pub enable_metrics: bool,
    /// Retry budget for messages published without an override
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub default_max_retries: u32,
    #[builder(default = DEFAULT_DLQ_PRUNE_INTERVAL)]
    pub dlq_prune_interval: Duration,
    #[builder(default = DEFAULT_METRICS_INTERVAL)]
    pub metrics_interval: Duration,
}

fn default_retry_strategy() -> Arc<dyn RetryStrategy> {
    Arc::new(ExponentialBackoff::default())
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl QueueConfig {
    /// Replaces zero sizes and intervals with their defaults.
    pub fn normalized(mut self) -> Self {
        fn or_default<T: PartialEq + Default>(value: T, default: T) -> T {
            if value == T::default() {
                default
            } else {
                value
            }
        }

        self.max_size = or_default(self.max_size, DEFAULT_MAX_SIZE);
        self.workers = or_default(self.workers, DEFAULT_WORKERS);
        self.batch_size = or_default(self.batch_size, DEFAULT_BATCH_SIZE);
        self.poll_interval = or_default(self.poll_interval, DEFAULT_POLL_INTERVAL);
        self.dead_letter_ttl = or_default(self.dead_letter_ttl, DEFAULT_DEAD_LETTER_TTL);
        self.dlq_prune_interval = or_default(self.dlq_prune_interval, DEFAULT_DLQ_PRUNE_INTERVAL);
        self.metrics_interval = or_default(self.metrics_interval, DEFAULT_METRICS_INTERVAL);
        self
    }

    /// Capacity of the dead-letter buffer: a tenth of the primary buffer, at
    /// least one slot.
    pub fn dlq_capacity(&self) -> usize {
        (self.max_size / 10).max(1)
    }
}

/// Environment configuration, read from `NUDGEQ_*` variables.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub max_size: Option<usize>,
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub dead_letter_ttl_secs: Option<u64>,
    pub dlq_prune_interval_secs: Option<u64>,
    pub enable_metrics: Option<bool>,
    pub metrics_interval_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub retry_multiplier: Option<f64>,
    /// Topics the binary subscribes its logging handler to
    pub topics: Option<Vec<String>>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("NUDGEQ_").from_env::<Self>()?)
    }

    pub fn topics(&self) -> Vec<String> {
        match &self.topics {
            Some(topics) => topics
                .iter()
                .map(|topic| topic.trim())
                .filter(|topic| !topic.is_empty())
                .map(str::to_owned)
                .collect(),
            None => vec!["reminder".to_owned()],
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        let strategy = ExponentialBackoff::builder()
            .maybe_base_delay(self.retry_base_delay_ms.map(Duration::from_millis))
            .maybe_max_delay(self.retry_max_delay_ms.map(Duration::from_millis))
            .maybe_multiplier(self.retry_multiplier)
            .maybe_max_retries(self.max_retries)
            .build();

        QueueConfig::builder()
            .maybe_max_size(self.max_size)
            .maybe_workers(self.workers)
            .maybe_batch_size(self.batch_size)
            .maybe_poll_interval(self.poll_interval_ms.map(Duration::from_millis))
            .retry_strategy(Arc::new(strategy))
            .maybe_dead_letter_ttl(self.dead_letter_ttl_secs.map(Duration::from_secs))
            .maybe_enable_metrics(self.enable_metrics)
            .maybe_default_max_retries(self.max_retries)
            .maybe_dlq_prune_interval(self.dlq_prune_interval_secs.map(Duration::from_secs))
            .maybe_metrics_interval(self.metrics_interval_secs.map(Duration::from_secs))
            .build()
            .normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        envy::prefixed("NUDGEQ_")
            .from_iter(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<Vec<_>>(),
            )
            .unwrap()
    }

    #[test]
    fn test_default_queue_config() {
        let config = QueueConfig::default();
        assert_eq!(config.max_size, 1000);
        assert_eq!(config.workers, 5);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.dead_letter_ttl, Duration::from_secs(86400));
        assert_eq!(config.default_max_retries, 3);
        assert!(!config.enable_metrics);
        assert_eq!(config.dlq_capacity(), 100);
    }

    #[test]
    fn test_normalized_replaces_zeroes() {
        let config = QueueConfig::builder()
            .max_size(0)
            .workers(0)
            .batch_size(0)
            .poll_interval(Duration::ZERO)
            .dead_letter_ttl(Duration::ZERO)
            .build()
            .normalized();

        assert_eq!(config.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.dead_letter_ttl, DEFAULT_DEAD_LETTER_TTL);
    }

    #[test]
    fn test_dlq_capacity_never_zero() {
        let config = QueueConfig::builder().max_size(5).build();
        assert_eq!(config.dlq_capacity(), 1);
    }

    #[test]
    fn test_env_overrides() {
        let env = from_pairs(&[
            ("NUDGEQ_MAX_SIZE", "50"),
            ("NUDGEQ_WORKERS", "2"),
            ("NUDGEQ_POLL_INTERVAL_MS", "250"),
            ("NUDGEQ_ENABLE_METRICS", "true"),
            ("NUDGEQ_MAX_RETRIES", "7"),
            ("NUDGEQ_RETRY_BASE_DELAY_MS", "10"),
            ("NUDGEQ_TOPICS", "email, sms,,push"),
        ]);

        let config = env.queue_config();
        assert_eq!(config.max_size, 50);
        assert_eq!(config.workers, 2);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(config.enable_metrics);
        assert_eq!(config.default_max_retries, 7);
        assert_eq!(
            config.retry_strategy.next_delay(0),
            Duration::from_millis(10)
        );
        assert_eq!(env.topics(), vec!["email", "sms", "push"]);
    }

    #[test]
    fn test_empty_env_uses_defaults() {
        let env = from_pairs(&[]);
        let config = env.queue_config();

        assert_eq!(config.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(config.default_max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(env.topics(), vec!["reminder"]);
    }
}
