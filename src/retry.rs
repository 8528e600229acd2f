//! Retry policies.
//!
//! A [`RetryStrategy`] decides whether a failed message gets another attempt
//! and how long it should wait before that attempt. Strategies are stateless
//! per call and shared by every worker.

use std::{fmt, sync::Arc, time::Duration};

use crate::{error::HandlerError, message::DEFAULT_MAX_RETRIES};

/// Computes retry eligibility and backoff for failed messages.
pub trait RetryStrategy: fmt::Debug + Send + Sync + 'static {
    /// Delay before the attempt following `attempt` retries.
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Whether a message that failed with `err` after `attempt` retries may
    /// be retried.
    fn should_retry(&self, err: &HandlerError, attempt: u32) -> bool;
}

/// Predicate selecting which handler errors are worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// Exponential backoff: `min(base_delay * multiplier^attempt, max_delay)`.
#[derive(Clone, bon::Builder)]
pub struct ExponentialBackoff {
    #[builder(default = Duration::from_secs(1))]
    pub base_delay: Duration,
    #[builder(default = Duration::from_secs(5 * 60))]
    pub max_delay: Duration,
    #[builder(default = 2.0)]
    pub multiplier: f64,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    /// When unset every error is retryable
    pub retry_on: Option<RetryPredicate>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for ExponentialBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExponentialBackoff")
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("max_retries", &self.max_retries)
            .field("retry_on", &self.retry_on.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let max = self.max_delay.as_secs_f64();

        // NaN and infinity both land on the cap.
        if secs.is_finite() && secs < max {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }

    fn should_retry(&self, err: &HandlerError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        self.retry_on.as_ref().map_or(true, |accept| accept(err))
    }
}

/// Retries with the same delay every time.
#[derive(Debug, Clone)]
pub struct ConstantBackoff {
    pub delay: Duration,
    pub max_retries: u32,
}

impl ConstantBackoff {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryStrategy for ConstantBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn should_retry(&self, _err: &HandlerError, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let strategy = ExponentialBackoff::default();
        assert_eq!(strategy.base_delay, Duration::from_secs(1));
        assert_eq!(strategy.max_delay, Duration::from_secs(300));
        assert_eq!(strategy.multiplier, 2.0);
        assert_eq!(strategy.max_retries, 3);
    }

    #[test]
    fn test_exponential_delays() {
        let strategy = ExponentialBackoff::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .build();

        assert_eq!(strategy.next_delay(0), Duration::from_millis(100));
        assert_eq!(strategy.next_delay(1), Duration::from_millis(200));
        assert_eq!(strategy.next_delay(2), Duration::from_millis(400));
        assert_eq!(strategy.next_delay(3), Duration::from_millis(800));
        assert_eq!(strategy.next_delay(4), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_monotonic_and_capped() {
        let strategy = ExponentialBackoff::builder()
            .base_delay(Duration::from_millis(7))
            .max_delay(Duration::from_secs(3))
            .multiplier(1.7)
            .build();

        let mut previous = Duration::ZERO;
        for attempt in 0..2000 {
            let delay = strategy.next_delay(attempt);
            assert!(delay >= previous, "delay decreased at attempt {attempt}");
            assert!(delay <= strategy.max_delay);
            previous = delay;
        }
        assert_eq!(strategy.next_delay(u32::MAX), strategy.max_delay);
    }

    #[test]
    fn test_exponential_should_retry() {
        let strategy = ExponentialBackoff::builder().max_retries(2).build();
        let err = eyre::eyre!("boom");

        assert!(strategy.should_retry(&err, 0));
        assert!(strategy.should_retry(&err, 1));
        assert!(!strategy.should_retry(&err, 2));
        assert!(!strategy.should_retry(&err, 3));
    }

    #[test]
    fn test_exponential_retry_predicate() {
        let strategy = ExponentialBackoff::builder()
            .retry_on(Arc::new(|err: &HandlerError| {
                !err.to_string().contains("permanent")
            }))
            .build();

        assert!(strategy.should_retry(&eyre::eyre!("timeout"), 0));
        assert!(!strategy.should_retry(&eyre::eyre!("permanent failure"), 0));
    }

    #[test]
    fn test_constant_backoff() {
        let strategy = ConstantBackoff::new(Duration::from_millis(50), 1);
        let err = eyre::eyre!("boom");

        assert_eq!(strategy.next_delay(0), Duration::from_millis(50));
        assert_eq!(strategy.next_delay(10), Duration::from_millis(50));
        assert!(strategy.should_retry(&err, 0));
        assert!(!strategy.should_retry(&err, 1));
    }
}
