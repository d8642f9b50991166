use std::time::Duration;

use crate::config::{BackoffStrategy, SyncConfig};

/// How many times a transient fetch failure is retried and how long to wait
/// in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: u32,
    pub backoff: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            backoff: config.retry_backoff,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based). An upstream `Retry-After` hint wins when it is longer.
    pub fn delay_after(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1).min(20);
                self.base_delay.saturating_mul(1u32 << exp)
            }
        }
        .min(self.max_delay);
        match hint {
            Some(h) => computed.max(h),
            None => computed,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}
