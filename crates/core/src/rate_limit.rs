//! Per-provider token bucket limiter shared by every outbound request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitsConfig;
use crate::error::{Result, TrunchbullError};
use crate::models::common::Source;

/// Outcome of a non-blocking permit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Permit,
    /// No token is available; one will be after at least this long.
    Wait(Duration),
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> Acquire {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Acquire::Permit
        } else {
            let missing = 1.0 - self.tokens;
            Acquire::Wait(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }
}

/// Caps request rate per provider. Every HTTP call goes through
/// [`RateLimiter::acquire`] before it is sent.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<Source, Bucket>>,
}

impl RateLimiter {
    pub fn new(limits: impl IntoIterator<Item = (Source, u32)>) -> Self {
        let now = Instant::now();
        let buckets = limits
            .into_iter()
            .map(|(source, per_minute)| (source, Bucket::new(per_minute, now)))
            .collect();
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    pub fn from_config(config: &RateLimitsConfig) -> Self {
        Self::new(config.as_map())
    }

    /// Take a token if one is available. Sources without a configured bucket
    /// are not limited.
    pub fn try_acquire(&self, source: Source) -> Acquire {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match buckets.get_mut(&source) {
            Some(bucket) => bucket.try_take(Instant::now()),
            None => Acquire::Permit,
        }
    }

    /// Wait for a token, giving up with [`TrunchbullError::RateLimitTimeout`]
    /// once `timeout` would be exceeded.
    pub async fn acquire(&self, source: Source, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_acquire(source) {
                Acquire::Permit => return Ok(()),
                Acquire::Wait(wait) => {
                    if Instant::now() + wait > deadline {
                        return Err(TrunchbullError::RateLimitTimeout {
                            provider: source.to_string(),
                        });
                    }
                    debug!(provider = %source, wait_ms = wait.as_millis() as u64, "Waiting for rate limit permit");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
