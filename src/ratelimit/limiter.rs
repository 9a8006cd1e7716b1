//! Sliding-window rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::Limiter;
use crate::error::{FloodgateError, Result};
use crate::store::{CounterStore, MemoryStore, RedisStore};

/// Rate limiter keeping its window in the current process.
pub type LocalRateLimiter = SlidingWindowLimiter<MemoryStore>;

/// Rate limiter sharing its window through Redis.
pub type RedisRateLimiter = SlidingWindowLimiter<RedisStore>;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Rate limiter admitting at most `rate` events per key within any trailing
/// `interval`.
///
/// The admission step runs as one atomic operation on the underlying
/// [`CounterStore`]. `rate` and `interval` can be swapped at runtime and are
/// read fresh on every decision.
pub struct SlidingWindowLimiter<S> {
    /// Store holding the per-key windows
    store: Arc<S>,
    /// Maximum events admitted per window
    rate: AtomicU64,
    /// Window length in milliseconds
    interval_ms: AtomicU64,
}

impl<S: CounterStore> SlidingWindowLimiter<S> {
    /// Create a new limiter.
    ///
    /// A zero `interval` is rejected. A zero `rate` is accepted and limits
    /// every event.
    pub fn new(store: Arc<S>, rate: u64, interval: Duration) -> Result<Self> {
        let interval_ms = validate_interval(interval)?;
        Ok(Self {
            store,
            rate: AtomicU64::new(rate),
            interval_ms: AtomicU64::new(interval_ms),
        })
    }

    /// Maximum events admitted per window.
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Acquire)
    }

    /// Update the maximum events admitted per window.
    pub fn set_rate(&self, rate: u64) {
        self.rate.store(rate, Ordering::Release);
    }

    /// Window length.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    /// Update the window length.
    pub fn set_interval(&self, interval: Duration) -> Result<()> {
        let interval_ms = validate_interval(interval)?;
        self.interval_ms.store(interval_ms, Ordering::Release);
        Ok(())
    }

    /// Get the store backing this limiter.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether an event for `key` at `now_ms` is over the limit.
    pub async fn limit_at(&self, key: &str, now_ms: u64) -> Result<bool> {
        let rate = self.rate();
        let interval = self.interval();

        trace!(key = %key, now_ms = now_ms, rate = rate, "Checking rate limit");

        let limited = self
            .store
            .sliding_window(key, interval, rate, now_ms)
            .await?;

        if limited {
            debug!(
                key = %key,
                rate = rate,
                interval_ms = interval.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        Ok(limited)
    }
}

fn validate_interval(interval: Duration) -> Result<u64> {
    let interval_ms = interval.as_millis() as u64;
    if interval_ms == 0 {
        return Err(FloodgateError::Config(
            "rate limit interval must be at least 1ms".to_string(),
        ));
    }
    Ok(interval_ms)
}

#[async_trait]
impl<S: CounterStore> Limiter for SlidingWindowLimiter<S> {
    async fn limit(&self, key: &str) -> Result<bool> {
        self.limit_at(key, now_ms()).await
    }
}
