//! Active limiter backed by a shared counter store.
//!
//! Every instance pointing at the same store agrees on one in-flight count
//! per key. Acquire increments first and, when the new value is over the
//! maximum, issues a compensating decrement before reporting the rejection.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, trace, warn};

use super::ActiveLimiter;
use crate::error::Result;
use crate::store::{CounterStore, RedisStore};

/// An active limiter counting in-flight requests in a [`CounterStore`].
pub struct DistributedActiveLimiter<S = RedisStore> {
    /// The shared store holding the counters.
    store: Arc<S>,
}

impl<S: CounterStore> DistributedActiveLimiter<S> {
    /// Create a new distributed active limiter.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[async_trait]
impl<S: CounterStore> ActiveLimiter for DistributedActiveLimiter<S> {
    async fn acquire(&self, key: &str, max_active: i64) -> Result<bool> {
        // A failure here leaves the counter untouched as far as we know, so
        // there is nothing to compensate.
        let current = self.store.incr(key).await?;

        trace!(key = %key, current = current, max_active = max_active, "Incremented active counter");

        if current <= max_active {
            return Ok(false);
        }

        debug!(
            key = %key,
            current = current,
            max_active = max_active,
            "Distributed active limit reached"
        );

        if let Err(e) = self.store.decr(key).await {
            error!(
                key = %key,
                error = %e,
                "Failed to undo rejected increment; counter reads one too high"
            );
        }

        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<bool> {
        let current = self.store.decr(key).await?;

        if current < 0 {
            warn!(key = %key, current = current, "Active counter dropped below zero");
            return Ok(false);
        }
        Ok(true)
    }
}
