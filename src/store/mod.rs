//! Counter stores backing the limiters.
//!
//! A store offers two families of atomic operations keyed by a string:
//! the sliding-window admission step used by the rate limiter, and
//! increment/decrement of an integer used by the active limiter.
//! [`MemoryStore`] keeps state in-process; [`RedisStore`] shares it
//! across every instance talking to the same Redis server.

mod memory;
mod redis;
mod window;

pub use self::redis::{RedisStore, RedisStoreOptions};
pub use memory::MemoryStore;
pub use window::SlidingWindowLog;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Trait for counter store implementations.
///
/// Every method is a single atomic unit with respect to other calls on the
/// same key. Errors mean the store itself failed; they never encode a
/// policy decision.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Evict events older than `now_ms - interval`, count the rest, and record
    /// `now_ms` if fewer than `rate` remain.
    ///
    /// Returns `true` if the event is limited (and therefore not recorded).
    async fn sliding_window(
        &self,
        key: &str,
        interval: Duration,
        rate: u64,
        now_ms: u64,
    ) -> Result<bool>;

    /// Increment the counter for `key` by one and return the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Decrement the counter for `key` by one and return the new value.
    async fn decr(&self, key: &str) -> Result<i64>;
}
