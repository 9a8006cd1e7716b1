//! In-process counter store.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::window::SlidingWindowLog;
use super::CounterStore;
use crate::error::Result;

/// Counter store that lives inside the current process.
///
/// Suitable for single-instance deployments and tests. State is not shared
/// between processes. Never returns an error.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Sliding-window logs indexed by key
    windows: DashMap<String, Arc<Mutex<SlidingWindowLog>>>,
    /// Integer counters indexed by key
    counters: DashMap<String, AtomicI64>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, key: &str) -> Arc<Mutex<SlidingWindowLog>> {
        if let Some(window) = self.windows.get(key) {
            return window.clone();
        }
        self.windows.entry(key.to_string()).or_default().clone()
    }

    /// Number of events currently retained for `key`.
    pub fn window_count(&self, key: &str) -> u64 {
        self.windows
            .get(key)
            .map(|w| w.lock().count())
            .unwrap_or(0)
    }

    /// Current value of the integer counter for `key`.
    pub fn counter(&self, key: &str) -> i64 {
        self.counters
            .get(key)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Remove windows that hold no events once `interval` has passed.
    ///
    /// Returns the number of windows removed.
    pub fn evict_idle(&self, now_ms: u64, interval: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            let mut log = window.lock();
            log.evict(now_ms, interval);
            !log.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of keys with a sliding window.
    pub fn window_len(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn sliding_window(
        &self,
        key: &str,
        interval: Duration,
        rate: u64,
        now_ms: u64,
    ) -> Result<bool> {
        let window = self.window(key);
        let limited = window.lock().admit(now_ms, interval, rate);

        trace!(key = %key, now_ms = now_ms, limited = limited, "Sliding window step");
        Ok(limited)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let counter = self.counters.entry(key.to_string()).or_default();
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let counter = self.counters.entry(key.to_string()).or_default();
        Ok(counter.fetch_sub(1, Ordering::SeqCst) - 1)
    }
}
