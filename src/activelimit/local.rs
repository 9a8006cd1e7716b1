//! In-process active limiter.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ActiveLimiter;
use crate::error::Result;

/// How a [`LocalActiveLimiter`] maps keys to counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterScope {
    /// One counter per key
    #[default]
    PerKey,
    /// A single counter shared by every key, limiting total in-flight work
    Global,
}

/// Active limiter counting in-flight requests with process-local atomics.
///
/// Acquire claims a slot first, compares the new count to the maximum, and
/// gives the slot back if it went over. Never returns an error.
#[derive(Debug, Default)]
pub struct LocalActiveLimiter {
    scope: CounterScope,
    /// Counters for [`CounterScope::PerKey`]
    counters: DashMap<String, AtomicI64>,
    /// Counter for [`CounterScope::Global`]
    global: AtomicI64,
}

impl LocalActiveLimiter {
    /// Create a limiter with one counter per key.
    pub fn new() -> Self {
        Self::with_scope(CounterScope::PerKey)
    }

    /// Create a limiter sharing one counter across all keys.
    pub fn global() -> Self {
        Self::with_scope(CounterScope::Global)
    }

    /// Create a limiter with an explicit counter scope.
    pub fn with_scope(scope: CounterScope) -> Self {
        Self {
            scope,
            counters: DashMap::new(),
            global: AtomicI64::new(0),
        }
    }

    /// The counter scope of this limiter.
    pub fn scope(&self) -> CounterScope {
        self.scope
    }

    /// Number of slots currently held for `key`.
    pub fn in_flight(&self, key: &str) -> i64 {
        match self.scope {
            CounterScope::Global => self.global.load(Ordering::SeqCst),
            CounterScope::PerKey => self
                .counters
                .get(key)
                .map(|c| c.load(Ordering::SeqCst))
                .unwrap_or(0),
        }
    }

    /// Number of keys with a live per-key counter.
    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }

    /// Drop the per-key counter once nothing holds a slot on it.
    ///
    /// Removal takes the shard write lock, so it cannot race with an acquire
    /// that is touching the same counter.
    fn prune(&self, key: &str) {
        if self.scope == CounterScope::PerKey {
            self.counters
                .remove_if(key, |_, counter| counter.load(Ordering::SeqCst) == 0);
        }
    }

    fn with_counter<T>(&self, key: &str, f: impl FnOnce(&AtomicI64) -> T) -> T {
        match self.scope {
            CounterScope::Global => f(&self.global),
            CounterScope::PerKey => {
                if let Some(counter) = self.counters.get(key) {
                    return f(&counter);
                }
                let counter = self.counters.entry(key.to_string()).or_default();
                f(&counter)
            }
        }
    }
}

#[async_trait]
impl ActiveLimiter for LocalActiveLimiter {
    async fn acquire(&self, key: &str, max_active: i64) -> Result<bool> {
        let rejected = self.with_counter(key, |counter| {
            let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if current <= max_active {
                false
            } else {
                counter.fetch_sub(1, Ordering::SeqCst);
                true
            }
        });

        if rejected {
            debug!(key = %key, max_active = max_active, "Active limit reached");
            self.prune(key);
        }
        Ok(rejected)
    }

    async fn release(&self, key: &str) -> Result<bool> {
        let released = self.with_counter(key, |counter| {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    (current > 0).then(|| current - 1)
                })
                .is_ok()
        });

        if !released {
            warn!(key = %key, "Release without a matching acquire ignored");
        }
        self.prune(key);
        Ok(released)
    }
}
