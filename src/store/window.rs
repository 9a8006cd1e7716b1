//! Sliding-window event log.

use std::collections::BTreeMap;
use std::time::Duration;

/// Ordered log of event timestamps for a single key.
///
/// Timestamps are milliseconds. Events landing on the same millisecond are
/// kept as a hit count on one entry, so duplicates still count separately
/// toward the window total.
#[derive(Debug, Default)]
pub struct SlidingWindowLog {
    /// Hits per timestamp, ordered by timestamp
    entries: BTreeMap<u64, u64>,
    /// Sum of all hits currently retained
    total: u64,
}

impl SlidingWindowLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry older than `now_ms - interval`.
    ///
    /// An entry exactly at the cutoff is retained.
    pub fn evict(&mut self, now_ms: u64, interval: Duration) {
        let cutoff = now_ms.saturating_sub(interval.as_millis() as u64);
        let retained = self.entries.split_off(&cutoff);
        let evicted: u64 = self.entries.values().sum();
        self.entries = retained;
        self.total -= evicted;
    }

    /// Run one admission step: evict, count, and record `now_ms` unless saturated.
    ///
    /// Returns `true` if the event is limited. A limited event is not recorded.
    pub fn admit(&mut self, now_ms: u64, interval: Duration, rate: u64) -> bool {
        self.evict(now_ms, interval);

        if self.total >= rate {
            return true;
        }

        *self.entries.entry(now_ms).or_insert(0) += 1;
        self.total += 1;
        false
    }

    /// Number of events currently retained.
    pub fn count(&self) -> u64 {
        self.total
    }

    /// Whether the log holds no events.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Timestamp of the oldest retained event.
    pub fn oldest(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }
}
