// Timestamp cache
//
// Remembers the highest timestamp each key was read at on this replica, so a
// later write to the key can be pushed above it. The low water mark covers
// every key, including reads served under a previous lease elsewhere and
// entries evicted once the cache is over capacity.

use crate::hlc::HLCTimestamp;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    low_water: HLCTimestamp,
    reads: HashMap<Bytes, HLCTimestamp>,
    max_read: HLCTimestamp,
}

#[derive(Debug)]
pub struct TimestampCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for TimestampCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl TimestampCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache tracking at most `capacity` keys individually.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    pub fn record_read(&self, key: Bytes, ts: HLCTimestamp) {
        let mut inner = self.inner.lock();
        inner.max_read.forward(ts);
        inner.reads.entry(key).or_default().forward(ts);
        if inner.reads.len() > self.capacity {
            self.evict(&mut inner);
        }
    }

    // Keeps the newest half of the entries and folds the rest into the low
    // water mark.
    fn evict(&self, inner: &mut Inner) {
        let mut stamps: Vec<HLCTimestamp> = inner.reads.values().copied().collect();
        let cutoff_idx = stamps.len() - self.capacity / 2 - 1;
        let (_, cutoff, _) = stamps.select_nth_unstable(cutoff_idx);
        let cutoff = *cutoff;

        let before = inner.reads.len();
        inner.low_water.forward(cutoff);
        let low_water = inner.low_water;
        inner.reads.retain(|_, read| *read > low_water);
        debug!(%low_water, evicted = before - inner.reads.len(), "timestamp cache over capacity");
    }

    /// Number of keys tracked individually.
    pub fn len(&self) -> usize {
        self.inner.lock().reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest timestamp any read of `key` may have been served at.
    pub fn max_read(&self, key: &[u8]) -> HLCTimestamp {
        let inner = self.inner.lock();
        let mut ts = inner.low_water;
        if let Some(read) = inner.reads.get(key) {
            ts.forward(*read);
        }
        ts
    }

    /// Highest read timestamp served on this replica, low water included.
    pub fn max_served(&self) -> HLCTimestamp {
        let inner = self.inner.lock();
        let mut ts = inner.low_water;
        ts.forward(inner.max_read);
        ts
    }

    /// Raises the floor for every key. Entries at or below it are dropped.
    pub fn forward_low_water(&self, ts: HLCTimestamp) {
        let mut inner = self.inner.lock();
        if inner.low_water.forward(ts) {
            let low_water = inner.low_water;
            inner.reads.retain(|_, read| *read > low_water);
        }
    }

    pub fn low_water(&self) -> HLCTimestamp {
        self.inner.lock().low_water
    }
}
