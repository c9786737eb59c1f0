// Hybrid Logical Clock (HLC) used to timestamp requests and leases
//
// Combines physical time with a logical counter to provide:
// - Monotonic timestamps per process, even if the wall clock steps backward
// - Causality: receiving a remote timestamp forwards the local clock
// - A bounded uncertainty window (the maximum tolerated clock offset between nodes)

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default maximum clock offset between any two nodes.
pub const DEFAULT_MAX_OFFSET: Duration = Duration::from_millis(500);

/// A Hybrid Logical Clock timestamp
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HLCTimestamp {
    /// Physical time component (milliseconds since Unix epoch)
    pub physical: u64,
    /// Logical counter to break ties when physical time is equal
    pub logical: u32,
}

impl HLCTimestamp {
    pub fn new(physical: u64, logical: u32) -> Self {
        Self { physical, logical }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.physical == 0 && self.logical == 0
    }

    /// Advances `self` to `other` if `other` is greater. Never moves backward.
    /// Returns whether `self` changed.
    pub fn forward(&mut self, other: HLCTimestamp) -> bool {
        if other > *self {
            *self = other;
            true
        } else {
            false
        }
    }

    /// The smallest timestamp strictly greater than `self`.
    #[must_use]
    pub fn next(self) -> Self {
        match self.logical.checked_add(1) {
            Some(logical) => Self::new(self.physical, logical),
            None => Self::new(self.physical.saturating_add(1), 0),
        }
    }

    /// Adds a physical duration, keeping the logical component.
    #[must_use]
    pub fn add(self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self::new(self.physical.saturating_add(millis), self.logical)
    }

    /// Physical distance from `earlier` to `self`, zero if `earlier` is later.
    pub fn since(&self, earlier: HLCTimestamp) -> Duration {
        Duration::from_millis(self.physical.saturating_sub(earlier.physical))
    }
}

impl fmt::Display for HLCTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.physical, self.logical)
    }
}

/// A clock reading together with the upper bound of its uncertainty window.
///
/// Any event stamped in `(now, limit]` by another node may have happened
/// before this reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UncertaintyInterval {
    pub now: HLCTimestamp,
    pub limit: HLCTimestamp,
}

impl UncertaintyInterval {
    pub fn is_uncertain(&self, ts: HLCTimestamp) -> bool {
        ts > self.now && ts <= self.limit
    }
}

/// Source of physical time in milliseconds since the Unix epoch.
pub type PhysicalClock = Box<dyn Fn() -> u64 + Send + Sync>;

/// Reads the system wall clock. A clock set before 1970 reads as zero.
pub fn system_physical_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// A Hybrid Logical Clock
pub struct HLC {
    physical_clock: PhysicalClock,
    max_offset: Duration,
    last: Mutex<HLCTimestamp>,
}

impl HLC {
    pub fn new() -> Self {
        Self::with_max_offset(DEFAULT_MAX_OFFSET)
    }

    pub fn with_max_offset(max_offset: Duration) -> Self {
        Self::new_with_clock(Box::new(system_physical_now), max_offset)
    }

    /// Create an HLC reading physical time from `physical_clock`.
    pub fn new_with_clock(physical_clock: PhysicalClock, max_offset: Duration) -> Self {
        Self {
            physical_clock,
            max_offset,
            last: Mutex::new(HLCTimestamp::zero()),
        }
    }

    fn physical_now(&self) -> u64 {
        (self.physical_clock)()
    }

    /// Generate a new timestamp, strictly greater than every timestamp
    /// previously returned by or fed into this clock.
    pub fn now(&self) -> HLCTimestamp {
        let physical = self.physical_now();
        let mut last = self.last.lock();
        if physical > last.physical {
            *last = HLCTimestamp::new(physical, 0);
        } else {
            *last = last.next();
        }
        *last
    }

    /// A fresh reading plus its uncertainty limit.
    pub fn now_with_uncertainty(&self) -> UncertaintyInterval {
        let now = self.now();
        UncertaintyInterval {
            now,
            limit: now.add(self.max_offset),
        }
    }

    /// Forward the clock to a timestamp observed elsewhere (a request or a
    /// remote node). Timestamps further ahead of local physical time than the
    /// maximum offset are refused and leave the clock untouched.
    pub fn update(&self, remote: HLCTimestamp) -> Result<HLCTimestamp, HLCError> {
        let physical_now = self.physical_now();
        let max_offset_ms = u64::try_from(self.max_offset.as_millis()).unwrap_or(u64::MAX);
        if remote.physical > physical_now.saturating_add(max_offset_ms) {
            return Err(HLCError::ClockDriftExceeded {
                remote_physical: remote.physical,
                local_physical: physical_now,
                max_offset_ms,
            });
        }

        let mut last = self.last.lock();
        last.forward(remote);
        Ok(*last)
    }

    /// The last timestamp generated or received by this clock
    pub fn last(&self) -> HLCTimestamp {
        *self.last.lock()
    }

    pub fn max_offset(&self) -> Duration {
        self.max_offset
    }
}

impl Default for HLC {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HLC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HLC")
            .field("max_offset", &self.max_offset)
            .field("last", &self.last())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HLCError {
    #[error("clock drift exceeded: remote={remote_physical}, local={local_physical}, max_offset={max_offset_ms}ms")]
    ClockDriftExceeded {
        remote_physical: u64,
        local_physical: u64,
        max_offset_ms: u64,
    },
}
