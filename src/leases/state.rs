// Lease status as observed at a point in time

use super::Lease;
use crate::hlc::HLCTimestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a range's lease stands at a given timestamp.
///
/// `Empty` is the initial state of a range that never had a holder.
/// `Valid` and `Stasis` are both the active state; only `Valid` permits
/// serving. `Expired` lasts until a new acquisition commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    Empty,
    Valid,
    /// Near expiration; within clock uncertainty of another node's view.
    Stasis,
    Expired,
}

impl LeaseStatus {
    pub fn of(
        lease: Option<&Lease>,
        now: HLCTimestamp,
        max_offset: Duration,
        holder_liveness_epoch: Option<u64>,
    ) -> Self {
        lease.map_or(LeaseStatus::Empty, |lease| {
            lease.status(now, max_offset, holder_liveness_epoch)
        })
    }

    /// The holder may serve requests.
    pub fn is_valid(self) -> bool {
        self == LeaseStatus::Valid
    }

    /// The lease still blocks other replicas from acquiring.
    pub fn is_active(self) -> bool {
        matches!(self, LeaseStatus::Valid | LeaseStatus::Stasis)
    }
}
