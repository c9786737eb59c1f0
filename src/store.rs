// Replicated range state: the active lease and membership of each range
//
// Mutated only by the owning range's processing path: lease changes arrive
// through consensus apply, membership changes under the descriptor latch.

use crate::hlc::HLCTimestamp;
use crate::leases::Lease;
use crate::membership::{check_can_receive_lease, IneligibleReason, RangeDescriptor};
use crate::{Error, NodeId, RangeId, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;
use thiserror::Error;

/// Point-in-time copy of a range's state, taken under latches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSnapshot {
    pub lease: Option<Lease>,
    pub desc: RangeDescriptor,
    /// Liveness epoch of the current lease holder's node.
    pub holder_liveness_epoch: Option<u64>,
}

#[derive(Debug)]
struct RangeState {
    lease: Option<Lease>,
    desc: RangeDescriptor,
}

/// Why a committed lease change could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseApplyError {
    #[error("range {0} not found")]
    RangeNotFound(RangeId),

    #[error("previous lease seq {expected:?} does not match active lease seq {found:?}")]
    PrevMismatch {
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("lease {0} does not supersede the active lease")]
    DoesNotSupersede(Box<Lease>),

    #[error("lease holder is not eligible under descriptor generation {generation}: {reason}")]
    Ineligible {
        generation: u64,
        reason: IneligibleReason,
    },
}

#[derive(Debug, Default)]
pub struct LeaseStateStore {
    ranges: DashMap<RangeId, RangeState>,
    liveness: DashMap<NodeId, u64>,
}

impl LeaseStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a range with no lease.
    pub fn add_range(&self, desc: RangeDescriptor) -> Result<()> {
        let range_id = desc.range_id;
        match self.ranges.entry(range_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::RangeExists(range_id)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(RangeState { lease: None, desc });
                Ok(())
            }
        }
    }

    pub fn get_active_lease(&self, range_id: RangeId) -> Result<Option<Lease>> {
        self.ranges
            .get(&range_id)
            .map(|state| state.lease.clone())
            .ok_or(Error::RangeNotFound(range_id))
    }

    pub fn get_membership(&self, range_id: RangeId) -> Result<RangeDescriptor> {
        self.ranges
            .get(&range_id)
            .map(|state| state.desc.clone())
            .ok_or(Error::RangeNotFound(range_id))
    }

    pub fn snapshot(&self, range_id: RangeId) -> Result<RangeSnapshot> {
        let state = self
            .ranges
            .get(&range_id)
            .ok_or(Error::RangeNotFound(range_id))?;
        let holder_liveness_epoch = state
            .lease
            .as_ref()
            .and_then(|lease| self.liveness_epoch(lease.holder()));
        Ok(RangeSnapshot {
            lease: state.lease.clone(),
            desc: state.desc.clone(),
            holder_liveness_epoch,
        })
    }

    /// Installs a committed lease. Acts as a compare-and-swap: `prev` must
    /// still be the active lease, `next` must supersede it, and its holder
    /// must be eligible under the membership in effect at apply time.
    pub fn apply_committed_lease(
        &self,
        range_id: RangeId,
        prev: Option<&Lease>,
        next: Lease,
    ) -> std::result::Result<(), LeaseApplyError> {
        let mut state = self
            .ranges
            .get_mut(&range_id)
            .ok_or(LeaseApplyError::RangeNotFound(range_id))?;

        if state.lease.as_ref() != prev {
            return Err(LeaseApplyError::PrevMismatch {
                expected: prev.map(|lease| lease.sequence.0),
                found: state.lease.as_ref().map(|lease| lease.sequence.0),
            });
        }
        if !next.supersedes(prev) {
            return Err(LeaseApplyError::DoesNotSupersede(Box::new(next)));
        }
        check_can_receive_lease(&next.replica, &state.desc).map_err(|reason| {
            LeaseApplyError::Ineligible {
                generation: state.desc.generation,
                reason,
            }
        })?;
        state.lease = Some(next);
        Ok(())
    }

    /// Replaces the membership of a range. The new descriptor's generation
    /// must directly follow the current one, and the holder of the active
    /// lease must stay eligible under it.
    pub fn set_membership(&self, desc: RangeDescriptor) -> Result<()> {
        let range_id = desc.range_id;
        let mut state = self
            .ranges
            .get_mut(&range_id)
            .ok_or(Error::RangeNotFound(range_id))?;
        if desc.generation != state.desc.generation + 1 {
            return Err(Error::StaleDescriptor {
                range_id,
                current: state.desc.generation,
                proposed: desc.generation,
            });
        }
        if let Some(lease) = &state.lease {
            check_can_receive_lease(&lease.replica, &desc).map_err(|reason| {
                Error::IneligibleLeaseHolder {
                    range_id,
                    holder: lease.replica.replica_id,
                    reason,
                }
            })?;
        }
        state.desc = desc;
        Ok(())
    }

    pub fn liveness_epoch(&self, node_id: NodeId) -> Option<u64> {
        self.liveness.get(&node_id).map(|epoch| *epoch)
    }

    /// Records that `node_id` lost liveness; epoch-based leases at older
    /// epochs expire. Returns the new epoch.
    pub fn increment_liveness_epoch(&self, node_id: NodeId) -> u64 {
        let mut epoch = self.liveness.entry(node_id).or_insert(1);
        *epoch += 1;
        *epoch
    }

    /// The node's current epoch, starting it at 1 on first heartbeat.
    pub fn heartbeat(&self, node_id: NodeId) -> u64 {
        *self.liveness.entry(node_id).or_insert(1)
    }
}

/// Versioned user data of a range, shared by its replicas.
#[derive(Debug, Default)]
pub struct MvccData {
    versions: DashMap<Bytes, BTreeMap<HLCTimestamp, Bytes>>,
}

impl MvccData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest version of `key` at or below `ts`.
    pub fn get(&self, key: &[u8], ts: HLCTimestamp) -> Option<Bytes> {
        self.versions
            .get(key)
            .and_then(|versions| versions.range(..=ts).next_back().map(|(_, v)| v.clone()))
    }

    pub fn put(&self, key: Bytes, ts: HLCTimestamp, value: Bytes) {
        self.versions.entry(key).or_default().insert(ts, value);
    }
}
