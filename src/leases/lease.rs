// Core lease data structures

use super::LeaseStatus;
use crate::hlc::HLCTimestamp;
use crate::membership::ReplicaDescriptor;
use crate::{NodeId, ReplicaId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default duration of an expiration-based lease (6 seconds)
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(6);

/// Position of a lease in the range's lease history. Equivalent leases
/// (extensions) share a sequence; every other new lease gets the next one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LeaseSequence(pub u64);

impl LeaseSequence {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_unset(self) -> bool {
        self.0 == 0
    }
}

/// How a lease bounds its validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseKind {
    /// Valid until a fixed timestamp.
    Expiration { expiration: HLCTimestamp },
    /// Valid while the holder's node liveness epoch equals `epoch`.
    Epoch { epoch: u64 },
}

/// A grant of exclusive serving authority over a range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Replica holding this lease
    pub replica: ReplicaDescriptor,

    /// First timestamp at which the holder may serve
    pub start: HLCTimestamp,

    pub kind: LeaseKind,

    /// Clock reading at which the lease was proposed
    pub proposed_ts: Option<HLCTimestamp>,

    /// Assigned during evaluation; requests leave it unset
    pub sequence: LeaseSequence,
}

impl Lease {
    /// A candidate expiration-based lease for `replica`, as a request carries it.
    pub fn expiration_based(
        replica: ReplicaDescriptor,
        start: HLCTimestamp,
        duration: Duration,
    ) -> Self {
        Self {
            replica,
            start,
            kind: LeaseKind::Expiration {
                expiration: start.add(duration),
            },
            proposed_ts: None,
            sequence: LeaseSequence::default(),
        }
    }

    /// A candidate epoch-based lease for `replica`.
    pub fn epoch_based(replica: ReplicaDescriptor, start: HLCTimestamp, epoch: u64) -> Self {
        Self {
            replica,
            start,
            kind: LeaseKind::Epoch { epoch },
            proposed_ts: None,
            sequence: LeaseSequence::default(),
        }
    }

    pub fn expiration(&self) -> Option<HLCTimestamp> {
        match self.kind {
            LeaseKind::Expiration { expiration } => Some(expiration),
            LeaseKind::Epoch { .. } => None,
        }
    }

    pub fn epoch(&self) -> Option<u64> {
        match self.kind {
            LeaseKind::Epoch { epoch } => Some(epoch),
            LeaseKind::Expiration { .. } => None,
        }
    }

    pub fn holder(&self) -> NodeId {
        self.replica.node_id
    }

    pub fn owned_by(&self, replica_id: ReplicaId) -> bool {
        self.replica.replica_id == replica_id
    }

    /// Status of the lease at `now`.
    ///
    /// An expiration-based lease stops being usable `max_offset` before its
    /// expiration (stasis), because another node's clock may already read
    /// past the expiration. An epoch-based lease expires once the holder's
    /// liveness epoch has moved past the lease epoch.
    pub fn status(
        &self,
        now: HLCTimestamp,
        max_offset: Duration,
        holder_liveness_epoch: Option<u64>,
    ) -> LeaseStatus {
        match self.kind {
            LeaseKind::Expiration { expiration } => {
                if now >= expiration {
                    LeaseStatus::Expired
                } else if now.add(max_offset) >= expiration {
                    LeaseStatus::Stasis
                } else {
                    LeaseStatus::Valid
                }
            }
            LeaseKind::Epoch { epoch } => match holder_liveness_epoch {
                Some(live) if live > epoch => LeaseStatus::Expired,
                _ => LeaseStatus::Valid,
            },
        }
    }

    /// Whether `new` is the same lease as `self`, possibly extended.
    ///
    /// Proposal timestamp and sequence are ignored. An expiration-based lease
    /// may only be extended, never shortened.
    pub fn equivalent(&self, new: &Lease) -> bool {
        if self.replica.replica_id != new.replica.replica_id
            || self.replica.node_id != new.replica.node_id
            || self.start != new.start
        {
            return false;
        }
        match (self.kind, new.kind) {
            (LeaseKind::Epoch { epoch: a }, LeaseKind::Epoch { epoch: b }) => a == b,
            (
                LeaseKind::Expiration { expiration: a },
                LeaseKind::Expiration { expiration: b },
            ) => b >= a,
            _ => false,
        }
    }

    /// Whether `self` may replace `prev` as the range's active lease.
    ///
    /// The first lease of a range has sequence 1. An equivalent lease keeps
    /// its predecessor's sequence; any other successor takes the next
    /// sequence and starts strictly after its predecessor started. An
    /// expiration-based lease must expire after it starts.
    pub fn supersedes(&self, prev: Option<&Lease>) -> bool {
        if let LeaseKind::Expiration { expiration } = self.kind {
            if expiration <= self.start {
                return false;
            }
        }
        match prev {
            None => self.sequence == LeaseSequence(1),
            Some(prev) if prev.equivalent(self) => self.sequence == prev.sequence,
            Some(prev) => self.sequence == prev.sequence.next() && self.start > prev.start,
        }
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "repl={} seq={} start={}",
            self.replica, self.sequence.0, self.start
        )?;
        match self.kind {
            LeaseKind::Expiration { expiration } => write!(f, " exp={expiration}")?,
            LeaseKind::Epoch { epoch } => write!(f, " epo={epoch}")?,
        }
        if let Some(proposed) = self.proposed_ts {
            write!(f, " pro={proposed}")?;
        }
        Ok(())
    }
}
