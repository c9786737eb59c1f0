// Range membership and lease eligibility

use crate::{NodeId, RangeId, ReplicaId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Role of a replica in the range's consensus group.
///
/// The `Voter*` transitional kinds appear while a joint configuration
/// change is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaType {
    VoterFull,
    /// Voter in the incoming configuration only (being added).
    VoterIncoming,
    /// Voter in the outgoing configuration only (being removed).
    VoterOutgoing,
    /// Voter being demoted to a learner.
    VoterDemoting,
    /// Non-voting member receiving a snapshot before promotion.
    Learner,
    /// Permanent non-voting member.
    NonVoter,
}

impl ReplicaType {
    /// Whether the replica votes in the configuration that results from any
    /// in-flight membership change.
    pub fn is_voter_new_config(self) -> bool {
        matches!(self, ReplicaType::VoterFull | ReplicaType::VoterIncoming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub replica_id: ReplicaId,
    pub kind: ReplicaType,
}

impl ReplicaDescriptor {
    pub fn voter(node_id: NodeId, replica_id: ReplicaId) -> Self {
        Self {
            node_id,
            replica_id,
            kind: ReplicaType::VoterFull,
        }
    }

    pub fn learner(node_id: NodeId, replica_id: ReplicaId) -> Self {
        Self {
            node_id,
            replica_id,
            kind: ReplicaType::Learner,
        }
    }
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, replica {}, {:?})", self.node_id, self.replica_id, self.kind)
    }
}

/// Membership of a range: its key bounds and replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Bytes,
    pub end_key: Bytes,
    pub replicas: Vec<ReplicaDescriptor>,
    /// Bumped on every membership change.
    pub generation: u64,
}

impl RangeDescriptor {
    pub fn new(
        range_id: RangeId,
        start_key: impl Into<Bytes>,
        end_key: impl Into<Bytes>,
        replicas: Vec<ReplicaDescriptor>,
    ) -> Self {
        Self {
            range_id,
            start_key: start_key.into(),
            end_key: end_key.into(),
            replicas,
            generation: 0,
        }
    }

    pub fn replica(&self, replica_id: ReplicaId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.replica_id == replica_id)
    }

    pub fn voters(&self) -> impl Iterator<Item = &ReplicaDescriptor> {
        self.replicas.iter().filter(|r| r.kind.is_voter_new_config())
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.start_key.as_ref() <= key && key < self.end_key.as_ref()
    }

    /// Replaces the replica set and bumps the generation.
    pub fn with_replicas(&self, replicas: Vec<ReplicaDescriptor>) -> Self {
        Self {
            replicas,
            generation: self.generation + 1,
            ..self.clone()
        }
    }
}

/// Why a replica may not hold the lease.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum IneligibleReason {
    #[error("replica {replica_id} not found in range descriptor of {range_id}")]
    NotFound {
        range_id: RangeId,
        replica_id: ReplicaId,
    },

    #[error("replica {replica_id} of type {kind:?} cannot hold lease")]
    NotVoter {
        replica_id: ReplicaId,
        kind: ReplicaType,
    },
}

/// Checks whether `candidate` may hold the lease under the live membership
/// `desc`. Only replicas that vote in the new configuration are eligible;
/// learners and voters on their way out are rejected.
///
/// The candidate's role is taken from `desc`, never from the caller's copy of
/// the descriptor, since membership may have changed since the request was built.
pub fn check_can_receive_lease(
    candidate: &ReplicaDescriptor,
    desc: &RangeDescriptor,
) -> Result<(), IneligibleReason> {
    let current = desc
        .replica(candidate.replica_id)
        .filter(|r| r.node_id == candidate.node_id)
        .ok_or(IneligibleReason::NotFound {
            range_id: desc.range_id,
            replica_id: candidate.replica_id,
        })?;

    if !current.kind.is_voter_new_config() {
        return Err(IneligibleReason::NotVoter {
            replica_id: current.replica_id,
            kind: current.kind,
        });
    }
    Ok(())
}
