use crate::hlc::HLCTimestamp;
use crate::leases::LeaseRejected;
use crate::membership::IneligibleReason;
use crate::{RangeId, ReplicaId};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("lease rejected: {0}")]
    LeaseRejected(Box<LeaseRejected>),

    #[error("lease proposal failed: {0}")]
    ProposalFailed(#[from] ProposalError),

    #[error("replica {replica} is not the leaseholder of {range_id} (holder: {holder:?})")]
    NotLeaseHolder {
        range_id: RangeId,
        replica: ReplicaId,
        holder: Option<ReplicaId>,
    },

    #[error("lease of {range_id} is being transferred away from replica {replica}")]
    TransferInProgress { range_id: RangeId, replica: ReplicaId },

    #[error("request at {ts} is below the start {start} of the serving lease")]
    BelowLeaseStart { ts: HLCTimestamp, start: HLCTimestamp },

    #[error("range {0} not found")]
    RangeNotFound(RangeId),

    #[error("range {0} already exists")]
    RangeExists(RangeId),

    #[error("key {key:?} is outside of range {range_id}")]
    KeyOutOfRange { range_id: RangeId, key: bytes::Bytes },

    #[error("stale range descriptor for {range_id}: generation {proposed} does not follow {current}")]
    StaleDescriptor {
        range_id: RangeId,
        current: u64,
        proposed: u64,
    },

    #[error("lease holder {holder} of {range_id} would not be eligible: {reason}")]
    IneligibleLeaseHolder {
        range_id: RangeId,
        holder: ReplicaId,
        reason: IneligibleReason,
    },

    #[error("Clock error: {0}")]
    Clock(#[from] crate::hlc::HLCError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<LeaseRejected> for Error {
    fn from(rejected: LeaseRejected) -> Self {
        Error::LeaseRejected(Box::new(rejected))
    }
}

impl Error {
    /// The evaluation rejection behind this error, if any.
    pub fn as_lease_rejected(&self) -> Option<&LeaseRejected> {
        match self {
            Error::LeaseRejected(rejected) => Some(rejected.as_ref()),
            _ => None,
        }
    }
}

/// Failure to get a lease change durably committed. Whether to retry is the
/// caller's decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProposalError {
    #[error("rejected at apply: {0}")]
    Rejected(String),

    #[error("consensus unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode proposal: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, Error>;
