// Ordering and committing lease changes
//
// The core only needs "propose and wait for commit". InMemoryLog is a single
// process stand-in: it encodes the intent, appends it to a log and applies it
// to the shared store, with knobs for latency and injected failures.

use crate::error::ProposalError;
use crate::leases::{Lease, LeaseChangeIntent};
use crate::store::{LeaseApplyError, LeaseStateStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a committed proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applied {
    /// Log position the change was committed at.
    pub index: u64,
    /// The lease now active for the range.
    pub lease: Lease,
}

#[async_trait]
pub trait ConsensusProposer: Send + Sync + std::fmt::Debug {
    /// Durably orders `intent` and applies it. Nothing is visible to readers
    /// of range state before this returns `Ok`.
    async fn propose(&self, intent: LeaseChangeIntent) -> Result<Applied, ProposalError>;
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub index: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct InMemoryLog {
    store: Arc<LeaseStateStore>,
    entries: Mutex<Vec<LogEntry>>,
    latency: Mutex<Duration>,
    fail_next: AtomicUsize,
}

impl InMemoryLog {
    pub fn new(store: Arc<LeaseStateStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Delay before each proposal commits.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fails the next `count` proposals as unavailable without committing them.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn append(&self, payload: Vec<u8>) -> u64 {
        let mut entries = self.entries.lock();
        let index = entries.len() as u64 + 1;
        entries.push(LogEntry { index, payload });
        index
    }

    // Replays an entry the way every replica's state machine would.
    fn apply(&self, entry_payload: &[u8]) -> Result<Lease, ProposalError> {
        let intent: LeaseChangeIntent = bincode::deserialize(entry_payload)
            .map_err(|e| ProposalError::Encoding(e.to_string()))?;
        let LeaseChangeIntent {
            range_id,
            prev,
            next,
            ..
        } = intent;
        match self
            .store
            .apply_committed_lease(range_id, prev.as_ref(), next.clone())
        {
            Ok(()) => Ok(next),
            Err(e @ LeaseApplyError::RangeNotFound(_)) => {
                Err(ProposalError::Unavailable(e.to_string()))
            }
            Err(e) => Err(ProposalError::Rejected(e.to_string())),
        }
    }
}

#[async_trait]
impl ConsensusProposer for InMemoryLog {
    async fn propose(&self, intent: LeaseChangeIntent) -> Result<Applied, ProposalError> {
        if self.take_injected_failure() {
            warn!(range_id = %intent.range_id, "injected consensus failure");
            return Err(ProposalError::Unavailable("injected failure".to_string()));
        }

        let payload =
            bincode::serialize(&intent).map_err(|e| ProposalError::Encoding(e.to_string()))?;

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let index = self.append(payload.clone());
        let lease = self.apply(&payload)?;
        debug!(range_id = %intent.range_id, index, lease = %lease, "lease change committed");
        Ok(Applied { index, lease })
    }
}
