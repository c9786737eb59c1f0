// The range-processing path of one replica
//
// Every command runs under latches declared for it, reads range state only
// after the latches are held, and sends lease changes through consensus.
// Range state is never mutated outside that path.

pub mod metrics;

pub use metrics::{LeaseMetrics, LeaseMetricsSnapshot};

use crate::config::{LeaseKindConfig, ReplicaConfig};
use crate::consensus::ConsensusProposer;
use crate::error::ProposalError;
use crate::hlc::{HLCTimestamp, HLC};
use crate::latch::{self, LatchManager};
use crate::leases::{
    evaluate_request, evaluate_transfer, EvalContext, Evaluated, Lease, LeaseRejected,
    LeaseStatus, RequestLeaseRequest, TransferLeaseRequest,
};
use crate::membership::{RangeDescriptor, ReplicaDescriptor};
use crate::store::{LeaseStateStore, MvccData, RangeSnapshot};
use crate::tscache::TimestampCache;
use crate::{Error, RangeId, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared collaborators of every replica of a range.
#[derive(Debug, Clone)]
pub struct RangeHandles {
    pub store: Arc<LeaseStateStore>,
    pub data: Arc<MvccData>,
    pub proposer: Arc<dyn ConsensusProposer>,
}

#[derive(Debug)]
pub struct Replica {
    range_id: RangeId,
    ident: ReplicaDescriptor,
    clock: Arc<HLC>,
    handles: RangeHandles,
    latches: LatchManager,
    tscache: TimestampCache,
    metrics: LeaseMetrics,
    transfers_in_flight: AtomicUsize,
    config: ReplicaConfig,
}

// Marks the replica as relinquishing its lease for as long as it lives.
struct TransferMark<'a>(&'a AtomicUsize);

impl<'a> TransferMark<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for TransferMark<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Replica {
    pub fn new(
        range_id: RangeId,
        ident: ReplicaDescriptor,
        clock: Arc<HLC>,
        handles: RangeHandles,
        config: ReplicaConfig,
    ) -> Self {
        Self {
            range_id,
            ident,
            clock,
            handles,
            latches: LatchManager::new(),
            tscache: TimestampCache::with_capacity(config.timestamp_cache_size),
            metrics: LeaseMetrics::new(),
            transfers_in_flight: AtomicUsize::new(0),
            config,
        }
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    pub fn ident(&self) -> ReplicaDescriptor {
        self.ident
    }

    pub fn clock(&self) -> &HLC {
        self.clock.as_ref()
    }

    pub fn latches(&self) -> &LatchManager {
        &self.latches
    }

    pub fn tscache(&self) -> &TimestampCache {
        &self.tscache
    }

    pub fn metrics(&self) -> LeaseMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_transferring(&self) -> bool {
        self.transfers_in_flight.load(Ordering::SeqCst) > 0
    }

    /// Hands this replica's lease to `target`.
    ///
    /// Marks the replica as no longer serving, waits for every in-flight
    /// command on the range to drain, then evaluates and proposes the
    /// transfer. A transfer to the replica that already holds the lease
    /// succeeds without doing anything. Dropping the returned future before
    /// the proposal commits leaves range state untouched.
    pub async fn transfer_lease(&self, target: ReplicaDescriptor) -> Result<Lease> {
        let assumed = self.handles.store.get_active_lease(self.range_id)?;
        if let Some(lease) = assumed.as_ref().filter(|l| l.owned_by(target.replica_id)) {
            debug!(range_id = %self.range_id, target = %target, "lease already held by target");
            return Ok(lease.clone());
        }

        let _mark = TransferMark::new(&self.transfers_in_flight);
        let candidate = self.candidate_lease(target);
        let desc = self.handles.store.get_membership(self.range_id)?;

        let _latches = self
            .latches
            .acquire(latch::declare_keys_transfer_lease(&desc))
            .await;
        let state = self.load_state()?;
        let ctx = self.eval_context(&state);
        let req = TransferLeaseRequest {
            lease: candidate,
            prev_lease: assumed,
        };
        let evaluated = evaluate_transfer(&ctx, req).map_err(|e| self.rejected(e))?;
        self.propose(evaluated).await
    }

    /// Acquires a lease for this replica, or extends the one it holds.
    pub async fn request_lease(&self) -> Result<Lease> {
        if self.is_transferring() {
            return Err(Error::TransferInProgress {
                range_id: self.range_id,
                replica: self.ident.replica_id,
            });
        }
        if self.config.lease_kind == LeaseKindConfig::Epoch {
            self.handles.store.heartbeat(self.ident.node_id);
        }
        let candidate = self.candidate_lease(self.ident);
        let desc = self.handles.store.get_membership(self.range_id)?;

        let _latches = self
            .latches
            .acquire(latch::declare_keys_request_lease(&desc))
            .await;
        let state = self.load_state()?;
        let ctx = self.eval_context(&state);
        let req = RequestLeaseRequest {
            lease: candidate,
            prev_lease: state.lease.clone(),
        };
        let evaluated = evaluate_request(&ctx, req).map_err(|e| self.rejected(e))?;
        self.propose(evaluated).await
    }

    /// Reads `key` at `ts`. Only the holder of a valid lease serves reads.
    pub async fn get(&self, key: Bytes, ts: HLCTimestamp) -> Result<Option<Bytes>> {
        self.check_key(&key)?;
        let _latches = self
            .latches
            .acquire(latch::declare_keys_get(key.clone(), ts))
            .await;
        self.check_serving(ts)?;

        let value = self.handles.data.get(&key, ts);
        self.tscache.record_read(key, ts);
        Ok(value)
    }

    /// Writes `key` at or above `ts`, pushed above any read of the key.
    /// Returns the timestamp the write landed at.
    pub async fn put(&self, key: Bytes, value: Bytes, ts: HLCTimestamp) -> Result<HLCTimestamp> {
        self.check_key(&key)?;
        let _latches = self
            .latches
            .acquire(latch::declare_keys_put(key.clone(), ts))
            .await;
        self.check_serving(ts)?;

        let mut write_ts = ts;
        let read_ts = self.tscache.max_read(&key);
        if write_ts <= read_ts {
            write_ts = read_ts.next();
            debug!(range_id = %self.range_id, %ts, %write_ts, "write pushed above read");
        }
        self.clock.update(write_ts)?;
        self.handles.data.put(key, write_ts, value);
        Ok(write_ts)
    }

    /// Replaces the voting configuration. Only the holder of a valid lease
    /// may do so, under latches that conflict with its transfer barrier, so
    /// eligibility is always checked against the descriptor in effect. The
    /// holder cannot demote itself; it must transfer the lease first.
    pub async fn change_membership(
        &self,
        replicas: Vec<ReplicaDescriptor>,
    ) -> Result<RangeDescriptor> {
        let desc = self.handles.store.get_membership(self.range_id)?;
        let _latches = self
            .latches
            .acquire(latch::declare_keys_change_membership(&desc))
            .await;
        self.check_serving(self.clock.now())?;
        let next = self
            .handles
            .store
            .get_membership(self.range_id)?
            .with_replicas(replicas);
        self.handles.store.set_membership(next.clone())?;
        info!(
            range_id = %self.range_id,
            generation = next.generation,
            voters = next.voters().count(),
            "membership changed"
        );
        Ok(next)
    }

    // Snapshots range state and moves the clock past the committed lease's
    // start, which may have been read from another node's clock.
    fn load_state(&self) -> Result<RangeSnapshot> {
        let state = self.handles.store.snapshot(self.range_id)?;
        if let Some(lease) = &state.lease {
            self.clock.update(lease.start)?;
        }
        Ok(state)
    }

    fn eval_context<'a>(&'a self, state: &'a RangeSnapshot) -> EvalContext<'a> {
        EvalContext {
            range_id: self.range_id,
            evaluator: self.ident,
            clock: self.clock.as_ref(),
            state,
        }
    }

    // The not-yet-forwarded lease a request carries.
    fn candidate_lease(&self, holder: ReplicaDescriptor) -> Lease {
        let start = self.clock.now();
        match self.config.lease_kind {
            LeaseKindConfig::Expiration => {
                Lease::expiration_based(holder, start, self.config.lease_duration())
            }
            LeaseKindConfig::Epoch => {
                let epoch = self
                    .handles
                    .store
                    .liveness_epoch(holder.node_id)
                    .unwrap_or(1);
                Lease::epoch_based(holder, start, epoch)
            }
        }
    }

    fn rejected(&self, rejected: LeaseRejected) -> Error {
        self.metrics.record(rejected.trigger);
        warn!(
            range_id = %self.range_id,
            replica = %self.ident.replica_id,
            %rejected,
            "lease change rejected"
        );
        rejected.into()
    }

    async fn propose(&self, evaluated: Evaluated) -> Result<Lease> {
        let Evaluated { intent, trigger } = evaluated;
        let transition = intent.transition;
        let timeout = self.config.proposal_timeout();

        let proposal = self.handles.proposer.propose(intent);
        let result = match tokio::time::timeout(timeout, proposal).await {
            Ok(result) => result,
            Err(_) => Err(ProposalError::Timeout(timeout)),
        };
        match result {
            Ok(applied) => {
                self.metrics.record(trigger);
                info!(
                    range_id = %self.range_id,
                    ?transition,
                    index = applied.index,
                    lease = %applied.lease,
                    "lease change committed"
                );
                Ok(applied.lease)
            }
            Err(e) => {
                self.metrics.record(trigger.into_failed());
                warn!(range_id = %self.range_id, ?transition, error = %e, "lease proposal failed");
                Err(e.into())
            }
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        let desc = self.handles.store.get_membership(self.range_id)?;
        if !desc.contains_key(key) {
            return Err(Error::KeyOutOfRange {
                range_id: self.range_id,
                key: Bytes::copy_from_slice(key),
            });
        }
        Ok(())
    }

    // Must run with the request's latches held.
    fn check_serving(&self, ts: HLCTimestamp) -> Result<()> {
        let state = self.load_state()?;
        let holder = state.lease.as_ref().map(|l| l.replica.replica_id);
        let not_holder = || Error::NotLeaseHolder {
            range_id: self.range_id,
            replica: self.ident.replica_id,
            holder,
        };

        if self.is_transferring() {
            return Err(not_holder());
        }
        let Some(lease) = state.lease.as_ref().filter(|l| l.owned_by(self.ident.replica_id))
        else {
            return Err(not_holder());
        };

        self.clock.update(ts)?;
        let now = self.clock.now();
        let status = LeaseStatus::of(
            Some(lease),
            now,
            self.clock.max_offset(),
            state.holder_liveness_epoch,
        );
        if !status.is_valid() {
            debug!(range_id = %self.range_id, ?status, %now, "lease not valid for serving");
            return Err(not_holder());
        }
        if ts < lease.start {
            return Err(Error::BelowLeaseStart {
                ts,
                start: lease.start,
            });
        }
        // Reads served under earlier leases all sit below this lease's start.
        self.tscache.forward_low_water(lease.start);
        Ok(())
    }
}
