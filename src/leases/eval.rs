// Evaluation of lease changes
//
// Evaluation turns a lease request into a LeaseChangeIntent without touching
// range state. The intent only takes effect once consensus commits it.
// Every outcome, success or rejection, carries a LeaseTrigger so metrics
// bookkeeping always has something to record against.

use super::{Lease, LeaseKind, LeaseSequence, LeaseStatus};
use crate::hlc::{HLCTimestamp, HLC};
use crate::membership::{check_can_receive_lease, IneligibleReason, ReplicaDescriptor};
use crate::store::RangeSnapshot;
use crate::{RangeId, ReplicaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Asks the incumbent to hand its lease to `lease.replica`.
///
/// `lease.start` is a lower bound; evaluation forwards it to a clock reading
/// taken under the range-wide latch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeaseRequest {
    pub lease: Lease,
    /// The lease the caller believed was active when it built the request.
    pub prev_lease: Option<Lease>,
}

/// Asks for a lease on behalf of `lease.replica`: a fresh acquisition or an
/// extension of the replica's own lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLeaseRequest {
    pub lease: Lease,
    pub prev_lease: Option<Lease>,
}

/// Inputs an evaluation reads. `state` must be loaded after latches are held.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub range_id: RangeId,
    /// The replica evaluating the request.
    pub evaluator: ReplicaDescriptor,
    pub clock: &'a HLC,
    pub state: &'a RangeSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseTransition {
    Acquisition,
    Extension,
    Transfer,
}

/// Side-effect descriptor handed to the caller's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseTrigger {
    pub is_transfer: bool,
    pub failed: bool,
}

impl LeaseTrigger {
    /// Awaiting the outcome of consensus.
    pub fn pending(is_transfer: bool) -> Self {
        Self {
            is_transfer,
            failed: false,
        }
    }

    pub fn failed(is_transfer: bool) -> Self {
        Self {
            is_transfer,
            failed: true,
        }
    }

    #[must_use]
    pub fn into_failed(self) -> Self {
        Self::failed(self.is_transfer)
    }
}

/// A proposed lease change, waiting to be ordered by consensus.
///
/// Not `Clone`: consumed exactly once by the proposer.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseChangeIntent {
    pub range_id: RangeId,
    /// The live lease this change supersedes.
    pub prev: Option<Lease>,
    pub next: Lease,
    pub transition: LeaseTransition,
}

impl LeaseChangeIntent {
    pub fn is_transfer(&self) -> bool {
        self.transition == LeaseTransition::Transfer
    }

    pub fn prev_proposed_ts(&self) -> Option<HLCTimestamp> {
        self.prev.as_ref().and_then(|prev| prev.proposed_ts)
    }
}

/// Successful evaluation.
#[derive(Debug)]
pub struct Evaluated {
    pub intent: LeaseChangeIntent,
    pub trigger: LeaseTrigger,
}

/// Why the live lease makes a transfer doomed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StaleLease {
    #[error("range has no lease to transfer")]
    NoLease,

    #[error("lease is held by replica {holder}, not by evaluating replica {evaluator} (request assumed seq {assumed_sequence:?})")]
    NotHeldByEvaluator {
        holder: ReplicaId,
        evaluator: ReplicaId,
        assumed_sequence: Option<u64>,
    },

    #[error("lease is {status:?} at {now}")]
    NotValid { status: LeaseStatus, now: HLCTimestamp },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("stale lease: {0}")]
    StaleLease(StaleLease),

    #[error("ineligible replica: {0}")]
    IneligibleReplica(#[from] IneligibleReason),

    #[error("illegal lease: {0}")]
    IllegalLease(String),

    #[error("sequence number should not be set")]
    SequenceSet,

    #[error("lease held by replica {holder} is still active")]
    LeaseConflict { holder: ReplicaId },
}

/// A lease change refused during evaluation. Range state is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot replace lease {} with {requested}: {reason}", existing_display(.existing.as_ref()))]
pub struct LeaseRejected {
    pub reason: RejectReason,
    pub existing: Option<Lease>,
    pub requested: Lease,
    pub trigger: LeaseTrigger,
}

fn existing_display(existing: Option<&Lease>) -> String {
    existing.map_or_else(|| "<none>".to_string(), ToString::to_string)
}

fn reject(
    reason: RejectReason,
    existing: Option<Lease>,
    requested: Lease,
    is_transfer: bool,
) -> LeaseRejected {
    LeaseRejected {
        reason,
        existing,
        requested,
        trigger: LeaseTrigger::failed(is_transfer),
    }
}

/// Evaluates a lease transfer.
///
/// The caller must hold latches over every key of the range, so that no
/// request served under the outgoing lease is still in flight. The outgoing
/// holder must also have stopped serving before issuing the transfer; this is
/// trusted, not checked. Unlike an acquisition, the new lease may overlap the
/// old one.
pub fn evaluate_transfer(
    ctx: &EvalContext<'_>,
    req: TransferLeaseRequest,
) -> Result<Evaluated, LeaseRejected> {
    // Compare against the live lease rather than the caller's view so doomed
    // transfers fail here instead of after a consensus round.
    let prev = ctx.state.lease.clone();

    // Taking the request apart by value leaves no pre-forwarding copy around.
    let TransferLeaseRequest {
        lease: mut new_lease,
        prev_lease: assumed_prev,
    } = req;

    // Every request served by the outgoing holder has drained, so this reading
    // is above all timestamps it served.
    let now = ctx.clock.now();
    new_lease.start.forward(now);
    new_lease.proposed_ts = Some(now);

    if let Err(stale) = check_transfer_source(ctx, prev.as_ref(), assumed_prev.as_ref(), now) {
        return Err(reject(RejectReason::StaleLease(stale), prev, new_lease, true));
    }

    if let Err(reason) = check_can_receive_lease(&new_lease.replica, &ctx.state.desc) {
        return Err(reject(reason.into(), prev, new_lease, true));
    }

    debug!(
        range_id = %ctx.range_id,
        prev = %existing_display(prev.as_ref()),
        new = %new_lease,
        "lease transfer"
    );
    eval_new_lease(ctx.range_id, prev, new_lease, LeaseTransition::Transfer)
}

fn check_transfer_source(
    ctx: &EvalContext<'_>,
    live: Option<&Lease>,
    assumed: Option<&Lease>,
    now: HLCTimestamp,
) -> Result<(), StaleLease> {
    let live = live.ok_or(StaleLease::NoLease)?;
    if !live.owned_by(ctx.evaluator.replica_id) {
        return Err(StaleLease::NotHeldByEvaluator {
            holder: live.replica.replica_id,
            evaluator: ctx.evaluator.replica_id,
            assumed_sequence: assumed.map(|lease| lease.sequence.0),
        });
    }
    let status = live.status(now, ctx.clock.max_offset(), ctx.state.holder_liveness_epoch);
    if !status.is_valid() {
        return Err(StaleLease::NotValid { status, now });
    }
    Ok(())
}

/// Evaluates a lease acquisition or extension by `req.lease.replica`.
///
/// A new holder's lease never overlaps its predecessor: it may only be
/// acquired once the previous lease has expired, and after an
/// expiration-based predecessor it starts strictly after that expiration.
pub fn evaluate_request(
    ctx: &EvalContext<'_>,
    req: RequestLeaseRequest,
) -> Result<Evaluated, LeaseRejected> {
    let prev = ctx.state.lease.clone();
    let RequestLeaseRequest {
        lease: mut new_lease,
        prev_lease: _,
    } = req;

    if let Err(reason) = check_can_receive_lease(&new_lease.replica, &ctx.state.desc) {
        return Err(reject(reason.into(), prev, new_lease, false));
    }

    let now = ctx.clock.now();
    new_lease.proposed_ts = Some(now);
    let status = LeaseStatus::of(
        prev.as_ref(),
        now,
        ctx.clock.max_offset(),
        ctx.state.holder_liveness_epoch,
    );

    let transition = match &prev {
        Some(p) if status.is_active() && p.owned_by(new_lease.replica.replica_id) => {
            new_lease.start = p.start;
            if let (Some(old), Some(new)) = (p.expiration(), new_lease.expiration()) {
                if new < old {
                    let msg = format!("extension would shorten expiration from {old} to {new}");
                    return Err(reject(RejectReason::IllegalLease(msg), prev, new_lease, false));
                }
            }
            LeaseTransition::Extension
        }
        Some(p) if status.is_active() => {
            let holder = p.replica.replica_id;
            return Err(reject(
                RejectReason::LeaseConflict { holder },
                prev,
                new_lease,
                false,
            ));
        }
        Some(p) => {
            new_lease.start.forward(now);
            if let Some(expiration) = p.expiration() {
                new_lease.start.forward(expiration.next());
            }
            LeaseTransition::Acquisition
        }
        None => {
            new_lease.start.forward(now);
            LeaseTransition::Acquisition
        }
    };

    debug!(
        range_id = %ctx.range_id,
        prev = %existing_display(prev.as_ref()),
        new = %new_lease,
        ?transition,
        "lease request"
    );
    eval_new_lease(ctx.range_id, prev, new_lease, transition)
}

/// Checks shared by every lease change and assembly of the intent.
fn eval_new_lease(
    range_id: RangeId,
    prev: Option<Lease>,
    mut lease: Lease,
    transition: LeaseTransition,
) -> Result<Evaluated, LeaseRejected> {
    let is_transfer = transition == LeaseTransition::Transfer;

    if let LeaseKind::Expiration { expiration } = lease.kind {
        if expiration <= lease.start {
            let msg = format!("interval=[{}, {expiration})", lease.start);
            return Err(reject(RejectReason::IllegalLease(msg), prev, lease, is_transfer));
        }
    }

    if !lease.sequence.is_unset() {
        return Err(reject(RejectReason::SequenceSet, prev, lease, is_transfer));
    }

    // Equivalent leases keep the sequence so commands proposed under the old
    // one still match. Apply refuses any intent whose prev is no longer the
    // active lease, so two racing intents cannot both claim the next sequence.
    lease.sequence = match &prev {
        Some(p) if p.equivalent(&lease) => p.sequence,
        Some(p) => p.sequence.next(),
        None => LeaseSequence(1),
    };

    Ok(Evaluated {
        intent: LeaseChangeIntent {
            range_id,
            prev,
            next: lease,
            transition,
        },
        trigger: LeaseTrigger::pending(is_transfer),
    })
}
