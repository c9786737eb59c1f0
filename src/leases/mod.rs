// Range lease management
//
// A lease grants one replica exclusive authority to serve reads and writes
// for its range. This module holds the lease types and the evaluation of
// lease changes:
// - acquisition and extension by the (prospective) holder
// - transfer from the incumbent to another voter

pub mod eval;
pub mod lease;
pub mod state;

pub use eval::{
    evaluate_request, evaluate_transfer, EvalContext, Evaluated, LeaseChangeIntent,
    LeaseRejected, LeaseTransition, LeaseTrigger, RejectReason, RequestLeaseRequest, StaleLease,
    TransferLeaseRequest,
};
pub use lease::{Lease, LeaseKind, LeaseSequence, DEFAULT_LEASE_DURATION};
pub use state::LeaseStatus;
