// Latch declarations per command
//
// Every command declares at least one addressable key of its range, so a
// command declaring all of them conflicts with everything.

use super::{SpanAccess, SpanSet};
use crate::hlc::HLCTimestamp;
use crate::keys::{self, Span, SpanScope};
use crate::membership::RangeDescriptor;
use bytes::Bytes;

/// Non-MVCC write over every addressable key of the range: its range-local
/// keys and its whole user keyspace.
pub fn declare_all_keys(desc: &RangeDescriptor) -> SpanSet {
    let mut spans = SpanSet::new();
    spans.add_non_mvcc(SpanAccess::ReadWrite, keys::range_local_span(desc.range_id));
    spans.add_non_mvcc(
        SpanAccess::ReadWrite,
        Span::range(SpanScope::Global, desc.start_key.clone(), desc.end_key.clone()),
    );
    spans
}

/// A lease transfer must not run concurrently with any other request on the
/// outgoing leaseholder, and it must see the timestamp cache only after every
/// in-flight request has finished. It therefore latches every key of the
/// range even though it writes only the lease key.
///
/// Declaring MVCC writes at the new lease's start instead would let reads
/// below that timestamp through. That is only safe once every read latch,
/// non-transactional ones included, accounts for clock uncertainty, which is
/// not the case here.
pub fn declare_keys_transfer_lease(desc: &RangeDescriptor) -> SpanSet {
    declare_all_keys(desc)
}

/// Acquisition and extension only touch the lease record and read membership.
pub fn declare_keys_request_lease(desc: &RangeDescriptor) -> SpanSet {
    let mut spans = SpanSet::new();
    spans.add_non_mvcc(
        SpanAccess::ReadWrite,
        Span::key(SpanScope::Local, keys::range_lease_key(desc.range_id)),
    );
    spans.add_non_mvcc(
        SpanAccess::ReadOnly,
        Span::key(SpanScope::Local, keys::range_descriptor_key(desc.range_id)),
    );
    spans
}

pub fn declare_keys_change_membership(desc: &RangeDescriptor) -> SpanSet {
    let mut spans = SpanSet::new();
    spans.add_non_mvcc(
        SpanAccess::ReadWrite,
        Span::key(SpanScope::Local, keys::range_descriptor_key(desc.range_id)),
    );
    spans
}

pub fn declare_keys_get(key: Bytes, timestamp: HLCTimestamp) -> SpanSet {
    let mut spans = SpanSet::new();
    spans.add_mvcc(SpanAccess::ReadOnly, Span::key(SpanScope::Global, key), timestamp);
    spans
}

pub fn declare_keys_put(key: Bytes, timestamp: HLCTimestamp) -> SpanSet {
    let mut spans = SpanSet::new();
    spans.add_mvcc(SpanAccess::ReadWrite, Span::key(SpanScope::Global, key), timestamp);
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::ReplicaDescriptor;
    use crate::{NodeId, RangeId, ReplicaId};

    fn desc() -> RangeDescriptor {
        RangeDescriptor::new(
            RangeId(3),
            "b",
            "m",
            vec![ReplicaDescriptor::voter(NodeId(1), ReplicaId(1))],
        )
    }

    #[test]
    fn test_transfer_conflicts_with_every_request() {
        let desc = desc();
        let transfer = declare_keys_transfer_lease(&desc);
        let far_future = HLCTimestamp::new(u64::MAX, 0);

        assert!(transfer.conflicts_with(&declare_keys_get(Bytes::from("b"), far_future)));
        let early = HLCTimestamp::new(1, 0);
        assert!(transfer.conflicts_with(&declare_keys_get(Bytes::from("lz"), early)));
        assert!(transfer.conflicts_with(&declare_keys_put(Bytes::from("c"), far_future)));
        assert!(transfer.conflicts_with(&declare_keys_request_lease(&desc)));
        assert!(transfer.conflicts_with(&declare_keys_change_membership(&desc)));
        assert!(transfer.conflicts_with(&declare_keys_transfer_lease(&desc)));
    }

    #[test]
    fn test_transfer_ignores_keys_of_other_ranges() {
        let transfer = declare_keys_transfer_lease(&desc());
        let outside = declare_keys_get(Bytes::from("x"), HLCTimestamp::new(1, 0));
        assert!(!transfer.conflicts_with(&outside));

        let mut other = desc();
        other.range_id = RangeId(4);
        other.start_key = Bytes::from("m");
        other.end_key = Bytes::from("z");
        assert!(!transfer.conflicts_with(&declare_keys_request_lease(&other)));
    }

    #[test]
    fn test_request_lease_leaves_user_keys_alone() {
        let desc = desc();
        let request = declare_keys_request_lease(&desc);
        let put = declare_keys_put(Bytes::from("c"), HLCTimestamp::new(1, 0));
        assert!(!request.conflicts_with(&put));
        assert!(request.conflicts_with(&declare_keys_request_lease(&desc)));
        assert!(request.conflicts_with(&declare_keys_change_membership(&desc)));
    }

    #[test]
    fn test_transfer_barrier_covers_last_range_id() {
        let mut desc = desc();
        desc.range_id = RangeId(u64::MAX);
        let transfer = declare_keys_transfer_lease(&desc);
        assert!(transfer.conflicts_with(&declare_keys_request_lease(&desc)));
        assert!(transfer.conflicts_with(&declare_keys_change_membership(&desc)));
    }
}
