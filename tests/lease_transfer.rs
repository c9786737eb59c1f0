use range_lease::config::{LeaseKindConfig, ReplicaConfig};
use range_lease::consensus::ConsensusProposer;
use range_lease::error::ProposalError;
use range_lease::latch::declare_keys_get;
use range_lease::leases::{
    LeaseChangeIntent, LeaseSequence, LeaseTrigger, RejectReason, StaleLease,
};
use range_lease::membership::{IneligibleReason, RangeDescriptor, ReplicaDescriptor};
use range_lease::test_utils::{TestRange, TEST_RANGE};
use range_lease::{Error, NodeId, ReplicaId};
use bytes::Bytes;
use std::time::Duration;

fn three_voters() -> RangeDescriptor {
    RangeDescriptor::new(
        TEST_RANGE,
        "a",
        "z",
        vec![
            ReplicaDescriptor::voter(NodeId(1), ReplicaId(1)),
            ReplicaDescriptor::voter(NodeId(2), ReplicaId(2)),
            ReplicaDescriptor::voter(NodeId(3), ReplicaId(3)),
        ],
    )
}

#[tokio::test]
async fn test_transfer_to_voter_commits_overlapping_lease() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let a = range.replica(1);
    let prev = a.request_lease().await.unwrap();
    assert_eq!(prev.sequence, LeaseSequence(1));

    range.clock.advance(Duration::from_millis(100));
    let before_barrier = a.clock().now();
    let lease = a.transfer_lease(range.ident(2)).await.unwrap();

    assert!(lease.owned_by(ReplicaId(2)));
    assert_eq!(lease.sequence, LeaseSequence(2));
    assert!(lease.start > before_barrier);
    assert!(lease.start < prev.expiration().unwrap());
    assert_eq!(lease.proposed_ts, Some(lease.start));
    assert_eq!(range.store.get_active_lease(TEST_RANGE).unwrap(), Some(lease));
    assert_eq!(a.metrics().transfer_success, 1);
    assert!(!a.is_transferring());
    assert!(a.latches().is_empty());
}

#[tokio::test]
async fn test_transfer_to_learner_rejected() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let a = range.replica(1);
    let prev = a.request_lease().await.unwrap();

    let err = a.transfer_lease(range.ident(3)).await.unwrap_err();
    let rejected = err.as_lease_rejected().unwrap();
    assert!(matches!(
        rejected.reason,
        RejectReason::IneligibleReplica(IneligibleReason::NotVoter { replica_id: ReplicaId(3), .. })
    ));
    assert_eq!(rejected.trigger, LeaseTrigger::failed(true));
    assert_eq!(rejected.existing, Some(prev.clone()));

    assert_eq!(range.store.get_active_lease(TEST_RANGE).unwrap(), Some(prev));
    assert_eq!(range.log.len(), 1);
    assert_eq!(a.metrics().transfer_error, 1);
    assert!(a.latches().is_empty());
}

#[tokio::test]
async fn test_concurrent_transfers_second_sees_new_lease() {
    let range = TestRange::with_descriptor(three_voters(), ReplicaConfig::default()).unwrap();
    let a = range.replica(1);
    a.request_lease().await.unwrap();
    range.log.set_latency(Duration::from_millis(20));

    let (first, second) = tokio::join!(
        a.transfer_lease(range.ident(2)),
        a.transfer_lease(range.ident(3)),
    );

    let winner = first.unwrap();
    assert!(winner.owned_by(ReplicaId(2)));
    let rejected = second.unwrap_err();
    let rejected = rejected.as_lease_rejected().unwrap();
    assert_eq!(
        rejected.reason,
        RejectReason::StaleLease(StaleLease::NotHeldByEvaluator {
            holder: ReplicaId(2),
            evaluator: ReplicaId(1),
            assumed_sequence: Some(1),
        })
    );
    assert_eq!(rejected.existing.as_ref(), Some(&winner));

    assert_eq!(range.store.get_active_lease(TEST_RANGE).unwrap(), Some(winner));
    assert_eq!(range.log.len(), 2);
    let metrics = a.metrics();
    assert_eq!((metrics.transfer_success, metrics.transfer_error), (1, 1));
}

#[tokio::test]
async fn test_failed_proposal_leaves_lease_unchanged() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let a = range.replica(1);
    let prev = a.request_lease().await.unwrap();

    range.log.fail_next(1);
    let err = a.transfer_lease(range.ident(2)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ProposalFailed(ProposalError::Unavailable(_))
    ));
    assert_eq!(range.store.get_active_lease(TEST_RANGE).unwrap(), Some(prev));
    assert_eq!(a.metrics().transfer_error, 1);

    // The caller may retry against refreshed state.
    let lease = a.transfer_lease(range.ident(2)).await.unwrap();
    assert_eq!(lease.sequence, LeaseSequence(2));
}

#[tokio::test(start_paused = true)]
async fn test_proposal_timeout_surfaces_as_failure() {
    let config = ReplicaConfig {
        proposal_timeout: 10,
        ..ReplicaConfig::default()
    };
    let range = TestRange::new(config).unwrap();
    let a = range.replica(1);
    let prev = a.request_lease().await.unwrap();

    range.log.set_latency(Duration::from_secs(1));
    let err = a.transfer_lease(range.ident(2)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ProposalFailed(ProposalError::Timeout(d)) if d == Duration::from_millis(10)
    ));
    assert_eq!(range.store.get_active_lease(TEST_RANGE).unwrap(), Some(prev));
    assert_eq!(range.log.len(), 1);
    assert!(!a.is_transferring());
    assert!(a.latches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_transfer_releases_barrier() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let a = range.replica(1);
    let prev = a.request_lease().await.unwrap();

    let ts = a.clock().now();
    let in_flight = a
        .latches()
        .acquire(declare_keys_get(Bytes::from("k"), ts))
        .await;

    let cancelled =
        tokio::time::timeout(Duration::from_millis(10), a.transfer_lease(range.ident(2))).await;
    assert!(cancelled.is_err());
    assert_eq!(a.latches().len(), 1);
    assert!(!a.is_transferring());
    assert_eq!(range.store.get_active_lease(TEST_RANGE).unwrap(), Some(prev));
    drop(in_flight);

    // Still the holder; nothing is left blocking requests.
    a.put(Bytes::from("k"), Bytes::from("v"), a.clock().now()).await.unwrap();
}

#[tokio::test]
async fn test_transfer_waits_for_in_flight_request() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let a = range.replica(1);
    a.request_lease().await.unwrap();

    let ts = a.clock().now();
    let in_flight = a
        .latches()
        .acquire(declare_keys_get(Bytes::from("k"), ts))
        .await;

    let transfer = tokio::spawn({
        let a = a.clone();
        let target = range.ident(2);
        async move { a.transfer_lease(target).await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!transfer.is_finished());
    assert!(a.is_transferring());
    assert_eq!(a.latches().len(), 2);

    drop(in_flight);
    let lease = transfer.await.unwrap().unwrap();
    assert!(lease.owned_by(ReplicaId(2)));
    assert!(lease.start > ts);
}

#[tokio::test]
async fn test_transfer_to_current_holder_is_noop() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let a = range.replica(1);
    let lease = a.request_lease().await.unwrap();

    assert_eq!(a.transfer_lease(range.ident(1)).await.unwrap(), lease);
    assert_eq!(range.log.len(), 1);
    assert_eq!(a.metrics().transfer_success, 0);
}

#[tokio::test]
async fn test_lease_moves_back_and_forth() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let (a, b) = (range.replica(1), range.replica(2));
    a.request_lease().await.unwrap();

    let to_b = a.transfer_lease(range.ident(2)).await.unwrap();
    // The former holder no longer owns anything to transfer.
    let again = a.transfer_lease(range.ident(2)).await.unwrap();
    assert_eq!(again, to_b);

    let to_a = b.transfer_lease(range.ident(1)).await.unwrap();
    assert!(to_a.owned_by(ReplicaId(1)));
    assert_eq!(to_a.sequence, LeaseSequence(3));
    assert!(to_a.start > to_b.start);
}

#[tokio::test]
async fn test_transfer_checks_live_membership() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let a = range.replica(1);
    a.request_lease().await.unwrap();

    let desc = a
        .change_membership(vec![
            range.ident(1),
            ReplicaDescriptor::learner(NodeId(2), ReplicaId(2)),
            range.ident(3),
        ])
        .await
        .unwrap();
    assert_eq!(desc.generation, 1);

    // The caller still thinks replica 2 is a voter.
    let err = a.transfer_lease(range.ident(2)).await.unwrap_err();
    assert!(matches!(
        err.as_lease_rejected().map(|r| &r.reason),
        Some(RejectReason::IneligibleReplica(_))
    ));
}

#[tokio::test]
async fn test_request_conflicts_with_other_holder() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    range.replica(1).request_lease().await.unwrap();

    let b = range.replica(2);
    let err = b.request_lease().await.unwrap_err();
    assert_eq!(
        err.as_lease_rejected().map(|r| r.reason.clone()),
        Some(RejectReason::LeaseConflict { holder: ReplicaId(1) })
    );
    assert_eq!(b.metrics().request_error, 1);
}

#[tokio::test]
async fn test_extension_keeps_sequence() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let a = range.replica(1);
    let first = a.request_lease().await.unwrap();

    range.clock.advance(Duration::from_secs(2));
    let extended = a.request_lease().await.unwrap();
    assert_eq!(extended.sequence, first.sequence);
    assert_eq!(extended.start, first.start);
    assert!(extended.expiration() > first.expiration());
}

#[tokio::test]
async fn test_acquisition_after_expiration_does_not_overlap() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let prev = range.replica(1).request_lease().await.unwrap();

    range.clock.advance(Duration::from_secs(7));
    let lease = range.replica(2).request_lease().await.unwrap();
    assert!(lease.start > prev.expiration().unwrap());
    assert_eq!(lease.sequence, LeaseSequence(2));
}

#[tokio::test]
async fn test_epoch_lease_lost_with_liveness() {
    let config = ReplicaConfig {
        lease_kind: LeaseKindConfig::Epoch,
        ..ReplicaConfig::default()
    };
    let range = TestRange::new(config).unwrap();
    let lease = range.replica(1).request_lease().await.unwrap();
    assert_eq!(lease.epoch(), Some(1));

    let b = range.replica(2);
    assert!(b.request_lease().await.is_err());

    range.store.increment_liveness_epoch(NodeId(1));
    let lease = b.request_lease().await.unwrap();
    assert!(lease.owned_by(ReplicaId(2)));
    assert_eq!(lease.sequence, LeaseSequence(2));
}

#[tokio::test]
async fn test_in_memory_log_is_object_safe() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let proposer: std::sync::Arc<dyn ConsensusProposer> = range.log.clone();
    assert!(format!("{proposer:?}").contains("InMemoryLog"));
}

#[tokio::test(start_paused = true)]
async fn test_demotion_while_transfer_in_flight_blocks_commit() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let (a, b) = (range.replica(1), range.replica(2));
    let prev = a.request_lease().await.unwrap();
    range.log.set_latency(Duration::from_millis(20));
    let demoted = vec![
        range.ident(1),
        ReplicaDescriptor::learner(NodeId(2), ReplicaId(2)),
        range.ident(3),
    ];

    let (transfer, (from_store, from_b)) = tokio::join!(a.transfer_lease(range.ident(2)), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        // A membership change ordered by consensus lands before the transfer commits.
        let desc = range.store.get_membership(TEST_RANGE).unwrap();
        let from_store = range.store.set_membership(desc.with_replicas(demoted.clone()));
        // A replica without the lease may not change membership at all.
        let from_b = b.change_membership(demoted.clone()).await;
        (from_store, from_b)
    });

    from_store.unwrap();
    assert!(matches!(
        from_b,
        Err(Error::NotLeaseHolder { replica: ReplicaId(2), holder: Some(ReplicaId(1)), .. })
    ));
    assert!(matches!(
        transfer,
        Err(Error::ProposalFailed(ProposalError::Rejected(_)))
    ));
    assert_eq!(range.store.get_active_lease(TEST_RANGE).unwrap(), Some(prev));
    assert_eq!(range.store.get_membership(TEST_RANGE).unwrap().generation, 1);
    assert_eq!(a.metrics().transfer_error, 1);
}

#[tokio::test]
async fn test_membership_change_requires_valid_lease() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let (a, b) = (range.replica(1), range.replica(2));
    let voters = vec![range.ident(1), range.ident(2)];

    // Nobody holds a lease yet.
    assert!(matches!(
        a.change_membership(voters.clone()).await,
        Err(Error::NotLeaseHolder { holder: None, .. })
    ));

    a.request_lease().await.unwrap();
    assert!(b.change_membership(voters.clone()).await.is_err());

    // The holder cannot demote itself.
    let err = a
        .change_membership(vec![
            ReplicaDescriptor::learner(NodeId(1), ReplicaId(1)),
            range.ident(2),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IneligibleLeaseHolder { holder: ReplicaId(1), .. }));

    let desc = a.change_membership(voters).await.unwrap();
    assert_eq!(desc.generation, 1);
    assert!(desc.replica(ReplicaId(3)).is_none());
}

#[tokio::test]
async fn test_transfer_is_logged_as_transfer_intent() {
    let range = TestRange::new(ReplicaConfig::default()).unwrap();
    let a = range.replica(1);
    let prev = a.request_lease().await.unwrap();
    let lease = a.transfer_lease(range.ident(2)).await.unwrap();

    let entries = range.log.entries();
    assert_eq!(entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);
    let intents: Vec<LeaseChangeIntent> = entries
        .iter()
        .map(|e| bincode::deserialize(&e.payload).unwrap())
        .collect();
    assert!(!intents[0].is_transfer());
    assert!(intents[1].is_transfer());
    assert_eq!(intents[1].prev.as_ref(), Some(&prev));
    assert_eq!(intents[1].next, lease);
}
