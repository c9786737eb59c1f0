use range_lease::hlc::{HLCError, HLC};
use range_lease::test_utils::ManualClock;
use std::time::Duration;

const MAX_OFFSET: Duration = Duration::from_millis(500);

/// An HLC whose physical clock reads `skew_ms` away from the shared one.
fn skewed(clock: &ManualClock, skew_ms: i64) -> HLC {
    let clock = clock.clone();
    HLC::new_with_clock(
        Box::new(move || clock.now_millis().saturating_add_signed(skew_ms)),
        MAX_OFFSET,
    )
}

#[test]
fn test_causal_order_survives_skew_within_offset() {
    let clock = ManualClock::new(1_000_000);
    let accurate = skewed(&clock, 0);
    let ahead = skewed(&clock, 300);
    let behind = skewed(&clock, -250);

    let from_ahead = ahead.now();
    accurate.update(from_ahead).unwrap();
    let relayed = accurate.now();
    assert!(relayed > from_ahead);

    behind.update(relayed).unwrap();
    let reply = behind.now();
    assert!(reply > relayed);

    // The slow node keeps issuing timestamps above what it has seen even
    // though its wall clock has not caught up.
    clock.advance(Duration::from_millis(100));
    assert!(behind.now() > reply);
}

#[test]
fn test_skew_beyond_offset_is_rejected() {
    let clock = ManualClock::new(1_000_000);
    let accurate = skewed(&clock, 0);
    let runaway = skewed(&clock, 30_000);

    let before = accurate.last();
    let err = accurate.update(runaway.now()).unwrap_err();
    assert!(matches!(
        err,
        HLCError::ClockDriftExceeded { max_offset_ms: 500, .. }
    ));
    assert_eq!(accurate.last(), before);
}

#[test]
fn test_uncertainty_window_spans_max_offset() {
    let clock = ManualClock::new(5_000);
    let hlc = skewed(&clock, 0);
    let window = hlc.now_with_uncertainty();
    assert_eq!(window.limit.since(window.now), MAX_OFFSET);

    let ahead = skewed(&clock, 200).now();
    assert!(window.is_uncertain(ahead));
    let far_ahead = skewed(&clock, 600).now();
    assert!(!window.is_uncertain(far_ahead));
}
