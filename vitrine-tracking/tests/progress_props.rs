//! Progress never regresses while the event list only grows.

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use vitrine_test_utils::generators::arb_timestamp;
use vitrine_tracking::{normalize, Carrier, RawTrackingEvent, TrackingStatus};

fn arb_status() -> impl Strategy<Value = TrackingStatus> {
    prop_oneof![
        Just(TrackingStatus::Pending),
        Just(TrackingStatus::PickedUp),
        Just(TrackingStatus::InTransit),
        Just(TrackingStatus::OutForDelivery),
        Just(TrackingStatus::Delivered),
        Just(TrackingStatus::Returned),
        Just(TrackingStatus::Failed),
        Just(TrackingStatus::Unknown),
    ]
}

fn arb_event() -> impl Strategy<Value = RawTrackingEvent> {
    (arb_status(), arb_timestamp()).prop_map(|(status, at): (TrackingStatus, DateTime<Utc>)| {
        RawTrackingEvent::new(Some(status.as_db_str()), "", at)
    })
}

proptest! {
    #[test]
    fn prop_progress_is_monotonic(events in prop::collection::vec(arb_event(), 0..20)) {
        let mut previous = 0.0;
        for len in 0..=events.len() {
            let summary = normalize(Carrier::Generic, &events[..len]);
            prop_assert!(summary.progress_fraction >= previous);
            previous = summary.progress_fraction;
        }
    }

    #[test]
    fn prop_status_not_behind_latest_linear_event(events in prop::collection::vec(arb_event(), 1..20)) {
        let summary = normalize(Carrier::Generic, &events);
        if let Some(latest) = summary.ordered_events.first() {
            if let (Some(reported), Some(seen)) = (summary.status.rank(), latest.status.rank()) {
                prop_assert!(reported >= seen);
            }
        }
    }

    #[test]
    fn prop_absorbing_event_dominates(
        events in prop::collection::vec(arb_event(), 0..10),
        terminal in prop_oneof![Just(TrackingStatus::Returned), Just(TrackingStatus::Failed)],
    ) {
        let mut with_terminal = events.clone();
        with_terminal.push(RawTrackingEvent::new(Some(terminal.as_db_str()), "", Utc::now()));
        let summary = normalize(Carrier::Generic, &with_terminal);
        prop_assert!(summary.status.is_absorbing());
        prop_assert_eq!(summary.progress_fraction, 1.0);
    }
}
