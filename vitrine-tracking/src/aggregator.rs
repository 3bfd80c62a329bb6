//! Carrier events to one status and progress position.
//!
//! Pure functions; the cache stores the resulting [`TrackingSummary`] like any
//! other entity.

use crate::carrier::{Carrier, RawTrackingEvent};
use crate::status::TrackingStatus;
use serde::{Deserialize, Serialize};
use vitrine_core::Timestamp;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CarrierError {
    #[error("Carrier {carrier} request failed: {reason}")]
    Request { carrier: Carrier, reason: String },

    #[error("Carrier {carrier} returned status {status}")]
    Status { carrier: Carrier, status: u16 },

    #[error("Carrier {carrier} payload invalid: {reason}")]
    Decode { carrier: Carrier, reason: String },

    #[error("Carrier {carrier} returned no events")]
    NoEvents { carrier: Carrier },
}

/// A raw event with its normalized status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub status: TrackingStatus,
    pub code: Option<String>,
    pub description: String,
    pub occurred_at: Timestamp,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSummary {
    pub status: TrackingStatus,
    pub progress_fraction: f64,
    /// Newest first.
    pub ordered_events: Vec<TrackingEvent>,
}

impl TrackingSummary {
    pub fn unknown() -> Self {
        Self {
            status: TrackingStatus::Unknown,
            progress_fraction: 0.0,
            ordered_events: Vec::new(),
        }
    }

    pub fn latest_event(&self) -> Option<&TrackingEvent> {
        self.ordered_events.first()
    }
}

/// Normalize `raw_events` reported by `carrier`.
///
/// The current status is folded oldest-first: the furthest step reached on
/// the linear progression, unless a Returned or Failed event absorbed it.
pub fn normalize(carrier: Carrier, raw_events: &[RawTrackingEvent]) -> TrackingSummary {
    let mut events: Vec<TrackingEvent> = raw_events
        .iter()
        .map(|raw| TrackingEvent {
            status: carrier.classify(raw),
            code: raw.code.clone(),
            description: raw.description.clone(),
            occurred_at: raw.occurred_at,
            location: raw.location.clone(),
        })
        .collect();
    events.sort_by_key(|e| e.occurred_at);

    let status = events
        .iter()
        .fold(TrackingStatus::Unknown, |current, event| current.advance(event.status));

    events.reverse();
    TrackingSummary {
        status,
        progress_fraction: status.progress_fraction(),
        ordered_events: events,
    }
}

/// Outcome of a tracking refresh, including the failure path.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingReport {
    pub summary: TrackingSummary,
    pub error: Option<CarrierError>,
    /// Last status seen before the failed refresh.
    pub fallback_status: Option<TrackingStatus>,
}

impl TrackingReport {
    /// Status to display: the fresh one, or the cached one on failure.
    pub fn display_status(&self) -> TrackingStatus {
        match (self.summary.status, self.fallback_status) {
            (TrackingStatus::Unknown, Some(fallback)) => fallback,
            (status, _) => status,
        }
    }
}

/// Normalize a carrier call result, never fabricating progress on failure.
pub fn summarize(
    carrier: Carrier,
    result: Result<Vec<RawTrackingEvent>, CarrierError>,
    last_cached: Option<TrackingStatus>,
) -> TrackingReport {
    let fallback = last_cached.filter(|s| *s != TrackingStatus::Unknown);
    match result {
        Ok(events) if events.is_empty() => TrackingReport {
            summary: TrackingSummary::unknown(),
            error: Some(CarrierError::NoEvents { carrier }),
            fallback_status: fallback,
        },
        Ok(events) => TrackingReport {
            summary: normalize(carrier, &events),
            error: None,
            fallback_status: None,
        },
        Err(error) => TrackingReport {
            summary: TrackingSummary::unknown(),
            error: Some(error),
            fallback_status: fallback,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn event(code: &str, minutes: i64) -> RawTrackingEvent {
        RawTrackingEvent::new(Some(code), "", Utc::now() + Duration::minutes(minutes))
    }

    #[test]
    fn test_linear_progress() {
        let raw = vec![event("picked_up", 1), event("in_transit", 2), event("out_for_delivery", 3)];
        let summary = normalize(Carrier::Generic, &raw);
        assert_eq!(summary.status, TrackingStatus::OutForDelivery);
        assert!((summary.progress_fraction - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_returned_overrides_progress() {
        let raw = vec![
            event("picked_up", 1),
            event("in_transit", 2),
            event("out_for_delivery", 3),
            event("returned", 4),
        ];
        let summary = normalize(Carrier::Generic, &raw);
        assert_eq!(summary.status, TrackingStatus::Returned);
        assert_eq!(summary.progress_fraction, 1.0);
    }

    #[test]
    fn test_events_sorted_newest_first_status_oldest_first() {
        // Delivered carrier scan arrives before a stale in-transit scan.
        let raw = vec![event("delivered", 10), event("in_transit", 5), event("picked_up", 1)];
        let summary = normalize(Carrier::Generic, &raw);
        assert_eq!(summary.status, TrackingStatus::Delivered);
        let order: Vec<TrackingStatus> = summary.ordered_events.iter().map(|e| e.status).collect();
        assert_eq!(
            order,
            vec![TrackingStatus::Delivered, TrackingStatus::InTransit, TrackingStatus::PickedUp]
        );
        assert_eq!(
            summary.latest_event().map(|e| e.status),
            Some(TrackingStatus::Delivered)
        );
    }

    #[test]
    fn test_unmapped_events_report_unknown() {
        let raw = vec![RawTrackingEvent::new(None, "Weather delay", Utc::now())];
        let summary = normalize(Carrier::Ups, &raw);
        assert_eq!(summary.status, TrackingStatus::Unknown);
        assert_eq!(summary.ordered_events.len(), 1);
    }

    #[test]
    fn test_failed_call_reports_unknown_with_fallback() {
        let error = CarrierError::Status {
            carrier: Carrier::Dhl,
            status: 503,
        };
        let report = summarize(Carrier::Dhl, Err(error.clone()), Some(TrackingStatus::InTransit));
        assert_eq!(report.summary.status, TrackingStatus::Unknown);
        assert_eq!(report.summary.progress_fraction, 0.0);
        assert_eq!(report.error, Some(error));
        assert_eq!(report.fallback_status, Some(TrackingStatus::InTransit));
        assert_eq!(report.display_status(), TrackingStatus::InTransit);
    }

    #[test]
    fn test_empty_result_reports_unknown() {
        let report = summarize(Carrier::Usps, Ok(Vec::new()), None);
        assert_eq!(report.summary, TrackingSummary::unknown());
        assert_eq!(report.error, Some(CarrierError::NoEvents { carrier: Carrier::Usps }));
        assert_eq!(report.display_status(), TrackingStatus::Unknown);
    }

    #[test]
    fn test_successful_call_has_no_fallback() {
        let report = summarize(
            Carrier::Fedex,
            Ok(vec![event("PU", 0)]),
            Some(TrackingStatus::Pending),
        );
        assert_eq!(report.summary.status, TrackingStatus::PickedUp);
        assert!(report.error.is_none());
        assert!(report.fallback_status.is_none());
    }
}
