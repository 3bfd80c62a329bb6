//! Normalized shipment status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shipment status on one scale for every carrier.
///
/// `Pending < PickedUp < InTransit < OutForDelivery < Delivered` form the
/// linear progression. `Returned` and `Failed` sit outside it and absorb any
/// later event. `Unknown` means no usable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Pending,
    PickedUp,
    InTransit,
    OutForDelivery,
    Delivered,
    Returned,
    Failed,
    Unknown,
}

impl TrackingStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TrackingStatus::Pending => "pending",
            TrackingStatus::PickedUp => "picked_up",
            TrackingStatus::InTransit => "in_transit",
            TrackingStatus::OutForDelivery => "out_for_delivery",
            TrackingStatus::Delivered => "delivered",
            TrackingStatus::Returned => "returned",
            TrackingStatus::Failed => "failed",
            TrackingStatus::Unknown => "unknown",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, TrackingStatusParseError> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "pending" => Ok(TrackingStatus::Pending),
            "picked_up" => Ok(TrackingStatus::PickedUp),
            "in_transit" => Ok(TrackingStatus::InTransit),
            "out_for_delivery" => Ok(TrackingStatus::OutForDelivery),
            "delivered" => Ok(TrackingStatus::Delivered),
            "returned" => Ok(TrackingStatus::Returned),
            "failed" => Ok(TrackingStatus::Failed),
            "unknown" => Ok(TrackingStatus::Unknown),
            _ => Err(TrackingStatusParseError(s.to_string())),
        }
    }

    /// Position on the linear progression; `None` off it.
    pub fn rank(&self) -> Option<u8> {
        match self {
            TrackingStatus::Pending => Some(0),
            TrackingStatus::PickedUp => Some(1),
            TrackingStatus::InTransit => Some(2),
            TrackingStatus::OutForDelivery => Some(3),
            TrackingStatus::Delivered => Some(4),
            TrackingStatus::Returned | TrackingStatus::Failed | TrackingStatus::Unknown => None,
        }
    }

    /// Returned and Failed override all forward progress.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, TrackingStatus::Returned | TrackingStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_absorbing() || *self == TrackingStatus::Delivered
    }

    /// Step-function progress for display.
    pub fn progress_fraction(&self) -> f64 {
        match self {
            TrackingStatus::Pending | TrackingStatus::Unknown => 0.0,
            TrackingStatus::PickedUp => 0.25,
            TrackingStatus::InTransit => 0.5,
            TrackingStatus::OutForDelivery => 0.75,
            TrackingStatus::Delivered | TrackingStatus::Returned | TrackingStatus::Failed => 1.0,
        }
    }

    /// Status after observing `next` on top of `self`, oldest event first.
    pub fn advance(self, next: TrackingStatus) -> TrackingStatus {
        if self.is_absorbing() {
            return self;
        }
        if next.is_absorbing() {
            return next;
        }
        match (self.rank(), next.rank()) {
            (Some(current), Some(incoming)) if incoming > current => next,
            (Some(_), _) => self,
            (None, _) => next,
        }
    }
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for TrackingStatus {
    type Err = TrackingStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an unknown tracking status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingStatusParseError(pub String);

impl fmt::Display for TrackingStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid tracking status: {}", self.0)
    }
}

impl std::error::Error for TrackingStatusParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_separators() {
        assert_eq!(
            TrackingStatus::from_db_str("Out for delivery"),
            Ok(TrackingStatus::OutForDelivery)
        );
        assert_eq!("picked-up".parse::<TrackingStatus>(), Ok(TrackingStatus::PickedUp));
        assert!(TrackingStatus::from_db_str("lost in space").is_err());
    }

    #[test]
    fn test_advance_keeps_maximum() {
        use TrackingStatus::*;
        assert_eq!(InTransit.advance(PickedUp), InTransit);
        assert_eq!(PickedUp.advance(OutForDelivery), OutForDelivery);
        assert_eq!(Delivered.advance(Unknown), Delivered);
        assert_eq!(Unknown.advance(Pending), Pending);
    }

    #[test]
    fn test_returned_and_failed_absorb() {
        use TrackingStatus::*;
        assert_eq!(Delivered.advance(Returned), Returned);
        assert_eq!(Returned.advance(Delivered), Returned);
        assert_eq!(Failed.advance(Returned), Failed);
    }

    #[test]
    fn test_progress_steps() {
        assert_eq!(TrackingStatus::Pending.progress_fraction(), 0.0);
        assert_eq!(TrackingStatus::OutForDelivery.progress_fraction(), 0.75);
        assert_eq!(TrackingStatus::Failed.progress_fraction(), 1.0);
        assert_eq!(TrackingStatus::Unknown.progress_fraction(), 0.0);
    }
}
