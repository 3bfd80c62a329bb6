//! Carrier lookup tables.
//!
//! Each carrier maps its own event codes to [`TrackingStatus`]. When a code is
//! missing or unmapped the event description is matched against keyword
//! patterns shared by every carrier.

use crate::status::TrackingStatus;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use vitrine_core::{Order, Timestamp};

/// Supported carriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Carrier {
    Ups,
    Fedex,
    Usps,
    Dhl,
    Generic,
}

impl Carrier {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Carrier::Ups => "ups",
            Carrier::Fedex => "fedex",
            Carrier::Usps => "usps",
            Carrier::Dhl => "dhl",
            Carrier::Generic => "generic",
        }
    }

    /// Unrecognized names fall back to [`Carrier::Generic`].
    pub fn from_db_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "ups" => Carrier::Ups,
            "fedex" | "fed_ex" | "federal_express" => Carrier::Fedex,
            "usps" => Carrier::Usps,
            "dhl" | "dhl_express" => Carrier::Dhl,
            _ => Carrier::Generic,
        }
    }

    /// Guess the carrier from the shape of a tracking number.
    pub fn detect(tracking_number: &str) -> Option<Carrier> {
        let number: String = tracking_number
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();
        TRACKING_NUMBER_PATTERNS
            .iter()
            .find(|(_, pattern)| pattern.is_match(&number))
            .map(|(carrier, _)| *carrier)
    }

    /// Carrier for an order: explicit name first, then number shape.
    pub fn for_order(order: &Order) -> Carrier {
        match (&order.carrier, &order.tracking_number) {
            (Some(name), _) => Carrier::from_db_str(name),
            (None, Some(number)) => Carrier::detect(number).unwrap_or(Carrier::Generic),
            (None, None) => Carrier::Generic,
        }
    }

    fn code_table(&self) -> &'static [(&'static str, TrackingStatus)] {
        use TrackingStatus::*;
        match self {
            Carrier::Ups => &[
                ("M", Pending),
                ("MV", Pending),
                ("P", PickedUp),
                ("I", InTransit),
                ("O", OutForDelivery),
                ("D", Delivered),
                ("RS", Returned),
            ],
            Carrier::Fedex => &[
                ("OC", Pending),
                ("PU", PickedUp),
                ("AR", InTransit),
                ("DP", InTransit),
                ("IT", InTransit),
                ("OD", OutForDelivery),
                ("DL", Delivered),
                ("RS", Returned),
                ("CA", Failed),
            ],
            Carrier::Usps => &[
                ("GX", Pending),
                ("MA", Pending),
                ("03", PickedUp),
                ("10", InTransit),
                ("T1", InTransit),
                ("OF", OutForDelivery),
                ("01", Delivered),
                ("09", Returned),
                ("04", Failed),
            ],
            Carrier::Dhl => &[
                ("PRE-TRANSIT", Pending),
                ("PU", PickedUp),
                ("TRANSIT", InTransit),
                ("WC", OutForDelivery),
                ("DELIVERED", Delivered),
                ("RT", Returned),
                ("FAILURE", Failed),
            ],
            Carrier::Generic => &[],
        }
    }

    /// Status for a raw event code, if the table knows it.
    pub fn map_code(&self, code: &str) -> Option<TrackingStatus> {
        let code = code.trim().to_uppercase();
        self.code_table()
            .iter()
            .find(|(known, _)| *known == code)
            .map(|(_, status)| *status)
            .or_else(|| match self {
                Carrier::Generic => TrackingStatus::from_db_str(&code)
                    .ok()
                    .filter(|s| *s != TrackingStatus::Unknown),
                _ => None,
            })
    }

    /// Classify one raw event: code table first, description patterns second.
    pub fn classify(&self, raw: &RawTrackingEvent) -> TrackingStatus {
        raw.code
            .as_deref()
            .and_then(|code| self.map_code(code))
            .or_else(|| classify_description(&raw.description))
            .unwrap_or(TrackingStatus::Unknown)
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for Carrier {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_db_str(s))
    }
}

/// One event as a carrier reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrackingEvent {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: String,
    pub occurred_at: Timestamp,
    #[serde(default)]
    pub location: Option<String>,
}

impl RawTrackingEvent {
    pub fn new(code: Option<&str>, description: impl Into<String>, occurred_at: Timestamp) -> Self {
        Self {
            code: code.map(str::to_string),
            description: description.into(),
            occurred_at,
            location: None,
        }
    }
}

// Patterns are checked in order; failure outcomes come before "delivered" so
// "delivery failed" never reads as a delivery.
static DESCRIPTION_PATTERNS: Lazy<Vec<(TrackingStatus, Regex)>> = Lazy::new(|| {
    [
        (TrackingStatus::Returned, r"(?i)\breturn(ed|ing)?\b.*\bsender\b|\breturned\b"),
        (
            TrackingStatus::Failed,
            r"(?i)\bundeliverable\b|\bdelivery (attempt )?failed\b|\blost\b|\bdamaged\b|\bcancell?ed\b",
        ),
        (
            TrackingStatus::OutForDelivery,
            r"(?i)\bout for delivery\b|\bwith (delivery )?courier\b|\bon vehicle for delivery\b",
        ),
        (TrackingStatus::Delivered, r"(?i)\bdelivered\b"),
        (
            TrackingStatus::PickedUp,
            r"(?i)\bpicked up\b|\bpickup scan\b|\bshipment received\b|\baccepted\b",
        ),
        (
            TrackingStatus::InTransit,
            r"(?i)\bin transit\b|\bdeparted\b|\barrived\b|\bprocessed\b|\bfacility\b",
        ),
        (
            TrackingStatus::Pending,
            r"(?i)\blabel created\b|\bshipping label\b|\bpre-shipment\b|\binformation received\b|\bmanifest",
        ),
    ]
    .into_iter()
    .filter_map(|(status, pattern)| Regex::new(pattern).ok().map(|re| (status, re)))
    .collect()
});

static TRACKING_NUMBER_PATTERNS: Lazy<Vec<(Carrier, Regex)>> = Lazy::new(|| {
    [
        (Carrier::Ups, r"^1Z[0-9A-Z]{16}$"),
        (Carrier::Usps, r"^(94|93|92|95)[0-9]{20}$"),
        (Carrier::Fedex, r"^([0-9]{12}|[0-9]{15})$"),
        (Carrier::Dhl, r"^[0-9]{10}$"),
    ]
    .into_iter()
    .filter_map(|(carrier, pattern)| Regex::new(pattern).ok().map(|re| (carrier, re)))
    .collect()
});

/// Status implied by free-text description, if any pattern matches.
pub fn classify_description(description: &str) -> Option<TrackingStatus> {
    DESCRIPTION_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(description))
        .map(|(status, _)| *status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_code_table_wins_over_description() {
        let raw = RawTrackingEvent::new(Some("od"), "Arrived at facility", Utc::now());
        assert_eq!(Carrier::Fedex.classify(&raw), TrackingStatus::OutForDelivery);
    }

    #[test]
    fn test_unknown_code_falls_back_to_description() {
        let raw = RawTrackingEvent::new(Some("ZZ"), "Departed from facility", Utc::now());
        assert_eq!(Carrier::Ups.classify(&raw), TrackingStatus::InTransit);
    }

    #[test]
    fn test_description_failure_beats_delivered() {
        assert_eq!(
            classify_description("Delivery attempt failed, no access"),
            Some(TrackingStatus::Failed)
        );
        assert_eq!(
            classify_description("Package delivered to front door"),
            Some(TrackingStatus::Delivered)
        );
        assert_eq!(
            classify_description("Returned to sender"),
            Some(TrackingStatus::Returned)
        );
        assert_eq!(classify_description("Weather delay"), None);
    }

    #[test]
    fn test_generic_accepts_canonical_names() {
        assert_eq!(Carrier::Generic.map_code("in_transit"), Some(TrackingStatus::InTransit));
        assert_eq!(Carrier::Generic.map_code("unknown"), None);
        let raw = RawTrackingEvent::new(None, "", Utc::now());
        assert_eq!(Carrier::Generic.classify(&raw), TrackingStatus::Unknown);
    }

    #[test]
    fn test_detect_tracking_numbers() {
        assert_eq!(Carrier::detect("1Z999AA10123456784"), Some(Carrier::Ups));
        assert_eq!(Carrier::detect("9400 1000 0000 0000 0000 00"), Some(Carrier::Usps));
        assert_eq!(Carrier::detect("123456789012"), Some(Carrier::Fedex));
        assert_eq!(Carrier::detect("1234567890"), Some(Carrier::Dhl));
        assert_eq!(Carrier::detect("ABC"), None);
    }

    #[test]
    fn test_carrier_names() {
        assert_eq!(Carrier::from_db_str("FedEx"), Carrier::Fedex);
        assert_eq!(Carrier::from_db_str("la poste"), Carrier::Generic);
        assert_eq!(Carrier::Dhl.to_string(), "dhl");
    }
}
