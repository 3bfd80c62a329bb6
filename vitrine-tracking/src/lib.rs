//! Vitrine Tracking - Shipment Status Aggregation
//!
//! Normalizes heterogeneous carrier events into one ordered
//! [`TrackingStatus`] and a display progress fraction. Side-effect free.

pub mod aggregator;
pub mod carrier;
pub mod status;

pub use aggregator::{normalize, summarize, CarrierError, TrackingEvent, TrackingReport, TrackingSummary};
pub use carrier::{classify_description, Carrier, RawTrackingEvent};
pub use status::{TrackingStatus, TrackingStatusParseError};
