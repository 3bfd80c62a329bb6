//! Cache entries and their freshness metadata.

use crate::watermark::Watermark;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use vitrine_core::{FetchError, Timestamp};

/// Where the current value of an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntrySource {
    /// Nothing written yet.
    Empty,
    /// Pre-populated from the durable store; never authoritative.
    Seeded,
    /// Snapshot returned by the collection endpoint.
    Fetched,
    /// Reconciled from a push change event.
    Pushed,
    /// Speculative local mutation awaiting confirmation.
    Optimistic,
    /// Snapshot restored after a failed mutation.
    Restored,
    /// Direct write through [`crate::CacheStore::set`].
    Local,
}

impl EntrySource {
    /// Whether a value from this source may be written to the durable store.
    pub fn is_persistable(&self) -> bool {
        matches!(
            self,
            EntrySource::Fetched | EntrySource::Pushed | EntrySource::Restored | EntrySource::Local
        )
    }
}

/// Cached payload for one key plus its revalidation state.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T = Value> {
    pub key: String,
    pub value: Option<T>,
    /// When the last successful fetch landed (or the persisted fetch time for
    /// seeded entries).
    pub fetched_at: Option<Timestamp>,
    /// True while a fetch or mutation round-trip is outstanding.
    pub is_validating: bool,
    /// Last surfaced fetch failure; cleared by the next successful fetch.
    pub error: Option<FetchError>,
    pub version: Watermark,
    pub source: EntrySource,
    /// Marked by `invalidate`; cleared by the next successful fetch.
    pub stale: bool,
    /// Set once the network has answered for this key at least once.
    pub confirmed: bool,
}

impl<T> CacheEntry<T> {
    pub fn empty(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            fetched_at: None,
            is_validating: false,
            error: None,
            version: Watermark::zero(),
            source: EntrySource::Empty,
            stale: false,
            confirmed: false,
        }
    }

    /// No network answer yet and no error to show.
    ///
    /// Seeded entries stay loading: persisted data is only for display.
    pub fn is_loading(&self) -> bool {
        !self.confirmed && self.error.is_none()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Age of the last fetch, `None` if never fetched.
    pub fn staleness(&self) -> Option<Duration> {
        let fetched_at = self.fetched_at?;
        Some((Utc::now() - fetched_at).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn is_fresh_as_of(&self, timestamp: Timestamp) -> bool {
        self.fetched_at.is_some_and(|at| at >= timestamp)
    }

    /// Fallible [`CacheEntry::map`].
    pub fn try_map<U, E, F>(self, f: F) -> Result<CacheEntry<U>, E>
    where
        F: FnOnce(T) -> Result<U, E>,
    {
        let value = self.value.map(f).transpose()?;
        Ok(CacheEntry {
            key: self.key,
            value,
            fetched_at: self.fetched_at,
            is_validating: self.is_validating,
            error: self.error,
            version: self.version,
            source: self.source,
            stale: self.stale,
            confirmed: self.confirmed,
        })
    }

    /// Transform the value while keeping metadata.
    pub fn map<U, F>(self, f: F) -> CacheEntry<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheEntry {
            key: self.key,
            value: self.value.map(f),
            fetched_at: self.fetched_at,
            is_validating: self.is_validating,
            error: self.error,
            version: self.version,
            source: self.source,
            stale: self.stale,
            confirmed: self.confirmed,
        }
    }
}

impl CacheEntry<Value> {
    /// Decode the JSON value into a typed view.
    pub fn decode<T: DeserializeOwned>(self) -> Result<CacheEntry<T>, FetchError> {
        let key = self.key.clone();
        self.try_map(serde_json::from_value::<T>)
            .map_err(|e| FetchError::Decode {
                key,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    #[test]
    fn test_empty_entry_is_loading() {
        let entry: CacheEntry = CacheEntry::empty("orders");
        assert!(entry.is_loading());
        assert!(!entry.has_value());
        assert_eq!(entry.staleness(), None);
        assert_eq!(entry.source, EntrySource::Empty);
    }

    #[test]
    fn test_error_ends_loading() {
        let mut entry: CacheEntry = CacheEntry::empty("orders");
        entry.error = Some(FetchError::Decode {
            key: "orders".to_string(),
            reason: "bad".to_string(),
        });
        assert!(!entry.is_loading());
    }

    #[test]
    fn test_staleness_and_freshness() {
        let mut entry: CacheEntry = CacheEntry::empty("orders");
        let fetched = Utc::now() - ChronoDuration::seconds(30);
        entry.fetched_at = Some(fetched);

        let staleness = entry.staleness().expect("fetched entry has staleness");
        assert!(staleness >= Duration::from_secs(29));
        assert!(entry.is_fresh_as_of(fetched - ChronoDuration::seconds(1)));
        assert!(!entry.is_fresh_as_of(Utc::now()));
    }

    #[test]
    fn test_decode_typed_view() {
        let mut entry: CacheEntry = CacheEntry::empty("counts");
        entry.value = Some(json!([1, 2, 3]));
        entry.confirmed = true;

        let typed = entry.decode::<Vec<u32>>().expect("decode should succeed");
        assert_eq!(typed.value, Some(vec![1, 2, 3]));
        assert!(typed.confirmed);
        assert_eq!(typed.key, "counts");
    }

    #[test]
    fn test_decode_failure_is_fetch_decode_error() {
        let mut entry: CacheEntry = CacheEntry::empty("counts");
        entry.value = Some(json!({"not": "a list"}));
        let err = entry.decode::<Vec<u32>>().expect_err("decode should fail");
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn test_persistable_sources() {
        assert!(EntrySource::Fetched.is_persistable());
        assert!(!EntrySource::Seeded.is_persistable());
        assert!(!EntrySource::Optimistic.is_persistable());
    }
}
