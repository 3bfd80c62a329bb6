//! Property tests: pushed change events converge to the same collection a
//! plain ordered model produces, with or without a fetch in flight.

use proptest::prelude::*;
use serde_json::{json, Value};
use vitrine_cache::{CacheStore, FetchCompletion, FetchMode, StoreConfig};
use vitrine_test_utils::generators::arb_change_events;
use vitrine_test_utils::{ChangeEvent, ReferenceCollection};

const KEY: &str = "orders";

fn model_of(events: &[ChangeEvent]) -> ReferenceCollection {
    let mut model = ReferenceCollection::new();
    model.apply_all(events);
    model
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_events_match_reference_model(events in arb_change_events(6, 40)) {
        let store = CacheStore::new(StoreConfig::default());
        store.set(KEY, |_| Some(json!([])));

        for event in &events {
            store.apply_event(KEY, event);
        }

        let expected = model_of(&events).to_value();
        prop_assert_eq!(store.get(KEY).value, Some(expected));
    }

    #[test]
    fn prop_events_during_fetch_are_replayed(
        base in arb_change_events(6, 20),
        during in arb_change_events(6, 20),
    ) {
        let store = CacheStore::new(StoreConfig::default());
        store.set(KEY, |_| Some(json!([])));

        let ticket = store
            .begin_fetch(KEY, FetchMode::Forced)
            .expect("fetch slot should be free");
        for event in &during {
            store.apply_event(KEY, event);
        }

        // Server snapshot reflects `base` only; `during` arrived after it was taken.
        let fetched = model_of(&base).to_value();
        let completion = store.complete_fetch(ticket, Ok(fetched));
        prop_assert_eq!(completion, FetchCompletion::Applied { replayed: during.len() });

        let mut expected = model_of(&base);
        expected.apply_all(&during);
        prop_assert_eq!(store.get(KEY).value, Some(expected.to_value()));
    }

    #[test]
    fn prop_unknown_key_is_never_created(events in arb_change_events(4, 10)) {
        let store = CacheStore::new(StoreConfig::default());
        for event in &events {
            prop_assert!(store.apply_event("missing", event).is_noop());
        }
        prop_assert!(store.keys().is_empty());
        prop_assert_eq!(store.get("missing").value, None::<Value>);
    }
}
