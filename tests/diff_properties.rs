//! Property-based tests for the difference engine
//!
//! These verify the merge invariants that must hold for all listings:
//! - every key in the union produces exactly one event
//! - events are emitted in ascending key order
//! - identical listings produce only Identical events
//!
//! Run with: cargo test --test diff_properties

use std::collections::BTreeSet;

use futures::stream;
use futures::StreamExt;
use proptest::prelude::*;

use mirrorsync::cancel::CancelToken;
use mirrorsync::diff::{object_difference, DiffOptions};
use mirrorsync::endpoint::EntryStream;
use mirrorsync::{DiffEvent, ListingEntry};

fn listing(keys: &BTreeSet<String>) -> EntryStream {
    let entries: Vec<_> = keys
        .iter()
        .map(|k| Ok(ListingEntry::file(k.clone(), 1)))
        .collect();
    stream::iter(entries).boxed()
}

fn run_diff(source: &BTreeSet<String>, target: &BTreeSet<String>) -> Vec<DiffEvent> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    rt.block_on(async {
        let rx = object_difference(
            listing(source),
            listing(target),
            DiffOptions::default(),
            CancelToken::new(),
        );
        let mut events = Vec::new();
        while let Ok(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    })
}

fn key_set() -> impl Strategy<Value = BTreeSet<String>> {
    proptest::collection::btree_set("[a-z]{1,6}(/[a-z]{1,4})?", 0..40)
}

proptest! {
    /// Invariant: exactly one event per key in the union, ascending order
    #[test]
    fn one_event_per_key_in_order(source in key_set(), target in key_set()) {
        let events = run_diff(&source, &target);

        let union: BTreeSet<String> = source.union(&target).cloned().collect();
        let keys: Vec<String> = events.iter().map(|e| e.key().to_string()).collect();

        prop_assert_eq!(keys.len(), union.len());
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(&keys, &sorted);
        prop_assert_eq!(keys.into_iter().collect::<BTreeSet<_>>(), union);
    }

    /// Invariant: key presence decides the event class
    #[test]
    fn classes_match_membership(source in key_set(), target in key_set()) {
        let events = run_diff(&source, &target);

        for event in &events {
            let key = event.key().to_string();
            match event {
                DiffEvent::OnlyInSource { .. } => {
                    prop_assert!(source.contains(&key) && !target.contains(&key));
                }
                DiffEvent::OnlyInTarget { .. } => {
                    prop_assert!(target.contains(&key) && !source.contains(&key));
                }
                _ => {
                    prop_assert!(source.contains(&key) && target.contains(&key));
                }
            }
        }
    }

    /// Invariant: equal listings produce only Identical events
    #[test]
    fn identical_listings_are_quiet(keys in key_set()) {
        let events = run_diff(&keys, &keys);
        prop_assert_eq!(events.len(), keys.len());
        for event in &events {
            prop_assert!(
                matches!(event, DiffEvent::Identical { .. }),
                "expected Identical event"
            );
        }
    }
}
