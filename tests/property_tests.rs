//! Property-based tests for driftsync
//!
//! These tests verify invariants that must hold for all inputs:
//! - Batch planning never exceeds the backend limit and never loses work
//! - The conflict merge is exactly field-level last-writer-wins
//! - Cursor encoding round-trips and preserves total order
//! - Transfer progress is monotone and bounded
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// BATCH PLANNING TESTS
// ============================================================================

mod batch_planning {
    use super::*;
    use driftsync::config::DeleteOrdering;
    use driftsync::push::plan_chunks;
    use driftsync::types::{RecordId, RemoteRecord, ZoneId};

    fn saves(count: usize) -> Vec<RemoteRecord> {
        (0..count)
            .map(|i| {
                RemoteRecord::new(
                    RecordId::new(format!("s{i}"), ZoneId::private("zone")),
                    "Entry",
                )
            })
            .collect()
    }

    fn deletes(count: usize) -> Vec<RecordId> {
        (0..count)
            .map(|i| RecordId::new(format!("d{i}"), ZoneId::private("zone")))
            .collect()
    }

    fn orderings() -> impl Strategy<Value = DeleteOrdering> {
        prop_oneof![
            Just(DeleteOrdering::BeforeSaves),
            Just(DeleteOrdering::WithSaves),
        ]
    }

    proptest! {
        /// Invariant: no chunk exceeds the batch limit, and no chunk is empty
        #[test]
        fn chunks_stay_within_the_limit(
            save_count in 0..40usize,
            delete_count in 0..40usize,
            max in 1..9usize,
            ordering in orderings(),
        ) {
            let chunks = plan_chunks(saves(save_count), deletes(delete_count), max, ordering);
            for (chunk_saves, chunk_deletes) in &chunks {
                prop_assert!(chunk_saves.len() + chunk_deletes.len() <= max);
                prop_assert!(!chunk_saves.is_empty() || !chunk_deletes.is_empty());
            }
        }

        /// Invariant: every operation appears in exactly one chunk
        #[test]
        fn no_operation_is_lost_or_duplicated(
            save_count in 0..40usize,
            delete_count in 0..40usize,
            max in 1..9usize,
            ordering in orderings(),
        ) {
            let chunks = plan_chunks(saves(save_count), deletes(delete_count), max, ordering);

            let mut seen_saves: Vec<String> = chunks
                .iter()
                .flat_map(|(s, _)| s.iter().map(|r| r.id.name.clone()))
                .collect();
            let mut seen_deletes: Vec<String> = chunks
                .iter()
                .flat_map(|(_, d)| d.iter().map(|id| id.name.clone()))
                .collect();
            seen_saves.sort();
            seen_saves.dedup();
            seen_deletes.sort();
            seen_deletes.dedup();

            prop_assert_eq!(seen_saves.len(), save_count);
            prop_assert_eq!(seen_deletes.len(), delete_count);
        }

        /// Invariant: with delete-before-save ordering, no delete is ever
        /// submitted after a chunk that carries saves
        #[test]
        fn deletes_precede_saves_under_before_saves(
            save_count in 0..40usize,
            delete_count in 0..40usize,
            max in 1..9usize,
        ) {
            let chunks = plan_chunks(
                saves(save_count),
                deletes(delete_count),
                max,
                DeleteOrdering::BeforeSaves,
            );

            let mut saves_started = false;
            for (chunk_saves, chunk_deletes) in &chunks {
                if saves_started {
                    prop_assert!(chunk_deletes.is_empty());
                }
                if !chunk_saves.is_empty() {
                    saves_started = true;
                }
            }
        }
    }
}

// ============================================================================
// CONFLICT MERGE TESTS
// ============================================================================

mod conflict_merge {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    use driftsync::push::merge_changed_fields;
    use driftsync::types::{FieldValue, RecordId, RemoteRecord, ZoneId};

    fn record_with(fields: &BTreeMap<String, i64>, tag: &str) -> RemoteRecord {
        let mut record = RemoteRecord::new(
            RecordId::new("contested", ZoneId::private("zone")),
            "Entry",
        );
        for (key, value) in fields {
            record.set(key.clone(), FieldValue::Integer(*value));
        }
        record.change_tag = Some(tag.to_string());
        record
    }

    fn field_maps() -> impl Strategy<Value = BTreeMap<String, i64>> {
        prop::collection::btree_map("[a-e]", -100i64..100, 0..5)
    }

    proptest! {
        /// Invariant: exactly the changed keys take the local value; every
        /// other key keeps the server's; the server's change tag survives
        #[test]
        fn merge_is_field_level_last_writer_wins(
            server_fields in field_maps(),
            local_fields in field_maps(),
            changed in prop::collection::btree_set("[a-e]", 0..5),
        ) {
            let server = record_with(&server_fields, "server-tag");
            let attempted = record_with(&local_fields, "local-tag");
            let changed_keys: Vec<String> = changed.iter().cloned().collect();

            let merged = merge_changed_fields(server, &attempted, &changed_keys);

            let all_keys: BTreeSet<&String> =
                server_fields.keys().chain(local_fields.keys()).collect();
            for key in all_keys {
                let expected = if changed.contains(key.as_str()) {
                    attempted.get(key).cloned()
                } else {
                    server_fields.get(key).map(|v| FieldValue::Integer(*v))
                };
                prop_assert_eq!(merged.get(key).cloned(), expected);
            }
            prop_assert_eq!(merged.change_tag.as_deref(), Some("server-tag"));
        }
    }
}

// ============================================================================
// TRANSFER PROGRESS TESTS
// ============================================================================

mod transfer_progress {
    use super::*;
    use driftsync::cache::advance_progress;

    proptest! {
        /// Invariant: stored progress never decreases and stays within [0, 1],
        /// whatever order and range the callbacks arrive in
        #[test]
        fn progress_is_monotone_and_bounded(
            reports in prop::collection::vec(-1.0f64..2.0, 0..30),
        ) {
            let mut slot = 0.0f64;
            let mut high = 0.0f64;
            for report in reports {
                advance_progress(&mut slot, report);
                prop_assert!(slot >= high);
                prop_assert!((0.0..=1.0).contains(&slot));
                high = slot;
            }
        }

        /// Invariant: two callbacks in either order leave the maximum
        #[test]
        fn late_lower_reports_are_ignored(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
            let mut slot = 0.0f64;
            advance_progress(&mut slot, a);
            advance_progress(&mut slot, b);
            prop_assert_eq!(slot, a.max(b));
        }
    }
}

// ============================================================================
// CURSOR ORDERING TESTS
// ============================================================================

mod cursor_ordering {
    use super::*;
    use driftsync::types::SyncCursor;

    proptest! {
        /// Invariant: byte encoding round-trips
        #[test]
        fn bytes_round_trip(value in any::<u64>()) {
            let cursor = SyncCursor(value);
            prop_assert_eq!(SyncCursor::from_bytes(&cursor.to_bytes()), Some(cursor));
        }

        /// Invariant: cursor order matches sequence order
        #[test]
        fn order_is_total_and_monotone(a in any::<u64>(), b in any::<u64>()) {
            let (ca, cb) = (SyncCursor(a), SyncCursor(b));
            prop_assert_eq!(ca.cmp(&cb), a.cmp(&b));
        }

        /// Invariant: decoding rejects anything but exactly eight bytes
        #[test]
        fn decode_rejects_wrong_lengths(bytes in prop::collection::vec(any::<u8>(), 0..20)) {
            let decoded = SyncCursor::from_bytes(&bytes);
            prop_assert_eq!(decoded.is_some(), bytes.len() == 8);
        }
    }
}
