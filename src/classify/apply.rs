//! Applying classified results to the record store
//!
//! Each write targets exactly one item by identifier and collection. A failed
//! write is logged and counted; the remaining results still proceed.

use super::Classification;
use crate::model::CanonicalEntry;
use crate::storage::RecordStore;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What happened when a classification was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Correspondences written
    pub applied: usize,
    /// New canonical entries inserted
    pub created: usize,
    /// Writes the store declined (item already assigned or gone)
    pub skipped: usize,
    pub write_failures: usize,
}

/// Write `applied` and `created` results. In a dry run nothing is written and
/// the report counts what would have been.
pub fn apply(classification: &Classification, store: &dyn RecordStore, dry_run: bool) -> ApplyReport {
    let mut report = ApplyReport::default();

    for matched in &classification.applied {
        if dry_run {
            info!(candidate = %matched, "dry run: would apply");
            report.applied += 1;
            continue;
        }
        match store.set_correspondence(matched.item_id(), matched.collection_id(), matched.reference_id()) {
            Ok(true) => {
                info!(candidate = %matched, "correspondence applied");
                report.applied += 1;
            }
            Ok(false) => {
                warn!(candidate = %matched, "store declined write: item already assigned or missing");
                report.skipped += 1;
            }
            Err(e) => {
                error!(candidate = %matched, error = %e, "correspondence write failed");
                report.write_failures += 1;
            }
        }
    }

    for matched in &classification.created {
        if dry_run {
            info!(candidate = %matched, "dry run: would create canonical entry");
            report.created += 1;
            continue;
        }

        let item = match store.target_item(matched.item_id()) {
            Ok(Some(item)) => item,
            Ok(None) => {
                warn!(candidate = %matched, "item vanished before creation");
                report.skipped += 1;
                continue;
            }
            Err(e) => {
                error!(candidate = %matched, error = %e, "item read failed");
                report.write_failures += 1;
                continue;
            }
        };

        let entry = CanonicalEntry::unverified_from(Uuid::new_v4().to_string(), &item);
        match store.create_and_link(&entry, &item.id, &item.collection_id) {
            Ok(true) => {
                info!(candidate = %matched, entry = %entry.id, "unverified canonical entry created");
                report.created += 1;
            }
            Ok(false) => {
                warn!(candidate = %matched, "store declined link: item already assigned");
                report.skipped += 1;
            }
            Err(e) => {
                error!(candidate = %matched, error = %e, "canonical entry write failed");
                report.write_failures += 1;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, StoreLookup, Thresholds};
    use crate::model::{Batch, MatchCandidate, MatchKind, TargetItem, WorkItem};
    use crate::storage::{OpenStore, SqliteStore};

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_canonical(&CanonicalEntry::new("r1", "alpha")).unwrap();
        store.upsert_target_item(&TargetItem::new("i1", "c1", "alpha!")).unwrap();
        store.upsert_target_item(&TargetItem::new("i2", "c1", "gamma")).unwrap();
        store.upsert_target_item(&TargetItem::new("x1", "c2", "other")).unwrap();
        store
    }

    fn batch() -> Batch {
        Batch::new(vec![WorkItem::new("c1", 2, 2)], 50, 150)
    }

    #[test]
    fn applies_and_creates_through_the_store() {
        let store = seeded();
        let candidates = vec![
            MatchCandidate::new("r1", "i1", "c1", MatchKind::Exact, 99.0),
            MatchCandidate::new("", "i2", "c1", MatchKind::New, 70.0),
        ];
        let classification = classify(candidates, &batch(), &StoreLookup::new(&store), &Thresholds::default());

        let report = apply(&classification, &store, false);
        assert_eq!(report.applied, 1);
        assert_eq!(report.created, 1);

        assert_eq!(store.target_item("i1").unwrap().unwrap().correspondence.as_deref(), Some("r1"));
        let created = store.target_item("i2").unwrap().unwrap().correspondence.unwrap();
        let entry = store
            .canonical_entries()
            .unwrap()
            .into_iter()
            .find(|e| e.id == created)
            .unwrap();
        assert!(!entry.verified);
        assert_eq!(entry.text, "gamma");
    }

    #[test]
    fn mismatched_collection_produces_no_writes() {
        let store = seeded();
        let candidates = vec![MatchCandidate::new("r1", "x1", "c1", MatchKind::Exact, 100.0)];
        let classification = classify(candidates, &batch(), &StoreLookup::new(&store), &Thresholds::default());
        assert_eq!(classification.invalid.len(), 1);

        let report = apply(&classification, &store, false);
        assert_eq!(report, ApplyReport::default());
        assert_eq!(store.target_item("x1").unwrap().unwrap().correspondence, None);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let store = seeded();
        let candidates = vec![MatchCandidate::new("r1", "i1", "c1", MatchKind::Exact, 99.0)];
        let classification = classify(candidates, &batch(), &StoreLookup::new(&store), &Thresholds::default());

        let report = apply(&classification, &store, true);
        assert_eq!(report.applied, 1);
        assert_eq!(store.target_item("i1").unwrap().unwrap().correspondence, None);
    }

    #[test]
    fn declined_write_is_skipped_not_failed() {
        let store = seeded();
        let candidates = vec![MatchCandidate::new("r1", "i1", "c1", MatchKind::Exact, 99.0)];
        let classification = classify(candidates, &batch(), &StoreLookup::new(&store), &Thresholds::default());

        // Someone else assigns the item between classification and apply
        store.set_correspondence("i1", "c1", "r1").unwrap();
        let report = apply(&classification, &store, false);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied, 0);
    }

    #[test]
    fn declined_creation_leaves_no_orphan_entry() {
        let store = seeded();
        let candidates = vec![MatchCandidate::new("", "i2", "c1", MatchKind::New, 70.0)];
        let classification = classify(candidates, &batch(), &StoreLookup::new(&store), &Thresholds::default());
        assert_eq!(classification.created.len(), 1);

        store.set_correspondence("i2", "c1", "r1").unwrap();
        let report = apply(&classification, &store, false);
        assert_eq!(report.created, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.canonical_entries().unwrap().len(), 1);
    }
}
