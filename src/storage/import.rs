//! Bulk loading of canonical entries and target items from a JSON document

use super::traits::{RecordStore, StorageResult};
use crate::model::{CanonicalEntry, TargetItem};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Records to load, as stored in an import file:
///
/// ```json
/// { "canonical_entries": [{"id": "r1", "text": "..."}],
///   "target_items": [{"id": "i1", "collection_id": "c1", "text": "..."}] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportBundle {
    #[serde(default)]
    pub canonical_entries: Vec<CanonicalEntry>,
    #[serde(default)]
    pub target_items: Vec<TargetItem>,
}

/// Counts of records written by an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub canonical_entries: usize,
    pub canonical_skipped: usize,
    pub target_items: usize,
}

impl ImportBundle {
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write the bundle. Canonical entries that already exist are left alone;
    /// target items are upserted.
    pub fn write_to(&self, store: &dyn RecordStore) -> StorageResult<ImportSummary> {
        let mut summary = ImportSummary::default();
        for entry in &self.canonical_entries {
            if store.has_canonical(&entry.id)? {
                summary.canonical_skipped += 1;
                continue;
            }
            store.insert_canonical(entry)?;
            summary.canonical_entries += 1;
        }
        for item in &self.target_items {
            store.upsert_target_item(item)?;
            summary.target_items += 1;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{OpenStore, SqliteStore};

    #[test]
    fn import_skips_existing_canonical_entries() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_canonical(&CanonicalEntry::new("r1", "Alpha")).unwrap();

        let bundle: ImportBundle = serde_json::from_str(
            r#"{
                "canonical_entries": [{"id": "r1", "text": "Alpha"}, {"id": "r2", "text": "Beta"}],
                "target_items": [{"id": "i1", "collection_id": "c1", "text": "beta"}]
            }"#,
        )
        .unwrap();
        let summary = bundle.write_to(&store).unwrap();

        assert_eq!(summary.canonical_entries, 1);
        assert_eq!(summary.canonical_skipped, 1);
        assert_eq!(summary.target_items, 1);
        assert_eq!(store.work_items(None).unwrap().len(), 1);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, r#"{"target_items": []}"#).unwrap();
        assert_eq!(ImportBundle::load(&path).unwrap(), ImportBundle::default());
    }
}
