//! Shared fixtures for end-to-end run tests
//!
//! Builds a file-backed store from an import bundle, a configuration rooted
//! in a temporary directory, and backend replies in the match schema.

#![allow(dead_code)]

use concord::{
    BackendDescriptor, Config, ImportBundle, MockBackend, OpenStore, SqliteStore,
};
use std::path::Path;
use std::sync::Arc;

/// Three collections of two items each, plus four canonical entries.
pub const RECORDS: &str = r#"{
    "canonical_entries": [
        {"id": "r1", "text": "Harbor Lights"},
        {"id": "r2", "text": "Northern Road"},
        {"id": "r3", "text": "Quiet Orchard"},
        {"id": "r4", "text": "Paper Lanterns"}
    ],
    "target_items": [
        {"id": "c1-a", "collection_id": "c1", "text": "harbor lights (remaster)"},
        {"id": "c1-b", "collection_id": "c1", "text": "northern rd"},
        {"id": "c2-a", "collection_id": "c2", "text": "Quiet Orchard"},
        {"id": "c2-b", "collection_id": "c2", "text": "paper lanterns live"},
        {"id": "c3-a", "collection_id": "c3", "text": "Harbour Lights"},
        {"id": "c3-b", "collection_id": "c3", "text": "unreleased demo"}
    ]
}"#;

pub fn seeded_store(dir: &Path) -> Arc<SqliteStore> {
    let store = SqliteStore::open(dir.join("db").join("concord.db")).unwrap();
    let bundle: ImportBundle = serde_json::from_str(RECORDS).unwrap();
    bundle.write_to(&store).unwrap();
    Arc::new(store)
}

/// Configuration with one collection per batch and paths under `dir`.
pub fn config(dir: &Path) -> Config {
    let yaml = format!(
        "packing:\n  max_items_per_batch: 1\npaths:\n  checkpoint_dir: {}\n  output_dir: {}\n",
        dir.join("checkpoints").display(),
        dir.join("out").display()
    );
    Config::from_yaml(&yaml).unwrap()
}

/// A fenced JSON reply proposing `(reference, item, collection, kind, confidence)` matches.
pub fn matches_reply(matches: &[(&str, &str, &str, &str, f64)]) -> String {
    format!("```json\n{}\n```", matches_json(matches))
}

pub fn matches_json(matches: &[(&str, &str, &str, &str, f64)]) -> String {
    let matches: Vec<serde_json::Value> = matches
        .iter()
        .map(|(reference, item, collection, kind, confidence)| {
            serde_json::json!({
                "reference_id": reference,
                "target_item_id": item,
                "target_collection_id": collection,
                "match_kind": kind,
                "confidence": confidence,
                "reasons": ["title match"],
            })
        })
        .collect();
    serde_json::json!({ "matches": matches }).to_string()
}

pub fn mock(name: &str, priority: u32, backend: &Arc<MockBackend>) -> BackendDescriptor {
    BackendDescriptor::new(name, priority, backend.clone())
}

pub fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with(prefix))
        .collect();
    names.sort();
    names
}
