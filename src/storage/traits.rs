//! Storage trait definitions

use crate::model::{CanonicalEntry, TargetItem, WorkItem};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for record store backends
///
/// Every operation is parameterized; callers never build query text.
/// Implementations must be thread-safe (Send + Sync).
pub trait RecordStore: Send + Sync {
    // === Reads ===

    /// Collections that still have items lacking a correspondence.
    ///
    /// `filter` restricts the result to the named collections.
    fn work_items(&self, filter: Option<&[String]>) -> StorageResult<Vec<WorkItem>>;

    /// Items of a collection lacking a correspondence
    fn pending_items(&self, collection_id: &str) -> StorageResult<Vec<TargetItem>>;

    /// All canonical reference entries
    fn canonical_entries(&self) -> StorageResult<Vec<CanonicalEntry>>;

    /// Look up a target item by identifier
    fn target_item(&self, item_id: &str) -> StorageResult<Option<TargetItem>>;

    /// Whether a canonical entry exists
    fn has_canonical(&self, reference_id: &str) -> StorageResult<bool>;

    /// The item of `collection_id` already mapped to `reference_id`, if any
    fn item_for_reference(
        &self,
        collection_id: &str,
        reference_id: &str,
    ) -> StorageResult<Option<String>>;

    // === Targeted writes ===

    /// Assign a correspondence to exactly one item.
    ///
    /// Guarded by identifier and collection, and never overwrites an existing
    /// assignment. Returns whether a row changed.
    fn set_correspondence(
        &self,
        item_id: &str,
        collection_id: &str,
        reference_id: &str,
    ) -> StorageResult<bool>;

    /// Insert a new canonical entry
    fn insert_canonical(&self, entry: &CanonicalEntry) -> StorageResult<()>;

    /// Insert `entry` and assign it to one item as a single unit.
    ///
    /// Returns `Ok(false)` without keeping the entry when the item is already
    /// assigned or missing. On error nothing is written.
    fn create_and_link(
        &self,
        entry: &CanonicalEntry,
        item_id: &str,
        collection_id: &str,
    ) -> StorageResult<bool>;

    /// Insert or replace a target item (import and tests)
    fn upsert_target_item(&self, item: &TargetItem) -> StorageResult<()>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: RecordStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
