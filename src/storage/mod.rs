//! Persistent record store
//!
//! The orchestration core reaches the store only through the `RecordStore`
//! trait. `SqliteStore` is the bundled implementation.

mod import;
mod sqlite;
mod traits;

pub use import::{ImportBundle, ImportSummary};
pub use sqlite::SqliteStore;
pub use traits::{OpenStore, RecordStore, StorageError, StorageResult};
