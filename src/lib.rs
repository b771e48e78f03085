//! Concord: resilient batch matching against a canonical reference set
//!
//! Target collections whose items still lack a correspondence are packed
//! into batches and sent, one batch at a time, through a priority-ordered
//! chain of generative backends. Replies are mined for a structured payload
//! (with one repair attempt when that fails), every proposal is checked
//! against ground truth, and only confident, consistent matches are written.
//! Everything else lands in review files for a human.
//!
//! # Core Concepts
//!
//! - **WorkItem / Batch**: outstanding work per collection, and the unit of one backend call
//! - **Backend chain**: fallback over backends; quota exhaustion stops the run
//! - **Classification**: applied, review, created, invalid, rejected
//! - **Checkpoint**: the unfinished batches of an aborted run, resumable later
//!
//! # Example
//!
//! ```
//! use concord::{BatchPacker, PackOptions, PackingConfig, WorkItem};
//!
//! let packer = BatchPacker::new(PackingConfig::default());
//! let batches = packer.pack(&[WorkItem::new("shelf-a", 12, 12)], &PackOptions::default());
//! assert_eq!(batches.len(), 1);
//! ```

pub mod artifacts;
pub mod backend;
pub mod cancel;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod extract;
pub mod model;
pub mod packer;
pub mod pacing;
pub mod prompt;
pub mod run;
pub mod storage;

pub use backend::{
    Backend, BackendDescriptor, BackendError, CommandBackend, DispatchError, DispatchOptions,
    Dispatcher, MockBackend, MockReply,
};
pub use cancel::CancellationToken;
pub use checkpoint::{CheckpointManager, CheckpointStatus, RetryConfig, RunCheckpoint};
pub use classify::{classify, Classification, Thresholds};
pub use config::Config;
pub use extract::{extract_structured, ExtractionError, Repairer};
pub use model::{
    Batch, CanonicalEntry, MatchCandidate, MatchKind, SizeClass, TargetItem, ValidatedMatch,
    WorkItem,
};
pub use packer::{BatchPacker, PackOptions, PackingConfig};
pub use run::{BatchState, RunController, RunError, RunReport, RunStats, RunStatus};
pub use storage::{ImportBundle, OpenStore, RecordStore, SqliteStore, StorageError, StorageResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
