//! WorkItem and Batch: the units the packer produces and the run controller consumes

use serde::{Deserialize, Serialize};
use std::fmt;

/// A unit of outstanding matching work: one target collection and how many
/// of its items still lack a correspondence.
///
/// Snapshots are derived fresh from the store at the start of each run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Target collection identifier
    pub id: String,
    /// Items in the collection
    pub total_count: usize,
    /// Items in the collection with no correspondence yet
    pub pending_count: usize,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, total_count: usize, pending_count: usize) -> Self {
        Self {
            id: id.into(),
            total_count,
            pending_count,
        }
    }
}

/// Coarse size class of a batch, derived from its total pending count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    /// Classify a pending total against the packer's large/pack thresholds.
    pub fn from_pending(total_pending: usize, large_threshold: usize, pack_threshold: usize) -> Self {
        if total_pending < large_threshold {
            Self::Small
        } else if total_pending < pack_threshold {
            Self::Medium
        } else {
            Self::Large
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
        }
    }
}

/// An ordered, non-empty group of WorkItems sent to a backend in one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub items: Vec<WorkItem>,
    pub total_pending: usize,
    pub size_class: SizeClass,
    /// Set on sub-batches produced by a split; a retry batch is never split again.
    #[serde(default)]
    pub is_retry: bool,
}

impl Batch {
    /// Build a batch from its items, computing the aggregate pending count.
    pub fn new(items: Vec<WorkItem>, large_threshold: usize, pack_threshold: usize) -> Self {
        let total_pending = items.iter().map(|i| i.pending_count).sum();
        Self {
            items,
            total_pending,
            size_class: SizeClass::from_pending(total_pending, large_threshold, pack_threshold),
            is_retry: false,
        }
    }

    pub fn as_retry(mut self) -> Self {
        self.is_retry = true;
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Collection identifiers in batch order.
    pub fn item_ids(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.id.as_str()).collect()
    }

    /// Whether a collection was declared as part of this batch.
    pub fn declares(&self, collection_id: &str) -> bool {
        self.items.iter().any(|i| i.id == collection_id)
    }

    /// Short human-readable label used in logs and artifact file names.
    pub fn label(&self) -> String {
        self.item_ids().join("+")
    }
}
