//! Ground-truth lookups used to cross-check backend proposals

use crate::model::TargetItem;
use crate::storage::RecordStore;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Authoritative answers about identifiers a backend referred to.
pub trait ValidationLookup {
    /// Collection the item truly belongs to
    fn collection_of(&self, item_id: &str) -> Option<String>;

    /// Correspondence already assigned to the item
    fn correspondence_of(&self, item_id: &str) -> Option<String>;

    /// Whether the canonical entry exists
    fn has_reference(&self, reference_id: &str) -> bool;

    /// Item of `collection_id` already mapped to `reference_id`
    fn item_for_reference(&self, collection_id: &str, reference_id: &str) -> Option<String>;
}

/// In-memory ground truth snapshot.
#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    items: HashMap<String, (String, Option<String>)>,
    references: HashSet<String>,
}

impl GroundTruth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, item: &TargetItem) -> Self {
        self.items.insert(
            item.id.clone(),
            (item.collection_id.clone(), item.correspondence.clone()),
        );
        self
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.references.insert(reference_id.into());
        self
    }
}

impl ValidationLookup for GroundTruth {
    fn collection_of(&self, item_id: &str) -> Option<String> {
        self.items.get(item_id).map(|(c, _)| c.clone())
    }

    fn correspondence_of(&self, item_id: &str) -> Option<String> {
        self.items.get(item_id).and_then(|(_, r)| r.clone())
    }

    fn has_reference(&self, reference_id: &str) -> bool {
        self.references.contains(reference_id)
    }

    fn item_for_reference(&self, collection_id: &str, reference_id: &str) -> Option<String> {
        let mut hits: Vec<&String> = self
            .items
            .iter()
            .filter(|(_, (c, r))| c == collection_id && r.as_deref() == Some(reference_id))
            .map(|(id, _)| id)
            .collect();
        hits.sort();
        hits.first().map(|id| (*id).clone())
    }
}

/// Lookups answered live by the record store.
///
/// A read failure is logged and answered as "absent". Writes stay guarded by
/// the store itself.
pub struct StoreLookup<'a> {
    store: &'a dyn RecordStore,
}

impl<'a> StoreLookup<'a> {
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self { store }
    }

    fn item(&self, item_id: &str) -> Option<TargetItem> {
        self.store.target_item(item_id).unwrap_or_else(|e| {
            warn!(item = item_id, error = %e, "ground truth read failed");
            None
        })
    }
}

impl ValidationLookup for StoreLookup<'_> {
    fn collection_of(&self, item_id: &str) -> Option<String> {
        self.item(item_id).map(|i| i.collection_id)
    }

    fn correspondence_of(&self, item_id: &str) -> Option<String> {
        self.item(item_id).and_then(|i| i.correspondence)
    }

    fn has_reference(&self, reference_id: &str) -> bool {
        self.store.has_canonical(reference_id).unwrap_or_else(|e| {
            warn!(reference = reference_id, error = %e, "ground truth read failed");
            false
        })
    }

    fn item_for_reference(&self, collection_id: &str, reference_id: &str) -> Option<String> {
        self.store
            .item_for_reference(collection_id, reference_id)
            .unwrap_or_else(|e| {
                warn!(collection = collection_id, reference = reference_id, error = %e, "ground truth read failed");
                None
            })
    }
}
