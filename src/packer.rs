//! Batch packing under unit and item caps
//!
//! Large work items anchor their own batch; anchors below the pack threshold
//! take small items into their headroom. Leftover small items are packed
//! greedily among themselves. Reverse mode sorts everything by ascending size
//! and fills strictly by the caps, which resolves the most collections per
//! backend call.
//!
//! Packing is deterministic: the same input order, options and scores always
//! produce the same batches.

use crate::model::{Batch, WorkItem};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Packing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackingConfig {
    pub max_units_per_batch: usize,
    pub max_items_per_batch: usize,
    /// Items with at least this many pending units anchor their own batch
    pub large_threshold: usize,
    /// Anchors below this many pending units accept small items alongside
    pub pack_threshold: usize,
    pub reverse: bool,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            max_units_per_batch: 250,
            max_items_per_batch: 20,
            large_threshold: 50,
            pack_threshold: 150,
            reverse: false,
        }
    }
}

/// Per-call packing options
#[derive(Debug, Clone, Default)]
pub struct PackOptions<'a> {
    pub reverse: bool,
    /// Likelihood score per work item id; higher scores are packed first
    pub priority_score: Option<&'a HashMap<String, f64>>,
}

pub struct BatchPacker {
    config: PackingConfig,
}

impl BatchPacker {
    pub fn new(config: PackingConfig) -> Self {
        Self { config }
    }

    fn batch(&self, items: Vec<WorkItem>) -> Batch {
        Batch::new(items, self.config.large_threshold, self.config.pack_threshold)
    }

    /// Whether `next` fits alongside `current` items totalling `units`.
    fn fits(&self, units: usize, count: usize, next: &WorkItem) -> bool {
        units + next.pending_count <= self.config.max_units_per_batch
            && count < self.config.max_items_per_batch
    }

    /// Pack work items into batches.
    ///
    /// Items with nothing pending are skipped.
    pub fn pack(&self, items: &[WorkItem], opts: &PackOptions<'_>) -> Vec<Batch> {
        let mut items: Vec<WorkItem> = items
            .iter()
            .filter(|i| i.pending_count > 0)
            .cloned()
            .collect();

        if let Some(scores) = opts.priority_score {
            // Stable: equal scores keep input order
            items.sort_by(|a, b| {
                let sa = scores.get(&a.id).copied().unwrap_or(0.0);
                let sb = scores.get(&b.id).copied().unwrap_or(0.0);
                sb.total_cmp(&sa)
            });
        }

        if opts.reverse {
            items.sort_by_key(|i| i.pending_count);
            return self.fill_sequential(items);
        }

        let (large, mut small): (Vec<WorkItem>, Vec<WorkItem>) = items
            .into_iter()
            .partition(|i| i.pending_count >= self.config.large_threshold);

        let mut batches = Vec::new();
        for anchor in large {
            let mut units = anchor.pending_count;
            let mut members = vec![anchor];

            if units < self.config.pack_threshold {
                let mut rest = Vec::with_capacity(small.len());
                for candidate in small {
                    if self.fits(units, members.len(), &candidate) {
                        units += candidate.pending_count;
                        members.push(candidate);
                    } else {
                        rest.push(candidate);
                    }
                }
                small = rest;
            }

            batches.push(self.batch(members));
        }

        batches.extend(self.fill_sequential(small));
        batches
    }

    /// Fill batches in order, opening a new one whenever the next item does not fit.
    fn fill_sequential(&self, items: Vec<WorkItem>) -> Vec<Batch> {
        let mut batches = Vec::new();
        let mut current: Vec<WorkItem> = Vec::new();
        let mut units = 0;

        for item in items {
            if !current.is_empty() && !self.fits(units, current.len(), &item) {
                batches.push(self.batch(std::mem::take(&mut current)));
                units = 0;
            }
            units += item.pending_count;
            current.push(item);
        }

        if !current.is_empty() {
            batches.push(self.batch(current));
        }
        batches
    }
}
