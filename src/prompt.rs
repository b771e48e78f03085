//! Prompt construction for match requests
//!
//! Items and reference entries enter prompts only as fingerprints produced by
//! a pluggable `Fingerprinter`; the prompt builder never looks inside them.

use crate::extract::PAYLOAD_SCHEMA;
use crate::model::{Batch, CanonicalEntry, Fingerprint, TargetItem};
use serde_json::json;
use std::fmt::Write;

/// Turns raw record text into a compact comparable representation.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, text: &str) -> Fingerprint;
}

/// Default fingerprint: lowercased, whitespace-collapsed, length-capped text.
#[derive(Debug, Clone)]
pub struct CompactFingerprinter {
    pub max_chars: usize,
}

impl Default for CompactFingerprinter {
    fn default() -> Self {
        Self { max_chars: 160 }
    }
}

impl Fingerprinter for CompactFingerprinter {
    fn fingerprint(&self, text: &str) -> Fingerprint {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Fingerprint::new(collapsed.to_lowercase().chars().take(self.max_chars).collect::<String>())
    }
}

const MATCH_INSTRUCTION: &str = "Match each TARGET item to the REFERENCE entry it denotes. \
Use EXACT only when they are certainly the same entry, LIKELY when probably so, AMBIGUOUS \
when several references fit, NEW when no reference fits and the item is a genuine entry of \
its own, and REJECT when the item should not be matched at all. Confidence is 0-100. Only \
use identifiers that appear below, and keep each target item in its own collection. Reply \
with JSON only, in a ```json fenced block, matching this schema:";

/// Builds the match prompt for one batch.
pub struct PromptBuilder<'a> {
    fingerprinter: &'a dyn Fingerprinter,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(fingerprinter: &'a dyn Fingerprinter) -> Self {
        Self { fingerprinter }
    }

    /// `items` holds the pending target items of every collection in `batch`.
    pub fn build(
        &self,
        batch: &Batch,
        references: &[CanonicalEntry],
        items: &[TargetItem],
    ) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "{}\n{}\n", MATCH_INSTRUCTION, PAYLOAD_SCHEMA);

        let _ = writeln!(prompt, "REFERENCE entries ({}):", references.len());
        for entry in references {
            let line = json!({
                "id": entry.id,
                "fp": self.fingerprinter.fingerprint(&entry.text),
            });
            let _ = writeln!(prompt, "{}", line);
        }

        for work_item in &batch.items {
            let members: Vec<&TargetItem> = items
                .iter()
                .filter(|i| i.collection_id == work_item.id)
                .collect();
            let _ = writeln!(
                prompt,
                "\nTARGET items of collection \"{}\" ({}):",
                work_item.id,
                members.len()
            );
            for item in members {
                let line = json!({
                    "id": item.id,
                    "fp": self.fingerprinter.fingerprint(&item.text),
                });
                let _ = writeln!(prompt, "{}", line);
            }
        }

        prompt
    }
}
