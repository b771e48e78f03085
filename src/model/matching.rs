//! Match candidates proposed by a backend and their validated form

use serde::{Deserialize, Serialize};
use std::fmt;

/// How strongly a backend claims a target item corresponds to a reference entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchKind {
    #[serde(alias = "exact")]
    Exact,
    #[serde(alias = "likely")]
    Likely,
    #[serde(alias = "ambiguous")]
    Ambiguous,
    #[serde(alias = "new")]
    New,
    #[serde(alias = "reject")]
    Reject,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exact => "EXACT",
            Self::Likely => "LIKELY",
            Self::Ambiguous => "AMBIGUOUS",
            Self::New => "NEW",
            Self::Reject => "REJECT",
        };
        f.write_str(s)
    }
}

/// A proposed correspondence, exactly as decoded from a backend reply.
///
/// Nothing about it has been checked yet: the identifiers may be hallucinated
/// and the confidence may be out of range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// Canonical entry the item is claimed to match (empty for NEW)
    #[serde(default, alias = "referenceId")]
    pub reference_id: String,
    #[serde(alias = "targetItemId")]
    pub target_item_id: String,
    #[serde(alias = "targetCollectionId")]
    pub target_collection_id: String,
    #[serde(alias = "matchKind", alias = "kind")]
    pub match_kind: MatchKind,
    /// 0..=100
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl MatchCandidate {
    pub fn new(
        reference_id: impl Into<String>,
        target_item_id: impl Into<String>,
        target_collection_id: impl Into<String>,
        match_kind: MatchKind,
        confidence: f64,
    ) -> Self {
        Self {
            reference_id: reference_id.into(),
            target_item_id: target_item_id.into(),
            target_collection_id: target_collection_id.into(),
            match_kind,
            confidence,
            reasons: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }
}

impl fmt::Display for MatchCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> {} ({} {:.1})",
            self.target_collection_id,
            self.target_item_id,
            if self.reference_id.is_empty() { "-" } else { &self.reference_id },
            self.match_kind,
            self.confidence
        )
    }
}

/// A candidate whose target item was confirmed to exist in the declared collection.
///
/// Only the validator constructs these, so holding one is proof the
/// identifiers were cross-checked against ground truth.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMatch {
    candidate: MatchCandidate,
}

impl ValidatedMatch {
    pub(crate) fn new(candidate: MatchCandidate) -> Self {
        Self { candidate }
    }

    pub fn candidate(&self) -> &MatchCandidate {
        &self.candidate
    }

    pub fn reference_id(&self) -> &str {
        &self.candidate.reference_id
    }

    pub fn item_id(&self) -> &str {
        &self.candidate.target_item_id
    }

    pub fn collection_id(&self) -> &str {
        &self.candidate.target_collection_id
    }

    pub fn kind(&self) -> MatchKind {
        self.candidate.match_kind
    }

    pub fn confidence(&self) -> f64 {
        self.candidate.confidence
    }
}

impl fmt::Display for ValidatedMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.candidate.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_accepts_camel_case_and_lowercase_kind() {
        let json = r#"{
            "referenceId": "r1",
            "targetItemId": "i1",
            "targetCollectionId": "c1",
            "matchKind": "likely",
            "confidence": 82.5
        }"#;
        let c: MatchCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(c.match_kind, MatchKind::Likely);
        assert_eq!(c.reference_id, "r1");
        assert!(c.reasons.is_empty());
    }

    #[test]
    fn new_candidate_may_omit_reference() {
        let json = r#"{"target_item_id":"i9","target_collection_id":"c1","match_kind":"NEW","confidence":70}"#;
        let c: MatchCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(c.match_kind, MatchKind::New);
        assert!(c.reference_id.is_empty());
    }
}
