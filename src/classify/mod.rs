//! Result validation and classification
//!
//! Every proposal is cross-checked against ground truth before it can touch
//! the store. Validated proposals are bucketed:
//!
//! - `applied`: EXACT at or above `exact_min`, LIKELY at or above `likely_min`
//! - `review`: AMBIGUOUS, below-threshold, conflicting or duplicate proposals
//! - `created`: NEW, becomes an unverified canonical entry
//! - `rejected`: REJECT, the backend declined to match
//! - `already_applied`: the item already carries this exact correspondence
//!
//! Proposals that fail the cross-check land in `invalid` and are never applied.

mod apply;
mod lookup;

pub use apply::{apply, ApplyReport};
pub use lookup::{GroundTruth, StoreLookup, ValidationLookup};

use crate::model::{Batch, MatchCandidate, MatchKind, ValidatedMatch};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Minimum confidence for automatic application, per match kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub exact_min: f64,
    pub likely_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            exact_min: 95.0,
            likely_min: 80.0,
        }
    }
}

/// Why a candidate failed the cross-check.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("item '{item}' does not exist")]
    UnknownItem { item: String },

    #[error("item '{item}' belongs to '{actual}', not '{declared}'")]
    CollectionMismatch {
        item: String,
        declared: String,
        actual: String,
    },

    #[error("collection '{collection}' is not part of this batch")]
    UndeclaredCollection { collection: String },

    #[error("reference '{reference}' does not exist")]
    UnknownReference { reference: String },
}

impl ValidationError {
    /// Grouping key for review records.
    pub fn group(&self) -> &'static str {
        match self {
            Self::UnknownItem { .. } => "unknown item",
            Self::CollectionMismatch { .. } => "collection mismatch",
            Self::UndeclaredCollection { .. } => "collection outside batch",
            Self::UnknownReference { .. } => "unknown reference",
        }
    }
}

/// Why a validated match needs a human decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewReason {
    Ambiguous,
    LowConfidence { kind: MatchKind, threshold: f64 },
    ConflictingCorrespondence { existing: String },
    DuplicateCorrespondence { existing_item: String },
    RepeatedItem,
}

impl ReviewReason {
    /// Grouping key for review records.
    pub fn group(&self) -> String {
        match self {
            Self::Ambiguous => "ambiguous".to_string(),
            Self::LowConfidence { kind, threshold } => {
                format!("{} below {:.1}", kind, threshold)
            }
            Self::ConflictingCorrespondence { .. } => "conflicts with existing correspondence".to_string(),
            Self::DuplicateCorrespondence { .. } => "reference already mapped in collection".to_string(),
            Self::RepeatedItem => "item proposed more than once".to_string(),
        }
    }
}

impl fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictingCorrespondence { existing } => {
                write!(f, "item already corresponds to '{}'", existing)
            }
            Self::DuplicateCorrespondence { existing_item } => {
                write!(f, "reference already mapped to item '{}'", existing_item)
            }
            other => f.write_str(&other.group()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewItem {
    pub matched: ValidatedMatch,
    pub reason: ReviewReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidCandidate {
    pub candidate: MatchCandidate,
    pub error: ValidationError,
}

/// Classified proposals for one batch.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub applied: Vec<ValidatedMatch>,
    pub review: Vec<ReviewItem>,
    pub created: Vec<ValidatedMatch>,
    pub invalid: Vec<InvalidCandidate>,
    pub rejected: Vec<ValidatedMatch>,
    pub already_applied: Vec<ValidatedMatch>,
}

impl Classification {
    pub fn total(&self) -> usize {
        self.applied.len()
            + self.review.len()
            + self.created.len()
            + self.invalid.len()
            + self.rejected.len()
            + self.already_applied.len()
    }
}

/// Validate and bucket candidates proposed for `batch`.
///
/// Pure apart from lookups: nothing here writes to the store.
pub fn classify(
    candidates: Vec<MatchCandidate>,
    batch: &Batch,
    lookup: &dyn ValidationLookup,
    thresholds: &Thresholds,
) -> Classification {
    let mut out = Classification::default();
    let mut seen_items: HashSet<String> = HashSet::new();
    // (collection, reference) -> item claimed earlier in this batch
    let mut claimed: HashMap<(String, String), String> = HashMap::new();

    for candidate in candidates {
        let matched = match validate(candidate, batch, lookup) {
            Ok(m) => m,
            Err(invalid) => {
                warn!(
                    batch = %batch.label(),
                    candidate = %invalid.candidate,
                    error = %invalid.error,
                    "invalid candidate dropped"
                );
                out.invalid.push(invalid);
                continue;
            }
        };

        if !seen_items.insert(matched.item_id().to_string()) {
            push_review(&mut out, matched, ReviewReason::RepeatedItem);
            continue;
        }

        let existing = lookup.correspondence_of(matched.item_id());

        match matched.kind() {
            MatchKind::Reject => {
                debug!(candidate = %matched, "backend rejected match");
                out.rejected.push(matched);
                continue;
            }
            MatchKind::New => {
                match existing {
                    Some(existing) => push_review(
                        &mut out,
                        matched,
                        ReviewReason::ConflictingCorrespondence { existing },
                    ),
                    None => out.created.push(matched),
                }
                continue;
            }
            _ => {}
        }

        match existing {
            Some(existing) if existing == matched.reference_id() => {
                debug!(candidate = %matched, "correspondence already applied");
                out.already_applied.push(matched);
                continue;
            }
            Some(existing) => {
                push_review(
                    &mut out,
                    matched,
                    ReviewReason::ConflictingCorrespondence { existing },
                );
                continue;
            }
            None => {}
        }

        let threshold = match matched.kind() {
            MatchKind::Exact => thresholds.exact_min,
            MatchKind::Likely => thresholds.likely_min,
            _ => {
                push_review(&mut out, matched, ReviewReason::Ambiguous);
                continue;
            }
        };
        if matched.confidence() < threshold {
            let kind = matched.kind();
            push_review(&mut out, matched, ReviewReason::LowConfidence { kind, threshold });
            continue;
        }

        let key = (
            matched.collection_id().to_string(),
            matched.reference_id().to_string(),
        );
        let holder = claimed
            .get(&key)
            .cloned()
            .or_else(|| lookup.item_for_reference(&key.0, &key.1));
        if let Some(existing_item) = holder.filter(|i| i != matched.item_id()) {
            push_review(
                &mut out,
                matched,
                ReviewReason::DuplicateCorrespondence { existing_item },
            );
            continue;
        }

        claimed.insert(key, matched.item_id().to_string());
        out.applied.push(matched);
    }

    out
}

fn push_review(out: &mut Classification, matched: ValidatedMatch, reason: ReviewReason) {
    debug!(candidate = %matched, reason = %reason, "queued for review");
    out.review.push(ReviewItem { matched, reason });
}

fn validate(
    candidate: MatchCandidate,
    batch: &Batch,
    lookup: &dyn ValidationLookup,
) -> Result<ValidatedMatch, InvalidCandidate> {
    let error = if !batch.declares(&candidate.target_collection_id) {
        Some(ValidationError::UndeclaredCollection {
            collection: candidate.target_collection_id.clone(),
        })
    } else {
        match lookup.collection_of(&candidate.target_item_id) {
            None => Some(ValidationError::UnknownItem {
                item: candidate.target_item_id.clone(),
            }),
            Some(actual) if actual != candidate.target_collection_id => {
                Some(ValidationError::CollectionMismatch {
                    item: candidate.target_item_id.clone(),
                    declared: candidate.target_collection_id.clone(),
                    actual,
                })
            }
            Some(_) => None,
        }
    };

    let error = error.or_else(|| {
        let needs_reference = !matches!(candidate.match_kind, MatchKind::New | MatchKind::Reject);
        (needs_reference && !lookup.has_reference(&candidate.reference_id)).then(|| {
            ValidationError::UnknownReference {
                reference: candidate.reference_id.clone(),
            }
        })
    });

    match error {
        Some(error) => Err(InvalidCandidate { candidate, error }),
        None => Ok(ValidatedMatch::new(candidate)),
    }
}
