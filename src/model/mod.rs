//! Core data types shared by the packer, dispatcher, classifier and run controller

mod matching;
mod records;
mod work;

pub use matching::{MatchCandidate, MatchKind, ValidatedMatch};
pub use records::{CanonicalEntry, Fingerprint, TargetItem};
pub use work::{Batch, SizeClass, WorkItem};
