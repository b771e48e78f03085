//! Recovering structured match payloads from free-text backend replies
//!
//! `extract_structured` finds and parses the JSON embedded in a reply,
//! `decode_candidates` turns it into match candidates, and `Repairer` makes
//! one bounded attempt to have a backend rewrite output that fails both.

mod json;
mod payload;
mod repair;

pub use json::{extract_structured, ExtractionError};
pub use payload::{decode_candidates, parse_candidates, PAYLOAD_SCHEMA};
pub use repair::{RepairError, Repairer, REPAIR_INSTRUCTION};
