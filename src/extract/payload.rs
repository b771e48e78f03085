//! Decoding extracted JSON into match candidates

use super::json::{extract_structured, ExtractionError};
use crate::model::MatchCandidate;
use serde_json::Value;

/// Schema the backends are asked to produce, quoted in prompts and repair requests.
pub const PAYLOAD_SCHEMA: &str = r#"{
  "matches": [
    {
      "reference_id": "<canonical entry id, empty for NEW>",
      "target_item_id": "<target item id>",
      "target_collection_id": "<collection id of the target item>",
      "match_kind": "EXACT | LIKELY | AMBIGUOUS | NEW | REJECT",
      "confidence": <number 0-100>,
      "reasons": ["<short reason>", "..."]
    }
  ]
}"#;

/// Decode an extracted value into candidates.
///
/// Accepts either `{"matches": [...]}` or a bare array. Any element that does
/// not fit the schema fails the whole payload so it can go to repair.
pub fn decode_candidates(value: Value) -> Result<Vec<MatchCandidate>, ExtractionError> {
    let elements = match value {
        Value::Array(elements) => elements,
        Value::Object(mut map) => match map.remove("matches") {
            Some(Value::Array(elements)) => elements,
            Some(_) => {
                return Err(ExtractionError::Schema(
                    "\"matches\" is not an array".to_string(),
                ))
            }
            None => {
                return Err(ExtractionError::Schema(
                    "object has no \"matches\" field".to_string(),
                ))
            }
        },
        other => {
            return Err(ExtractionError::Schema(format!(
                "expected an object or array, got {}",
                kind_of(&other)
            )))
        }
    };

    elements
        .into_iter()
        .enumerate()
        .map(|(index, element)| {
            let mut candidate: MatchCandidate = serde_json::from_value(element)
                .map_err(|e| ExtractionError::Schema(format!("match {}: {}", index, e)))?;
            if !candidate.confidence.is_finite() {
                return Err(ExtractionError::Schema(format!(
                    "match {}: confidence is not a number",
                    index
                )));
            }
            candidate.confidence = candidate.confidence.clamp(0.0, 100.0);
            Ok(candidate)
        })
        .collect()
}

/// Extract and decode in one step.
pub fn parse_candidates(text: &str) -> Result<Vec<MatchCandidate>, ExtractionError> {
    decode_candidates(extract_structured(text)?)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
