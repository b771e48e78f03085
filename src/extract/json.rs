//! JSON span extraction from LLM response text

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no structured data found in response")]
    NoStructuredData,

    #[error("unbalanced structure starting at byte {0}")]
    Unbalanced(usize),

    #[error("structured data failed to parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("payload does not match the expected schema: {0}")]
    Schema(String),
}

/// Extract a JSON value from LLM response text.
///
/// Tries, in order:
/// 1. A fenced block labelled `json` (any case); returned if it parses
/// 2. The first `{` or `[` in the raw text through its matching closer,
///    skipping brackets inside string literals and escape sequences
///
/// Only the first opening bracket is considered. If its span is unbalanced
/// or does not parse, extraction fails.
pub fn extract_structured(text: &str) -> Result<Value, ExtractionError> {
    if let Some(block) = labelled_fence(text) {
        if let Ok(v) = serde_json::from_str::<Value>(block.trim()) {
            return Ok(v);
        }
    }

    let start = text
        .find(['{', '['])
        .ok_or(ExtractionError::NoStructuredData)?;
    let end = balanced_end(text, start).ok_or(ExtractionError::Unbalanced(start))?;

    Ok(serde_json::from_str(&text[start..end])?)
}

/// Body of the first ```json fenced block, if one is closed.
fn labelled_fence(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let line_end = after.find('\n')?;
        let label = after[..line_end].trim();
        let body = &after[line_end + 1..];
        let close = body.find("```")?;
        if label.eq_ignore_ascii_case("json") {
            return Some(&body[..close]);
        }
        rest = &body[close + 3..];
    }
    None
}

/// Byte index one past the bracket closing the one at `start`.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut expected: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => expected.push(b'}'),
            b'[' => expected.push(b']'),
            b'}' | b']' => {
                if expected.pop() != Some(*byte) {
                    return None;
                }
                if expected.is_empty() {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}
