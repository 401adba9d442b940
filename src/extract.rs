//! Best-effort structured extraction from free-form model output
//!
//! Models wrap JSON in prose, markdown fences, or both. Every stage that
//! expects JSON from the model goes through `extract_json_object`.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("no JSON object found in model output")]
    NoJsonFound,

    #[error("malformed JSON in model output: {0}")]
    Malformed(String),

    #[error("model output JSON is not an object")]
    NotAnObject,

    #[error("JSON object does not match expected shape: {0}")]
    Shape(String),
}

/// Find the first well-formed JSON object in `text`.
///
/// Candidates, in order: a ```json fenced block, the whole trimmed text,
/// then each balanced top-level `{ ... }` span.
pub fn extract_json_object(text: &str) -> Result<Value, ExtractionError> {
    let mut saw_brace = false;
    let mut saw_non_object = false;
    let mut last_error = None;

    let mut candidates: Vec<&str> = Vec::new();
    if let Some(fenced) = fenced_block(text) {
        candidates.push(fenced);
    }
    candidates.push(text.trim());
    candidates.extend(balanced_objects(text));

    for candidate in candidates {
        if candidate.is_empty() {
            continue;
        }
        if candidate.contains('{') {
            saw_brace = true;
        }

        match serde_json::from_str::<Value>(candidate) {
            Ok(value) if value.is_object() => return Ok(value),
            Ok(_) => saw_non_object = true,
            Err(e) => {
                if candidate.starts_with('{') {
                    last_error = Some(e.to_string());
                }
            }
        }
    }

    if let Some(error) = last_error {
        Err(ExtractionError::Malformed(error))
    } else if saw_non_object && !saw_brace {
        Err(ExtractionError::NotAnObject)
    } else {
        Err(ExtractionError::NoJsonFound)
    }
}

/// Extract the first JSON object and deserialize it into `T`
pub fn extract_as<T: DeserializeOwned>(text: &str) -> Result<T, ExtractionError> {
    let value = extract_json_object(text)?;
    serde_json::from_value(value).map_err(|e| ExtractionError::Shape(e.to_string()))
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```json")?;
    let after_fence = &text[start + 7..];
    let end = after_fence.find("```")?;
    Some(after_fence[..end].trim())
}

/// Top-level balanced `{ ... }` spans, skipping braces inside string literals
fn balanced_objects(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_plain_object() {
        let value = extract_json_object(r#"{"safe": true}"#).unwrap();
        assert_eq!(value["safe"], true);
    }

    #[test]
    fn test_fenced_block_with_prose() {
        let text = "Here you go:\n```json\n{\"rating\": 82}\n```\nHope that helps.";
        assert_eq!(extract_json_object(text).unwrap()["rating"], 82);
    }

    #[test]
    fn test_object_embedded_in_prose_with_braces_in_strings() {
        let text = r#"Sure! {"reasoning": "uses {curly} text", "confidence": 0.9} trailing {"second": 1}"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["confidence"], 0.9);
        assert!(value.get("second").is_none());
    }

    #[test]
    fn test_skips_malformed_span_and_takes_next() {
        let text = r#"{not json} then {"ok": 1}"#;
        assert_eq!(extract_json_object(text).unwrap()["ok"], 1);
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(extract_json_object("no json here"), Err(ExtractionError::NoJsonFound));
        assert_eq!(extract_json_object("[1, 2, 3]"), Err(ExtractionError::NotAnObject));
        assert!(matches!(
            extract_json_object("{\"a\": "),
            Err(ExtractionError::Malformed(_))
        ));
    }

    #[test]
    fn test_extract_as_shape_error() {
        #[derive(Debug, Deserialize)]
        struct Rating {
            #[allow(dead_code)]
            rating: u32,
        }

        assert!(extract_as::<Rating>(r#"{"rating": 7}"#).is_ok());
        assert!(matches!(
            extract_as::<Rating>(r#"{"score": 7}"#),
            Err(ExtractionError::Shape(_))
        ));
    }
}
