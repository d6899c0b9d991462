//! JSON extraction from LLM responses.
//!
//! [`locate_json`] runs the strategy pipeline used by the `parse_json`
//! post-processing rule; [`extract_fenced_json`] is the stricter variant
//! behind `extract_json_from_markdown`.

use serde_json::Value;

use crate::output_parser::error::{truncate, ParseError};
use crate::output_parser::extract::{find_bracketed, json_fence, preprocess};

/// Locate JSON in an LLM response, returning the matched text and its value.
///
/// Strategies (in order):
/// 1. Direct parse of the think-stripped, trimmed text
/// 2. A ```` ```json ```` fence, or a bare fence holding an object/array
/// 3. The last balanced `{...}` in the text
/// 4. The last balanced `[...]` in the text
///
/// Malformed JSON is not repaired; a model that emits it gets a recorded
/// post-processing error and its raw text is kept.
///
/// ```
/// use novel_rulechain::output_parser::locate_json;
///
/// let (text, value) = locate_json(r#"<think>reading...</think>{"sentiment": "melancholy"}"#).unwrap();
/// assert_eq!(text, r#"{"sentiment": "melancholy"}"#);
/// assert_eq!(value["sentiment"], "melancholy");
/// ```
pub fn locate_json(response: &str) -> Result<(String, Value), ParseError> {
    let cleaned = preprocess(response);
    if cleaned.is_empty() {
        return Err(ParseError::EmptyResponse);
    }

    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Ok((cleaned, value));
    }

    let candidates = [
        json_fence(&cleaned),
        find_bracketed(&cleaned, '{', '}'),
        find_bracketed(&cleaned, '[', ']'),
    ];
    let mut first_error = None;
    for candidate in candidates.into_iter().flatten() {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) => return Ok((candidate.to_string(), value)),
            Err(e) => {
                first_error.get_or_insert_with(|| ParseError::Invalid {
                    reason: e.to_string(),
                    candidate: truncate(candidate, 200),
                });
            }
        }
    }

    Err(first_error.unwrap_or(ParseError::NoJson {
        text: truncate(&cleaned, 200),
    }))
}

/// Pull JSON out of a markdown fence.
///
/// Returns the fence body and its parsed value. A response that carries no
/// fence but is itself JSON is accepted as-is.
///
/// ```
/// use novel_rulechain::output_parser::extract_fenced_json;
///
/// let (body, value) = extract_fenced_json("```json\n{\"a\":1}\n```").unwrap();
/// assert_eq!(body, "{\"a\":1}");
/// assert_eq!(value["a"], 1);
/// ```
pub fn extract_fenced_json(response: &str) -> Result<(String, Value), ParseError> {
    let cleaned = preprocess(response);
    if cleaned.is_empty() {
        return Err(ParseError::EmptyResponse);
    }
    match json_fence(&cleaned) {
        Some(body) => serde_json::from_str::<Value>(body)
            .map(|value| (body.to_string(), value))
            .map_err(|e| ParseError::Invalid {
                reason: e.to_string(),
                candidate: truncate(body, 200),
            }),
        None => serde_json::from_str::<Value>(&cleaned)
            .map(|value| (cleaned.clone(), value))
            .map_err(|_| ParseError::NoFence),
    }
}
