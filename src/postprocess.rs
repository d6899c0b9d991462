//! Post-processing rules applied to a step's raw LLM output.
//!
//! Rules run in declared order. Each maps the current text to new text and,
//! for the JSON rules, a structured value. A failing rule is recorded and
//! skipped; the text it received passes on unchanged.

use crate::error::ChainError;
use crate::output_parser::{extract_fenced_json, locate_json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// One post-processing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessingRule {
    /// Strip leading and trailing whitespace.
    Trim,
    /// Locate and parse JSON anywhere in the text (whole text, fenced
    /// block, or the last balanced object/array). The text is kept.
    #[serde(alias = "parse-json", alias = "parse_as_json")]
    ParseJson,
    /// Take the body of a markdown code fence as both the new text and the
    /// structured value. Unfenced text is accepted if it is JSON itself.
    #[serde(alias = "extract-json-from-markdown")]
    ExtractJsonFromMarkdown,
}

impl PostProcessingRule {
    pub fn name(&self) -> &'static str {
        match self {
            PostProcessingRule::Trim => "trim",
            PostProcessingRule::ParseJson => "parse_json",
            PostProcessingRule::ExtractJsonFromMarkdown => "extract_json_from_markdown",
        }
    }

    /// Apply this rule to `text`.
    pub fn apply(&self, text: &str) -> Result<(String, Option<Value>), ChainError> {
        let failed = |reason: String| ChainError::PostProcessing {
            rule: self.name().to_string(),
            reason,
        };
        match self {
            PostProcessingRule::Trim => Ok((text.trim().to_string(), None)),
            PostProcessingRule::ParseJson => {
                let (_, value) = locate_json(text).map_err(|e| failed(e.to_string()))?;
                Ok((text.to_string(), Some(value)))
            }
            PostProcessingRule::ExtractJsonFromMarkdown => {
                let (body, value) = extract_fenced_json(text).map_err(|e| failed(e.to_string()))?;
                Ok((body, Some(value)))
            }
        }
    }
}

/// Result of running a rule list.
#[derive(Debug, Default)]
pub struct PostProcessOutcome {
    pub text: String,
    /// Value from the last JSON rule that succeeded.
    pub structured: Option<Value>,
    /// Names of the rules that ran, in order.
    pub applied: Vec<String>,
    /// One `ChainError::PostProcessing` per failed rule.
    pub errors: Vec<ChainError>,
}

/// Run `rules` over `raw` in order.
///
/// # Example
///
/// ```
/// use novel_rulechain::postprocess::{apply_rules, PostProcessingRule};
/// use serde_json::json;
///
/// let out = apply_rules(
///     &[PostProcessingRule::ExtractJsonFromMarkdown],
///     "```json\n{\"a\":1}\n```",
/// );
/// assert_eq!(out.text, r#"{"a":1}"#);
/// assert_eq!(out.structured, Some(json!({"a": 1})));
/// ```
pub fn apply_rules(rules: &[PostProcessingRule], raw: &str) -> PostProcessOutcome {
    let mut outcome = PostProcessOutcome {
        text: raw.to_string(),
        ..Default::default()
    };
    for rule in rules {
        outcome.applied.push(rule.name().to_string());
        match rule.apply(&outcome.text) {
            Ok((text, structured)) => {
                outcome.text = text;
                if structured.is_some() {
                    outcome.structured = structured;
                }
            }
            Err(err) => {
                debug!(rule = rule.name(), error = %err, "post-processing rule failed");
                outcome.errors.push(err);
            }
        }
    }
    outcome
}
