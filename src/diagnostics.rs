//! Per-step diagnostics.
//!
//! [`StepDiagnostics`] records what happened inside one step beyond its
//! output: how large the prompt was estimated to be, whether the vendor
//! reported token usage, which model served the call, and which
//! post-processing rules ran.

use serde::{Deserialize, Serialize};

/// Records what happened while a step executed.
///
/// Attached to every [`StepResult`](crate::types::StepResult).
///
/// # Example
///
/// ```
/// use novel_rulechain::diagnostics::StepDiagnostics;
///
/// let diag = StepDiagnostics::default();
/// assert!(diag.ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDiagnostics {
    /// Heuristic estimate of the built prompt (system + user), in tokens.
    pub estimated_prompt_tokens: u32,

    /// The vendor did not report usage; token counts are estimates.
    pub usage_estimated: bool,

    /// Logical id of the model that served the call.
    pub model_id: Option<String>,

    /// Whether the safety fallback model produced the output.
    pub safety_fallback: bool,

    /// Post-processing rules that ran, in order.
    pub post_processing: Vec<String>,

    /// First post-processing failure, if any. The raw text was kept.
    pub post_processing_error: Option<String>,
}

impl StepDiagnostics {
    /// Quick check: did every post-processing rule succeed?
    pub fn ok(&self) -> bool {
        self.post_processing_error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_default_is_ok() {
        let d = StepDiagnostics::default();
        assert!(d.ok());
        assert!(d.model_id.is_none());
        assert!(d.post_processing.is_empty());
        assert!(!d.usage_estimated);
    }

    #[test]
    fn test_diagnostics_with_error_is_not_ok() {
        let d = StepDiagnostics {
            post_processing_error: Some("bad json".to_string()),
            ..Default::default()
        };
        assert!(!d.ok());
    }
}
