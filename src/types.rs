use crate::diagnostics::StepDiagnostics;
use crate::error::StepError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Where a step is in its lifecycle.
///
/// `Pending → ResolvingParams → BuildingPrompt → InvokingLlm →
/// PostProcessing → {Succeeded | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepPhase {
    Pending,
    ResolvingParams,
    BuildingPrompt,
    InvokingLlm,
    PostProcessing,
    Succeeded,
    Failed,
}

/// Terminal status of a step in an [`ExecutionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// The step is disabled in the chain spec.
    Skipped,
    /// Cancellation was requested before the step started.
    Cancelled,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub order: u32,
    pub task_type: String,
    pub status: StepStatus,

    /// Main text input the step ran on.
    pub input_text: String,

    /// Text output after post-processing. `None` unless the LLM call succeeded.
    pub output_text: Option<String>,

    /// Structured value produced by a JSON post-processing rule.
    pub structured_output: Option<Value>,

    /// Phase in which the step failed.
    pub failed_phase: Option<StepPhase>,

    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,

    /// The failure (first) and any non-fatal post-processing errors. A
    /// cancelled step that was next in line records the cancellation.
    pub errors: Vec<StepError>,

    pub duration: Duration,

    pub diagnostics: StepDiagnostics,
}

impl StepResult {
    /// A result for a step that never ran.
    pub(crate) fn not_run(order: u32, task_type: &str, status: StepStatus) -> Self {
        Self {
            order,
            task_type: task_type.to_string(),
            status,
            input_text: String::new(),
            output_text: None,
            structured_output: None,
            failed_phase: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            errors: Vec::new(),
            duration: Duration::ZERO,
            diagnostics: StepDiagnostics::default(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// The error that failed the step, if it failed.
    pub fn failure(&self) -> Option<&StepError> {
        match self.status {
            StepStatus::Failed => self.errors.first(),
            _ => None,
        }
    }
}

/// A recorded error tagged with the step it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStepError {
    pub order: u32,
    #[serde(flatten)]
    pub error: StepError,
}

/// Result of a chain run.
///
/// Always produced once the chain starts; partial failures are reported per
/// step rather than as an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub original_input: String,

    /// Output of the last successful step, or the original input if none succeeded.
    pub final_output: String,

    /// Structured output of that same step, if it produced one.
    pub final_structured: Option<Value>,

    /// One entry per step of the [`ChainSpec`](crate::step::ChainSpec), in order, disabled steps included.
    pub step_results: Vec<StepResult>,

    /// Every recorded error across all steps, in step order.
    pub errors: Vec<ChainStepError>,

    pub total_duration: Duration,

    /// The run stopped early because cancellation was requested.
    pub cancelled: bool,
}

impl ExecutionResult {
    pub fn step(&self, order: u32) -> Option<&StepResult> {
        self.step_results.iter().find(|s| s.order == order)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.step_results
            .iter()
            .filter(|s| s.status == status)
            .count()
    }

    /// Sum of tokens used by every step that called a model.
    pub fn total_tokens(&self) -> u64 {
        self.step_results.iter().map(|s| s.total_tokens as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn failure_is_first_error_of_failed_step() {
        let mut step = StepResult::not_run(2, "translate", StepStatus::Failed);
        step.errors.push(StepError::new(ErrorKind::ContentSafety, "blocked"));
        assert_eq!(step.failure().unwrap().kind, ErrorKind::ContentSafety);

        let skipped = StepResult::not_run(3, "translate", StepStatus::Skipped);
        assert!(skipped.failure().is_none());
    }

    #[test]
    fn status_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_value(StepStatus::Succeeded).unwrap(),
            "SUCCEEDED"
        );
        assert_eq!(
            serde_json::to_value(StepPhase::InvokingLlm).unwrap(),
            "INVOKING_LLM"
        );
    }

    #[test]
    fn chain_step_error_flattens() {
        let err = ChainStepError {
            order: 4,
            error: StepError::new(ErrorKind::PostProcessing, "no fence"),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["order"], 4);
        assert_eq!(json["kind"], "post_processing");
    }
}
