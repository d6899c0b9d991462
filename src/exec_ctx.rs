//! Per-run state of a chain execution.
//!
//! [`ExecutionContext`] is created when a chain starts, grows by one
//! [`StepResult`] per step, and is discarded (or turned into an
//! [`ExecutionResult`](crate::types::ExecutionResult)) when the run ends.
//! Steps read the original input, earlier outputs and named variables from
//! it; nothing outside the context is mutated by a step.

use crate::error::{ChainError, Result};
use crate::types::StepResult;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Mutable state of one chain run.
///
/// # Example
///
/// ```
/// use novel_rulechain::exec_ctx::ExecutionContext;
/// use serde_json::json;
///
/// let mut ctx = ExecutionContext::new("Chapter one.");
/// ctx.set_variable("characters", json!({"names": ["Ann", "Bo"]}));
/// assert_eq!(ctx.lookup("characters.names.1"), Some(&json!("Bo")));
/// assert_eq!(ctx.previous_output(), "Chapter one.");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    original_input: String,
    variables: HashMap<String, Value>,
    results: Vec<StepResult>,
    /// Text output of the most recent successful step.
    last_output: Option<String>,
    cancellation: Option<Arc<AtomicBool>>,
}

impl ExecutionContext {
    pub fn new(original_input: impl Into<String>) -> Self {
        Self {
            original_input: original_input.into(),
            ..Default::default()
        }
    }

    /// Attach a caller-owned cancellation flag, checked before each step.
    pub fn with_cancellation(mut self, flag: Option<Arc<AtomicBool>>) -> Self {
        self.cancellation = flag;
        self
    }

    pub fn original_input(&self) -> &str {
        &self.original_input
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Return an error if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ChainError::Cancelled);
        }
        Ok(())
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Set `name` to `null` unless it already holds a value.
    pub(crate) fn ensure_variable(&mut self, name: &str) {
        self.variables
            .entry(name.to_string())
            .or_insert(Value::Null);
    }

    /// Look up `variable[.segment…]`.
    ///
    /// Segments index objects by key and arrays by position. A `null`
    /// anywhere along the path counts as absent.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let root = segments.next().filter(|s| !s.is_empty())?;
        let mut current = self.variables.get(root)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        (!current.is_null()).then_some(current)
    }

    /// Main text input for a `PREVIOUS_STEP` step: the output of the most
    /// recent successful step, or the original input if none has succeeded.
    pub fn previous_output(&self) -> &str {
        self.last_output.as_deref().unwrap_or(&self.original_input)
    }

    /// Append a finished step. Successful steps become the new previous output.
    pub fn record(&mut self, result: StepResult) {
        if result.succeeded() {
            if let Some(text) = &result.output_text {
                self.last_output = Some(text.clone());
            }
        }
        self.results.push(result);
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    /// The most recent successful step.
    pub fn last_success(&self) -> Option<&StepResult> {
        self.results.iter().rev().find(|r| r.succeeded())
    }

    pub(crate) fn into_results(self) -> Vec<StepResult> {
        self.results
    }
}
