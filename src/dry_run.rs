//! Token and cost estimation without calling any model.
//!
//! [`DryRunEstimator`] walks a chain exactly like the executor does, but
//! replaces each LLM call with a token estimate of the built prompt plus the
//! step's max-completion budget. A filler output stands in for the real one
//! so later steps see input of plausible size.

use crate::config::EngineConfig;
use crate::error::{Result, StepError};
use crate::exec_ctx::ExecutionContext;
use crate::executor::ChainRequest;
use crate::params::{NovelDataLookup, ParameterResolver, ResolutionScope};
use crate::plan::{estimate_prompt, StepPlanner};
use crate::prompt::{PromptBuilder, Sanitizer, TaskCatalog};
use crate::step::{ChainSpec, RuleStep};
use crate::tokens::{HeuristicTokenEstimator, TokenEstimator};
use crate::types::{StepResult, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Upper bound, in tokens, on the simulated output of one step.
const PLACEHOLDER_TOKEN_CAP: u32 = 512;

/// Coarse cost bucket for a chain's estimated total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CostTier {
    Low,
    Medium,
    High,
}

impl CostTier {
    /// Both thresholds are inclusive upper bounds.
    pub fn classify(total_tokens: u64, low: u64, high: u64) -> Self {
        if total_tokens <= low {
            CostTier::Low
        } else if total_tokens <= high {
            CostTier::Medium
        } else {
            CostTier::High
        }
    }
}

/// Estimate for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEstimate {
    pub order: u32,
    pub task_type: String,
    /// `Succeeded` when the prompt could be built, `Failed` when it could
    /// not, `Skipped` for disabled steps.
    pub status: StepStatus,
    pub model_id: String,
    pub prompt_tokens: u32,
    pub max_completion_tokens: u32,
    pub error: Option<StepError>,
    pub warnings: Vec<String>,
}

impl StepEstimate {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens as u64 + self.max_completion_tokens as u64
    }
}

/// Result of a dry run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub steps: Vec<StepEstimate>,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub tier: CostTier,
    /// Every step warning, prefixed with its step order.
    pub warnings: Vec<String>,
}

/// Estimates what a chain would cost to run.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use novel_rulechain::config::{EngineConfig, ModelConfig};
/// use novel_rulechain::dry_run::{CostTier, DryRunEstimator};
/// use novel_rulechain::executor::ChainRequest;
/// use novel_rulechain::step::{ChainSpec, RuleStep};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let config = EngineConfig::default()
///     .with_model(ModelConfig::new("fast", "local", "llama3.2:3b"))
///     .with_default_model("fast");
/// let estimator = DryRunEstimator::new(Arc::new(config));
///
/// let spec = ChainSpec::new(vec![RuleStep::new(1, "summarize").with_max_tokens(100)]);
/// let estimate = estimator.estimate(&spec, &ChainRequest::new("It was a dark night.")).await.unwrap();
/// assert_eq!(estimate.steps[0].max_completion_tokens, 100);
/// assert_eq!(estimate.tier, CostTier::Low);
/// # });
/// ```
pub struct DryRunEstimator {
    config: Arc<EngineConfig>,
    resolver: ParameterResolver,
    builder: PromptBuilder,
    catalog: TaskCatalog,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for DryRunEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DryRunEstimator")
            .field("resolver", &self.resolver)
            .field("task_types", &self.catalog.task_types())
            .finish_non_exhaustive()
    }
}

impl DryRunEstimator {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let sanitizer = Sanitizer::from_config(&config.sanitizer);
        Self {
            resolver: ParameterResolver::new(sanitizer.clone()),
            builder: PromptBuilder::new(sanitizer),
            catalog: TaskCatalog::builtin(),
            estimator: Arc::new(HeuristicTokenEstimator),
            config,
        }
    }

    /// Novel-data parameters are resolved for real so prompt sizes match.
    pub fn with_novel_data(mut self, lookup: Arc<dyn NovelDataLookup>) -> Self {
        self.resolver = self.resolver.with_novel_data(lookup);
        self
    }

    pub fn with_catalog(mut self, catalog: TaskCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_token_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Estimate `spec` for `request`.
    ///
    /// # Errors
    ///
    /// Fails for an invalid spec or when an enabled step's model (after
    /// fallback) cannot be determined from the config.
    pub async fn estimate(&self, spec: &ChainSpec, request: &ChainRequest) -> Result<CostEstimate> {
        spec.validate()?;
        for step in spec.steps.iter().filter(|s| s.enabled) {
            self.config.effective_model(spec.requested_model(step))?;
        }

        let planner = StepPlanner {
            config: &self.config,
            spec,
            resolver: &self.resolver,
            builder: &self.builder,
            catalog: &self.catalog,
        };
        let mut ctx = ExecutionContext::new(request.original_input.clone());
        let mut steps = Vec::new();

        for step in spec.ordered_steps() {
            let estimate = if step.enabled {
                self.estimate_step(&planner, step, request, &mut ctx).await?
            } else {
                StepEstimate {
                    order: step.order,
                    task_type: step.task_type.clone(),
                    status: StepStatus::Skipped,
                    model_id: String::new(),
                    prompt_tokens: 0,
                    max_completion_tokens: 0,
                    error: None,
                    warnings: Vec::new(),
                }
            };
            steps.push(estimate);
        }

        let total_prompt_tokens: u64 = steps.iter().map(|s| s.prompt_tokens as u64).sum();
        let total_completion_tokens: u64 =
            steps.iter().map(|s| s.max_completion_tokens as u64).sum();
        let total_tokens = total_prompt_tokens + total_completion_tokens;
        let tier = CostTier::classify(total_tokens, self.config.cost.low, self.config.cost.high);
        let warnings = steps
            .iter()
            .flat_map(|s| s.warnings.iter().map(move |w| format!("step {}: {w}", s.order)))
            .collect();

        info!(total_tokens, ?tier, "dry run estimated");
        Ok(CostEstimate {
            steps,
            total_prompt_tokens,
            total_completion_tokens,
            total_tokens,
            tier,
            warnings,
        })
    }

    async fn estimate_step(
        &self,
        planner: &StepPlanner<'_>,
        step: &RuleStep,
        request: &ChainRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<StepEstimate> {
        let model = self.config.effective_model(planner.spec.requested_model(step))?;
        let mut estimate = StepEstimate {
            order: step.order,
            task_type: step.task_type.clone(),
            status: StepStatus::Failed,
            model_id: model.logical_id.clone(),
            prompt_tokens: 0,
            max_completion_tokens: 0,
            error: None,
            warnings: Vec::new(),
        };
        let mut result = StepResult::not_run(step.order, &step.task_type, StepStatus::Failed);

        let input_text = planner.input_text(step, ctx);
        let scope = ResolutionScope {
            user_inputs: &request.user_inputs,
            novel_id: request.novel_id.as_deref(),
            context: &*ctx,
        };
        let built = match planner.resolve_params(step, &input_text, scope).await {
            Ok(params) => planner.build_prompt(step, &params),
            Err(e) => Err(e),
        };
        let prompt = match built {
            Ok(prompt) => prompt,
            Err(e) => {
                debug!(step = step.order, error = %e, "dry run: step would fail");
                estimate.error = Some(StepError::from(&e));
                if let Some(name) = output_variable(step) {
                    ctx.ensure_variable(name);
                }
                ctx.record(result);
                return Ok(estimate);
            }
        };

        estimate.prompt_tokens = estimate_prompt(self.estimator.as_ref(), &prompt, &model.logical_id);
        estimate.max_completion_tokens = planner.max_tokens(step);
        estimate.status = StepStatus::Succeeded;
        if estimate.prompt_tokens > model.max_context_tokens {
            estimate.warnings.push(format!(
                "estimated prompt of {} tokens exceeds the {} token context of '{}'",
                estimate.prompt_tokens, model.max_context_tokens, model.logical_id
            ));
        }

        let filler = placeholder_output(estimate.max_completion_tokens);
        if let Some(name) = output_variable(step) {
            ctx.set_variable(name, Value::String(filler.clone()));
        }
        result.status = StepStatus::Succeeded;
        result.output_text = Some(filler);
        ctx.record(result);
        Ok(estimate)
    }
}

fn output_variable(step: &RuleStep) -> Option<&str> {
    step.output_variable_name.as_deref().filter(|n| !n.is_empty())
}

/// Filler text of roughly `min(max_tokens, 512)` tokens.
fn placeholder_output(max_tokens: u32) -> String {
    "x".repeat(max_tokens.min(PLACEHOLDER_TOKEN_CAP) as usize * 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::error::ErrorKind;
    use crate::params::ParameterDefinition;

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_model(ModelConfig::new("m", "local", "llama").with_max_context_tokens(1_000))
            .with_default_model("m")
    }

    fn fixture_estimator() -> DryRunEstimator {
        DryRunEstimator::new(Arc::new(config())).with_token_estimator(Arc::new(
            |text: &str, _model: &str| if text.contains("FIRST") { 120 } else { 95 },
        ))
    }

    #[tokio::test]
    async fn two_step_fixture_totals_815() {
        let spec = ChainSpec::new(vec![
            RuleStep::new(1, "custom").with_template("FIRST: {input}"),
            RuleStep::new(2, "custom")
                .with_template("SECOND: {input}")
                .from_previous_step(),
        ])
        .with_default_max_tokens(300);

        let estimate = fixture_estimator()
            .estimate(&spec, &ChainRequest::new("some chapter"))
            .await
            .unwrap();
        assert_eq!(estimate.steps[0].prompt_tokens, 120);
        assert_eq!(estimate.steps[1].prompt_tokens, 95);
        assert_eq!(estimate.total_prompt_tokens, 215);
        assert_eq!(estimate.total_completion_tokens, 600);
        assert_eq!(estimate.total_tokens, 815);
        assert_eq!(estimate.tier, CostTier::Low);
    }

    #[test]
    fn tier_thresholds_are_inclusive() {
        assert_eq!(CostTier::classify(4_000, 4_000, 16_000), CostTier::Low);
        assert_eq!(CostTier::classify(4_001, 4_000, 16_000), CostTier::Medium);
        assert_eq!(CostTier::classify(16_000, 4_000, 16_000), CostTier::Medium);
        assert_eq!(CostTier::classify(16_001, 4_000, 16_000), CostTier::High);
    }

    #[tokio::test]
    async fn placeholder_feeds_later_steps() {
        let spec = ChainSpec::new(vec![
            RuleStep::new(1, "summarize")
                .with_max_tokens(1_000)
                .with_output_variable("summary"),
            RuleStep::new(2, "custom")
                .with_template("Expand {s}")
                .with_parameter("s", ParameterDefinition::previous_step_output("summary")),
        ]);
        let estimator = DryRunEstimator::new(Arc::new(config()));
        let estimate = estimator.estimate(&spec, &ChainRequest::new("short")).await.unwrap();

        // 512 * 4 filler characters -> 512 heuristic tokens, plus framing
        assert!(estimate.steps[1].prompt_tokens > 512);
        assert!(estimate.steps[1].prompt_tokens < 1_000);
        assert_eq!(estimate.steps[0].max_completion_tokens, 1_000);
    }

    #[tokio::test]
    async fn failing_step_counts_zero_and_disabled_is_skipped() {
        let spec = ChainSpec::new(vec![
            RuleStep::new(1, "translate"),
            RuleStep::new(2, "summarize").disabled(),
            RuleStep::new(3, "summarize").with_max_tokens(10),
        ]);
        let estimate = fixture_estimator()
            .estimate(&spec, &ChainRequest::new("text"))
            .await
            .unwrap();
        assert_eq!(estimate.steps[0].status, StepStatus::Failed);
        assert_eq!(estimate.steps[0].error.as_ref().unwrap().kind, ErrorKind::PromptBuild);
        assert_eq!(estimate.steps[0].total_tokens(), 0);
        assert_eq!(estimate.steps[1].status, StepStatus::Skipped);
        assert_eq!(estimate.total_tokens, 95 + 10);
    }

    #[tokio::test]
    async fn oversized_prompt_warns() {
        let estimator = DryRunEstimator::new(Arc::new(config()))
            .with_token_estimator(Arc::new(|_: &str, _: &str| 5_000));
        let spec = ChainSpec::new(vec![RuleStep::new(1, "summarize")]);
        let estimate = estimator.estimate(&spec, &ChainRequest::new("x")).await.unwrap();
        assert_eq!(estimate.warnings.len(), 1);
        assert!(estimate.warnings[0].starts_with("step 1: estimated prompt of 5000 tokens"));
    }

    #[tokio::test]
    async fn unknown_model_is_fatal() {
        let spec = ChainSpec::new(vec![RuleStep::new(1, "summarize").with_model("ghost")]);
        let err = fixture_estimator()
            .estimate(&spec, &ChainRequest::new("x"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
