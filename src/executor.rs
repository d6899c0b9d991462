//! Rule-chain execution.
//!
//! [`ChainExecutor`] runs the enabled steps of a [`ChainSpec`] strictly in
//! order. Each step moves through
//!
//! ```text
//! PENDING → RESOLVING_PARAMS → BUILDING_PROMPT → INVOKING_LLM → POST_PROCESSING → SUCCEEDED
//!                 │                   │                 │
//!                 └───────────────────┴─────────────────┴──► FAILED
//! ```
//!
//! A failed step is recorded and the chain moves on. Only model resolution
//! before the first step (and an invalid spec) can fail the whole run.

use crate::error::{ChainError, Result, StepError};
use crate::events::{emit, Event, EventHandler};
use crate::exec_ctx::ExecutionContext;
use crate::orchestrator::{GenerateRequest, Orchestrator};
use crate::params::{NovelDataLookup, ParameterResolver, ResolutionScope};
use crate::plan::{estimate_prompt, StepPlanner};
use crate::postprocess::apply_rules;
use crate::prompt::{PromptBuilder, Sanitizer, TaskCatalog};
use crate::step::{ChainSpec, RuleStep};
use crate::tokens::{HeuristicTokenEstimator, TokenEstimator};
use crate::types::{ChainStepError, ExecutionResult, StepPhase, StepResult, StepStatus};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-run inputs that are not part of the chain spec.
#[derive(Debug, Clone, Default)]
pub struct ChainRequest {
    pub original_input: String,
    /// Values for `user_input` parameters.
    pub user_inputs: HashMap<String, Value>,
    /// Novel the run is about; passed to novel-data lookups.
    pub novel_id: Option<String>,
    /// Checked before each step starts.
    pub cancellation: Option<Arc<AtomicBool>>,
}

impl ChainRequest {
    pub fn new(original_input: impl Into<String>) -> Self {
        Self {
            original_input: original_input.into(),
            ..Default::default()
        }
    }

    pub fn with_user_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_novel_id(mut self, novel_id: impl Into<String>) -> Self {
        self.novel_id = Some(novel_id.into());
        self
    }

    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(flag);
        self
    }
}

/// Executes rule chains against an [`Orchestrator`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use novel_rulechain::config::EngineConfig;
/// use novel_rulechain::executor::{ChainExecutor, ChainRequest};
/// use novel_rulechain::orchestrator::Orchestrator;
/// use novel_rulechain::step::{ChainSpec, RuleStep};
///
/// # async fn run() -> novel_rulechain::error::Result<()> {
/// let config = Arc::new(EngineConfig::load("engine.toml")?);
/// let executor = ChainExecutor::new(Arc::new(Orchestrator::new(config)));
///
/// let spec = ChainSpec::new(vec![
///     RuleStep::new(1, "summarize"),
///     RuleStep::new(2, "analyze_sentiment").from_previous_step(),
/// ]);
/// let result = executor.execute(&spec, ChainRequest::new("Chapter one...")).await?;
/// println!("{}", result.final_output);
/// # Ok(())
/// # }
/// ```
pub struct ChainExecutor {
    orchestrator: Arc<Orchestrator>,
    resolver: ParameterResolver,
    builder: PromptBuilder,
    catalog: TaskCatalog,
    estimator: Arc<dyn TokenEstimator>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for ChainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainExecutor")
            .field("orchestrator", &self.orchestrator)
            .field("resolver", &self.resolver)
            .field("task_types", &self.catalog.task_types())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

impl ChainExecutor {
    /// An executor with the built-in task catalog and the heuristic token
    /// estimator. Sanitizer bounds come from the orchestrator's config.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let sanitizer = Sanitizer::from_config(&orchestrator.config().sanitizer);
        Self {
            resolver: ParameterResolver::new(sanitizer.clone()),
            builder: PromptBuilder::new(sanitizer),
            catalog: TaskCatalog::builtin(),
            estimator: Arc::new(HeuristicTokenEstimator),
            event_handler: None,
            orchestrator,
        }
    }

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

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Run a chain.
    ///
    /// # Errors
    ///
    /// Returns `Err` only for an invalid spec or when a model needed by an
    /// enabled step cannot be resolved (with fallback). Step failures and
    /// cancellation are reported inside the [`ExecutionResult`].
    pub async fn execute(&self, spec: &ChainSpec, request: ChainRequest) -> Result<ExecutionResult> {
        let started = Instant::now();
        spec.validate()?;
        let resolved_models = self.preflight(spec).await?;

        let steps = spec.ordered_steps();
        let enabled = steps.iter().filter(|s| s.enabled).count();
        info!(steps = steps.len(), enabled, "chain started");
        emit(
            &self.event_handler,
            Event::ChainStart {
                steps: steps.len(),
                enabled,
            },
        );

        let config = self.orchestrator.config();
        let planner = StepPlanner {
            config,
            spec,
            resolver: &self.resolver,
            builder: &self.builder,
            catalog: &self.catalog,
        };
        let mut ctx = ExecutionContext::new(request.original_input.clone())
            .with_cancellation(request.cancellation.clone());
        let mut cancelled = false;

        for step in steps {
            let result = if !step.enabled {
                debug!(step = step.order, "step disabled, skipping");
                StepResult::not_run(step.order, &step.task_type, StepStatus::Skipped)
            } else if cancelled {
                StepResult::not_run(step.order, &step.task_type, StepStatus::Cancelled)
            } else if let Err(err) = ctx.check_cancelled() {
                info!(step = step.order, "cancellation requested, stopping chain");
                cancelled = true;
                // recorded once, on the first step that did not start
                let mut result =
                    StepResult::not_run(step.order, &step.task_type, StepStatus::Cancelled);
                result.errors.push(StepError::from(&err));
                result
            } else {
                let expected = resolved_models
                    .get(&spec.requested_model(step).map(str::to_string))
                    .map(String::as_str);
                let result = self
                    .run_step(&planner, step, &request, &ctx, expected)
                    .await;
                store_output(&mut ctx, step, &result);
                result
            };

            emit(
                &self.event_handler,
                Event::StepEnd {
                    order: result.order,
                    status: result.status,
                    duration_ms: result.duration.as_millis() as u64,
                },
            );
            ctx.record(result);
        }

        let (final_output, final_structured) = match ctx.last_success() {
            Some(last) => (
                last.output_text.clone().unwrap_or_default(),
                last.structured_output.clone(),
            ),
            None => (request.original_input.clone(), None),
        };
        let step_results = ctx.into_results();
        let errors: Vec<ChainStepError> = step_results
            .iter()
            .flat_map(|r| {
                r.errors.iter().map(|e| ChainStepError {
                    order: r.order,
                    error: e.clone(),
                })
            })
            .collect();

        let result = ExecutionResult {
            original_input: request.original_input,
            final_output,
            final_structured,
            step_results,
            errors,
            total_duration: started.elapsed(),
            cancelled,
        };
        let succeeded = result.count(StepStatus::Succeeded);
        let failed = result.count(StepStatus::Failed);
        info!(
            succeeded,
            failed,
            cancelled,
            total_tokens = result.total_tokens(),
            duration_ms = result.total_duration.as_millis() as u64,
            "chain finished"
        );
        emit(
            &self.event_handler,
            Event::ChainEnd {
                succeeded,
                failed,
                cancelled,
                duration_ms: result.total_duration.as_millis() as u64,
            },
        );
        Ok(result)
    }

    /// Resolve every distinct model the enabled steps request.
    /// Returns requested id → id that will serve.
    async fn preflight(&self, spec: &ChainSpec) -> Result<HashMap<Option<String>, String>> {
        let mut resolved = HashMap::new();
        for step in spec.steps.iter().filter(|s| s.enabled) {
            let requested = spec.requested_model(step).map(str::to_string);
            if resolved.contains_key(&requested) {
                continue;
            }
            let adapter = self
                .orchestrator
                .resolve(requested.as_deref())
                .await
                .inspect_err(|e| warn!(step = step.order, error = %e, "model resolution failed, aborting chain"))?;
            resolved.insert(requested, adapter.model_id);
        }
        Ok(resolved)
    }

    async fn run_step(
        &self,
        planner: &StepPlanner<'_>,
        step: &RuleStep,
        request: &ChainRequest,
        ctx: &ExecutionContext,
        expected_model: Option<&str>,
    ) -> StepResult {
        let started = Instant::now();
        let mut result = StepResult::not_run(step.order, &step.task_type, StepStatus::Failed);
        let input_text = planner.input_text(step, ctx);
        result.input_text = input_text.clone();

        self.phase(step, StepPhase::ResolvingParams);
        let scope = ResolutionScope {
            user_inputs: &request.user_inputs,
            novel_id: request.novel_id.as_deref(),
            context: ctx,
        };
        let params = match planner.resolve_params(step, &input_text, scope).await {
            Ok(params) => params,
            Err(e) => return self.fail(result, StepPhase::ResolvingParams, &e, started),
        };

        self.phase(step, StepPhase::BuildingPrompt);
        let prompt = match planner.build_prompt(step, &params) {
            Ok(prompt) => prompt,
            Err(e) => return self.fail(result, StepPhase::BuildingPrompt, &e, started),
        };
        let requested = planner.spec.requested_model(step);
        result.diagnostics.estimated_prompt_tokens = estimate_prompt(
            self.estimator.as_ref(),
            &prompt,
            expected_model.or(requested).unwrap_or_default(),
        );

        self.phase(step, StepPhase::InvokingLlm);
        let generate = GenerateRequest {
            model_id: requested.map(str::to_string),
            prompt: prompt.prompt,
            system_prompt: Some(prompt.system),
            json_mode: prompt.json_mode,
            temperature: Some(planner.temperature(step)),
            max_tokens: Some(planner.max_tokens(step)),
            overrides: Map::new(),
        };
        let response = match self.orchestrator.generate(generate).await {
            Ok(response) => response,
            Err(e) => return self.fail(result, StepPhase::InvokingLlm, &e, started),
        };

        result.prompt_tokens = response.prompt_tokens;
        result.completion_tokens = response.completion_tokens;
        result.total_tokens = response.total_tokens;
        result.diagnostics.usage_estimated = response.usage_estimated;
        result.diagnostics.safety_fallback = expected_model
            .is_some_and(|expected| expected != response.model_id_used)
            && planner.config.safety_fallback_model() == Some(response.model_id_used.as_str());
        result.diagnostics.model_id = Some(response.model_id_used.clone());

        if let Some(err) = &response.error {
            return self.fail(
                result,
                StepPhase::InvokingLlm,
                &ChainError::Provider(err.clone()),
                started,
            );
        }

        self.phase(step, StepPhase::PostProcessing);
        let outcome = apply_rules(&step.post_processing_rules, &response.text);
        result.diagnostics.post_processing = outcome.applied;
        result.diagnostics.post_processing_error = outcome.errors.first().map(|e| e.to_string());
        result
            .errors
            .extend(outcome.errors.iter().map(StepError::from));

        result.output_text = Some(outcome.text);
        result.structured_output = outcome.structured;
        result.status = StepStatus::Succeeded;
        result.duration = started.elapsed();
        self.phase(step, StepPhase::Succeeded);
        debug!(
            step = step.order,
            model_id = %response.model_id_used,
            total_tokens = result.total_tokens,
            "step succeeded"
        );
        result
    }

    fn fail(
        &self,
        mut result: StepResult,
        phase: StepPhase,
        error: &ChainError,
        started: Instant,
    ) -> StepResult {
        warn!(step = result.order, ?phase, error = %error, "step failed");
        result.status = StepStatus::Failed;
        result.failed_phase = Some(phase);
        result.errors.insert(0, StepError::from(error));
        result.duration = started.elapsed();
        emit(
            &self.event_handler,
            Event::StepPhase {
                order: result.order,
                phase: StepPhase::Failed,
            },
        );
        result
    }

    fn phase(&self, step: &RuleStep, phase: StepPhase) {
        emit(
            &self.event_handler,
            Event::StepPhase {
                order: step.order,
                phase,
            },
        );
    }
}

/// Publish a step's output variable. A failed step leaves an existing value
/// alone and defines a missing one as `null`.
fn store_output(ctx: &mut ExecutionContext, step: &RuleStep, result: &StepResult) {
    let Some(name) = step.output_variable_name.as_deref().filter(|n| !n.is_empty()) else {
        return;
    };
    if !result.succeeded() {
        ctx.ensure_variable(name);
        return;
    }
    let value = match (&result.structured_output, &result.output_text) {
        (Some(structured), _) => structured.clone(),
        (None, Some(text)) => Value::String(text.clone()),
        (None, None) => Value::Null,
    };
    ctx.set_variable(name, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockAdapter, MockReply, ProviderAdapter, ProviderRegistry};
    use crate::config::{EngineConfig, ModelConfig};
    use crate::error::{ErrorKind, ProviderError};
    use crate::events::FnEventHandler;
    use crate::params::ParameterDefinition;
    use crate::postprocess::PostProcessingRule;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    fn executor_with(mock: Arc<MockAdapter>) -> ChainExecutor {
        let registry = ProviderRegistry::empty().register("mock", move |_, _| {
            Ok(mock.clone() as Arc<dyn ProviderAdapter>)
        });
        let config = EngineConfig::default()
            .with_model(ModelConfig::new("m", "mock", "mock-1"))
            .with_default_model("m");
        ChainExecutor::new(Arc::new(Orchestrator::with_registry(Arc::new(config), registry)))
    }

    #[tokio::test]
    async fn output_variables_feed_later_parameters() {
        let mock = Arc::new(MockAdapter::new(vec![
            MockReply::text("```json\n{\"lead\": \"Mei\"}\n```"),
            MockReply::text("Mei's story"),
        ]));
        let executor = executor_with(mock.clone());
        let spec = ChainSpec::new(vec![
            RuleStep::new(1, "extract_characters")
                .with_rule(PostProcessingRule::ExtractJsonFromMarkdown)
                .with_output_variable("cast"),
            RuleStep::new(2, "custom")
                .with_template("Write about {hero}.")
                .with_parameter(
                    "hero",
                    ParameterDefinition::previous_step_output("cast.lead").required(),
                ),
        ]);

        let result = executor.execute(&spec, ChainRequest::new("text")).await.unwrap();
        assert_eq!(result.count(StepStatus::Succeeded), 2);
        assert_eq!(result.step(1).unwrap().structured_output, Some(serde_json::json!({"lead": "Mei"})));
        assert_eq!(result.final_output, "Mei's story");
        assert!(mock.requests()[1].prompt.contains("<<<BEGIN hero>>>\nMei\n<<<END hero>>>"));
        assert!(mock.requests()[0].json_mode);
    }

    #[tokio::test]
    async fn failed_step_defines_missing_variable_as_null() {
        let mock = Arc::new(MockAdapter::new(vec![
            MockReply::Error(ProviderError::Connection("reset".into())),
            MockReply::text("fine"),
        ]));
        let executor = executor_with(mock);
        let spec = ChainSpec::new(vec![
            RuleStep::new(1, "summarize").with_output_variable("summary"),
            RuleStep::new(2, "custom")
                .with_template("Use {s}")
                .with_parameter("s", ParameterDefinition::previous_step_output("summary")),
        ]);
        let result = executor.execute(&spec, ChainRequest::new("text")).await.unwrap();
        let first = result.step(1).unwrap();
        assert_eq!(first.status, StepStatus::Failed);
        assert_eq!(first.failed_phase, Some(StepPhase::InvokingLlm));
        assert_eq!(first.failure().unwrap().kind, ErrorKind::Connection);
        assert!(result.step(2).unwrap().succeeded());
    }

    #[tokio::test]
    async fn parameter_failure_fails_only_that_step() {
        let mock = Arc::new(MockAdapter::fixed("ok"));
        let executor = executor_with(mock.clone());
        let spec = ChainSpec::new(vec![
            RuleStep::new(1, "translate"),
            RuleStep::new(2, "summarize"),
        ]);
        let result = executor.execute(&spec, ChainRequest::new("text")).await.unwrap();
        let first = result.step(1).unwrap();
        // translate needs {target_language}, which no parameter supplies
        assert_eq!(first.failed_phase, Some(StepPhase::BuildingPrompt));
        assert_eq!(first.failure().unwrap().kind, ErrorKind::PromptBuild);
        assert!(result.step(2).unwrap().succeeded());
        assert_eq!(mock.call_count(), 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].order, 1);
    }

    #[tokio::test]
    async fn post_processing_failure_is_non_fatal() {
        let mock = Arc::new(MockAdapter::fixed("plain prose"));
        let executor = executor_with(mock);
        let spec = ChainSpec::new(vec![RuleStep::new(1, "summarize")
            .with_rule(PostProcessingRule::ParseJson)]);
        let result = executor.execute(&spec, ChainRequest::new("text")).await.unwrap();
        let step = result.step(1).unwrap();
        assert!(step.succeeded());
        assert_eq!(step.output_text.as_deref(), Some("plain prose"));
        assert_eq!(step.errors[0].kind, ErrorKind::PostProcessing);
        assert!(!step.diagnostics.ok());
    }

    #[tokio::test]
    async fn unresolvable_model_aborts_before_any_step() {
        let mock = Arc::new(MockAdapter::fixed("never"));
        let executor = executor_with(mock.clone());
        let spec = ChainSpec::new(vec![
            RuleStep::new(1, "summarize"),
            RuleStep::new(2, "summarize").with_model("ghost"),
        ]);
        let err = executor.execute(&spec, ChainRequest::new("x")).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_between_steps() {
        let flag = Arc::new(AtomicBool::new(false));
        let trigger = flag.clone();
        let mock = Arc::new(MockAdapter::fixed("done"));
        let executor = executor_with(mock.clone()).with_event_handler(Arc::new(FnEventHandler(
            move |event: Event| {
                if let Event::StepEnd { order: 1, .. } = event {
                    trigger.store(true, Ordering::Relaxed);
                }
            },
        )));
        let spec = ChainSpec::new(vec![
            RuleStep::new(1, "summarize"),
            RuleStep::new(2, "summarize"),
            RuleStep::new(3, "summarize").disabled(),
        ]);
        let result = executor
            .execute(&spec, ChainRequest::new("x").with_cancellation(flag))
            .await
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.step(1).unwrap().status, StepStatus::Succeeded);
        assert_eq!(result.step(2).unwrap().status, StepStatus::Cancelled);
        assert_eq!(result.step(2).unwrap().errors[0].kind, ErrorKind::Cancelled);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].order, 2);
        assert_eq!(result.step(3).unwrap().status, StepStatus::Skipped);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(result.final_output, "done");
    }

    #[tokio::test]
    async fn events_follow_the_state_machine() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let executor = executor_with(Arc::new(MockAdapter::fixed("ok"))).with_event_handler(
            Arc::new(FnEventHandler(move |e: Event| sink.lock().unwrap().push(e))),
        );
        let spec = ChainSpec::new(vec![RuleStep::new(1, "summarize")]);
        executor.execute(&spec, ChainRequest::new("x")).await.unwrap();

        let phases: Vec<StepPhase> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::StepPhase { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                StepPhase::ResolvingParams,
                StepPhase::BuildingPrompt,
                StepPhase::InvokingLlm,
                StepPhase::PostProcessing,
                StepPhase::Succeeded
            ]
        );
        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(Event::ChainStart { steps: 1, enabled: 1 })));
        assert!(matches!(events.last(), Some(Event::ChainEnd { succeeded: 1, failed: 0, .. })));
    }

    #[tokio::test]
    async fn precedence_reaches_the_adapter() {
        let mock = Arc::new(MockAdapter::fixed("ok"));
        let executor = executor_with(mock.clone());
        let spec = ChainSpec::new(vec![
            RuleStep::new(1, "summarize").with_max_tokens(64).with_temperature(0.1),
            RuleStep::new(2, "summarize"),
        ])
        .with_default_max_tokens(300);
        executor.execute(&spec, ChainRequest::new("x")).await.unwrap();
        let requests = mock.requests();
        assert_eq!(requests[0].max_tokens, 64);
        assert_eq!(requests[0].temperature, 0.1);
        assert_eq!(requests[1].max_tokens, 300);
        assert_eq!(requests[1].temperature, 0.7);
        assert!(requests[0]
            .system_prompt
            .as_deref()
            .is_some_and(|s| s.starts_with("You are a careful literary assistant.")));
    }
}
