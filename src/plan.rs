//! Step preparation shared by real execution and dry runs.
//!
//! Both walk the chain the same way: pick the step's input text, resolve its
//! parameters, build its prompt, and apply the max-tokens/temperature
//! precedence. Only what happens with the built prompt differs.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::exec_ctx::ExecutionContext;
use crate::params::{ParameterResolver, ResolutionScope};
use crate::prompt::{BuiltPrompt, PromptBuilder, TaskCatalog};
use crate::step::{ChainSpec, InputSource, RuleStep};
use crate::tokens::TokenEstimator;
use serde_json::Value;
use std::collections::BTreeMap;

/// Name under which a step's main text input is offered to its template.
pub const INPUT_PARAM: &str = "input";

pub(crate) struct StepPlanner<'a> {
    pub config: &'a EngineConfig,
    pub spec: &'a ChainSpec,
    pub resolver: &'a ParameterResolver,
    pub builder: &'a PromptBuilder,
    pub catalog: &'a TaskCatalog,
}

impl StepPlanner<'_> {
    /// `ORIGINAL` reads the chain input; `PREVIOUS_STEP` reads the most
    /// recent successful output, which is the chain input until one exists.
    pub fn input_text(&self, step: &RuleStep, ctx: &ExecutionContext) -> String {
        match step.input_source {
            InputSource::Original => ctx.original_input().to_string(),
            InputSource::PreviousStep => ctx.previous_output().to_string(),
        }
    }

    /// Resolve declared parameters and add the input text unless a parameter
    /// of the same name was declared.
    pub async fn resolve_params(
        &self,
        step: &RuleStep,
        input_text: &str,
        scope: ResolutionScope<'_>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut params = self.resolver.resolve(&step.parameters, scope).await?;
        params
            .entry(INPUT_PARAM.to_string())
            .or_insert_with(|| Value::String(input_text.to_string()));
        Ok(params)
    }

    pub fn build_prompt(
        &self,
        step: &RuleStep,
        params: &BTreeMap<String, Value>,
    ) -> Result<BuiltPrompt> {
        let task = self
            .catalog
            .select(&step.task_type, step.prompt_template.as_deref())?;
        let constraints = self.spec.constraints_for(step);
        self.builder.build(&task, params, constraints.as_ref())
    }

    pub fn max_tokens(&self, step: &RuleStep) -> u32 {
        self.spec
            .max_tokens_for(step, self.config.default_max_tokens)
    }

    pub fn temperature(&self, step: &RuleStep) -> f64 {
        self.spec
            .temperature_for(step, self.config.default_temperature)
    }
}

/// Estimated size of everything sent for a prompt.
pub(crate) fn estimate_prompt(
    estimator: &dyn TokenEstimator,
    prompt: &BuiltPrompt,
    model_id: &str,
) -> u32 {
    estimator.estimate(&format!("{}\n\n{}", prompt.system, prompt.prompt), model_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterDefinition;
    use crate::types::{StepResult, StepStatus};
    use serde_json::json;
    use std::collections::HashMap;

    fn planner_parts() -> (EngineConfig, ParameterResolver, PromptBuilder, TaskCatalog) {
        (
            EngineConfig::default(),
            ParameterResolver::default(),
            PromptBuilder::default(),
            TaskCatalog::builtin(),
        )
    }

    #[test]
    fn previous_step_input_falls_back_to_original() {
        let (config, resolver, builder, catalog) = planner_parts();
        let spec = ChainSpec::default();
        let planner = StepPlanner {
            config: &config,
            spec: &spec,
            resolver: &resolver,
            builder: &builder,
            catalog: &catalog,
        };
        let step = RuleStep::new(1, "translate").from_previous_step();
        let mut ctx = ExecutionContext::new("chapter");
        assert_eq!(planner.input_text(&step, &ctx), "chapter");

        let mut done = StepResult::not_run(1, "summarize", StepStatus::Succeeded);
        done.output_text = Some("summary".into());
        ctx.record(done);
        assert_eq!(planner.input_text(&step, &ctx), "summary");
        assert_eq!(planner.input_text(&RuleStep::new(2, "x"), &ctx), "chapter");
    }

    #[tokio::test]
    async fn declared_input_parameter_wins() {
        let (config, resolver, builder, catalog) = planner_parts();
        let spec = ChainSpec::default();
        let planner = StepPlanner {
            config: &config,
            spec: &spec,
            resolver: &resolver,
            builder: &builder,
            catalog: &catalog,
        };
        let ctx = ExecutionContext::new("orig");
        let inputs = HashMap::new();
        let scope = ResolutionScope {
            user_inputs: &inputs,
            novel_id: None,
            context: &ctx,
        };
        let step = RuleStep::new(1, "summarize")
            .with_parameter(INPUT_PARAM, ParameterDefinition::literal("declared"));
        let params = planner.resolve_params(&step, "orig", scope).await.unwrap();
        assert_eq!(params[INPUT_PARAM], json!("declared"));

        let built = planner.build_prompt(&step, &params).unwrap();
        assert!(built.prompt.contains("<<<BEGIN input>>>\ndeclared\n<<<END input>>>"));
        assert_eq!(planner.max_tokens(&step), 2048);
    }
}
