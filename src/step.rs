//! Declarative chain specification.
//!
//! A [`ChainSpec`] is the wire contract produced by whatever stores rule
//! chains: an ordered list of [`RuleStep`]s plus chain-level defaults. It is
//! read-only during execution.

use crate::error::{ChainError, Result};
use crate::params::ParameterDefinition;
use crate::postprocess::PostProcessingRule;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Where a step takes its main text input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputSource {
    /// The chain's original input.
    #[default]
    Original,
    /// The output of the most recent successful step.
    PreviousStep,
}

/// Requested shape of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Text,
    Markdown,
    Json,
}

/// Soft requirements rendered into the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConstraints {
    pub max_length: Option<u32>,
    pub min_length: Option<u32>,
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub sentiment: Option<String>,
    pub style_hints: Vec<String>,
    pub output_format: Option<OutputFormat>,
}

impl GenerationConstraints {
    /// Field-wise merge: values set here win, unset ones come from `defaults`.
    pub fn merged_over(&self, defaults: &GenerationConstraints) -> GenerationConstraints {
        fn pick<T: Clone>(own: &[T], fallback: &[T]) -> Vec<T> {
            let chosen = if own.is_empty() { fallback } else { own };
            chosen.to_vec()
        }
        GenerationConstraints {
            max_length: self.max_length.or(defaults.max_length),
            min_length: self.min_length.or(defaults.min_length),
            include_keywords: pick(&self.include_keywords, &defaults.include_keywords),
            exclude_keywords: pick(&self.exclude_keywords, &defaults.exclude_keywords),
            sentiment: self.sentiment.clone().or_else(|| defaults.sentiment.clone()),
            style_hints: pick(&self.style_hints, &defaults.style_hints),
            output_format: self.output_format.or(defaults.output_format),
        }
    }
}

/// One unit of work in a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStep {
    /// Position in the chain; unique and contiguous.
    pub order: u32,
    /// Key into the [`TaskCatalog`](crate::prompt::TaskCatalog).
    pub task_type: String,
    #[serde(default)]
    pub input_source: InputSource,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterDefinition>,
    /// Logical model id overriding the chain default.
    #[serde(default)]
    pub model_id: Option<String>,
    /// Template overriding the catalog's template for `task_type`.
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub generation_constraints: Option<GenerationConstraints>,
    #[serde(default)]
    pub post_processing_rules: Vec<PostProcessingRule>,
    /// Variable the step's output is stored under for later steps.
    #[serde(default)]
    pub output_variable_name: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleStep {
    pub fn new(order: u32, task_type: impl Into<String>) -> Self {
        Self {
            order,
            task_type: task_type.into(),
            input_source: InputSource::Original,
            parameters: BTreeMap::new(),
            model_id: None,
            prompt_template: None,
            generation_constraints: None,
            post_processing_rules: Vec::new(),
            output_variable_name: None,
            temperature: None,
            max_tokens: None,
            enabled: true,
        }
    }

    pub fn from_previous_step(mut self) -> Self {
        self.input_source = InputSource::PreviousStep;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, definition: ParameterDefinition) -> Self {
        self.parameters.insert(name.into(), definition);
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }

    pub fn with_constraints(mut self, constraints: GenerationConstraints) -> Self {
        self.generation_constraints = Some(constraints);
        self
    }

    pub fn with_rule(mut self, rule: PostProcessingRule) -> Self {
        self.post_processing_rules.push(rule);
        self
    }

    pub fn with_output_variable(mut self, name: impl Into<String>) -> Self {
        self.output_variable_name = Some(name.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A rule chain: ordered steps plus chain-level defaults.
///
/// # Example
///
/// ```
/// use novel_rulechain::step::{ChainSpec, RuleStep};
///
/// let spec = ChainSpec::new(vec![
///     RuleStep::new(1, "summarize"),
///     RuleStep::new(2, "translate").from_previous_step(),
/// ])
/// .with_default_model("fast");
/// assert!(spec.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub steps: Vec<RuleStep>,
    #[serde(default)]
    pub default_model_id: Option<String>,
    #[serde(default)]
    pub default_constraints: Option<GenerationConstraints>,
    #[serde(default)]
    pub default_temperature: Option<f64>,
    #[serde(default)]
    pub default_max_tokens: Option<u32>,
}

impl ChainSpec {
    pub fn new(steps: Vec<RuleStep>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let spec: ChainSpec = serde_json::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let spec: ChainSpec = serde_yaml::from_str(text)
            .map_err(|e| ChainError::Config(format!("invalid YAML chain spec: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_default_model(mut self, model_id: impl Into<String>) -> Self {
        self.default_model_id = Some(model_id.into());
        self
    }

    pub fn with_default_constraints(mut self, constraints: GenerationConstraints) -> Self {
        self.default_constraints = Some(constraints);
        self
    }

    pub fn with_default_max_tokens(mut self, max_tokens: u32) -> Self {
        self.default_max_tokens = Some(max_tokens);
        self
    }

    pub fn with_default_temperature(mut self, temperature: f64) -> Self {
        self.default_temperature = Some(temperature);
        self
    }

    /// Steps must exist and their orders must be unique and contiguous.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ChainError::Config("chain has no steps".into()));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.order) {
                return Err(ChainError::Config(format!(
                    "duplicate step order {}",
                    step.order
                )));
            }
        }
        let min = self.steps.iter().map(|s| s.order).min().unwrap_or(0);
        let max = self.steps.iter().map(|s| s.order).max().unwrap_or(0);
        if (max - min) as usize + 1 != self.steps.len() {
            return Err(ChainError::Config(format!(
                "step orders must be contiguous (found {} steps spanning {min}..={max})",
                self.steps.len()
            )));
        }
        Ok(())
    }

    /// Steps sorted by order.
    pub fn ordered_steps(&self) -> Vec<&RuleStep> {
        let mut steps: Vec<&RuleStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }

    /// The logical model id a step requests: its own, else the chain
    /// default. `None` means the engine default applies.
    pub fn requested_model<'a>(&'a self, step: &'a RuleStep) -> Option<&'a str> {
        step.model_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| {
                self.default_model_id
                    .as_deref()
                    .filter(|id| !id.trim().is_empty())
            })
    }

    /// Constraints for a step merged over the chain defaults.
    pub fn constraints_for(&self, step: &RuleStep) -> Option<GenerationConstraints> {
        match (&step.generation_constraints, &self.default_constraints) {
            (Some(own), Some(defaults)) => Some(own.merged_over(defaults)),
            (Some(own), None) => Some(own.clone()),
            (None, defaults) => defaults.clone(),
        }
    }

    /// Step override, then chain override, then `engine_default`.
    pub fn max_tokens_for(&self, step: &RuleStep, engine_default: u32) -> u32 {
        step.max_tokens
            .or(self.default_max_tokens)
            .unwrap_or(engine_default)
    }

    pub fn temperature_for(&self, step: &RuleStep, engine_default: f64) -> f64 {
        step.temperature
            .or(self.default_temperature)
            .unwrap_or(engine_default)
    }
}
