//! # Novel Rule Chain
//!
//! A rule-chain execution engine for novel analysis: an ordered list of
//! declarative steps becomes a sequence of LLM calls against interchangeable
//! providers.
//!
//! Each step resolves its parameters (literals, user input, earlier step
//! outputs, novel data, nested definitions), builds a prompt in which every
//! untrusted value is sanitized and delimiter-wrapped, calls a model through
//! the [`Orchestrator`] (with single-hop fallback and an optional safety
//! fallback), and post-processes the reply. A failing step is recorded and
//! the chain carries on.
//!
//! ## Core Concepts
//!
//! - **[`ChainSpec`] / [`RuleStep`]**: the declarative chain.
//! - **[`ChainExecutor`]**: runs a chain and returns an [`ExecutionResult`].
//! - **[`Orchestrator`]**: model resolution, adapter caching, fallback.
//! - **[`ProviderAdapter`]**: one vendor API behind a normalized
//!   [`LlmRequest`]/[`LlmResponse`] contract.
//! - **[`DryRunEstimator`]**: token and cost estimate without any model call.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use novel_rulechain::{ChainExecutor, ChainRequest, ChainSpec, EngineConfig, Orchestrator, RuleStep};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(EngineConfig::load("engine.toml")?);
//!     let executor = ChainExecutor::new(Arc::new(Orchestrator::new(config)));
//!
//!     let spec = ChainSpec::new(vec![
//!         RuleStep::new(1, "summarize"),
//!         RuleStep::new(2, "analyze_style").from_previous_step(),
//!     ]);
//!     let result = executor.execute(&spec, ChainRequest::new("Chapter one...")).await?;
//!     for step in &result.step_results {
//!         println!("{} {:?}", step.order, step.status);
//!     }
//!     println!("{}", result.final_output);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod diagnostics;
pub mod dry_run;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod executor;
pub mod orchestrator;
pub mod output_parser;
pub mod params;
mod plan;
pub mod postprocess;
pub mod prompt;
pub mod step;
pub mod tokens;
pub mod types;

pub use backend::{
    BackoffConfig, Capabilities, LlmRequest, LlmResponse, MockAdapter, MockReply, ProviderAdapter,
    ProviderRegistry,
};
pub use config::{EngineConfig, ModelConfig, ProviderConfig};
pub use diagnostics::StepDiagnostics;
pub use dry_run::{CostEstimate, CostTier, DryRunEstimator, StepEstimate};
pub use error::{ChainError, ErrorKind, ProviderError, Result, StepError};
pub use events::{Event, EventHandler, FnEventHandler};
pub use exec_ctx::ExecutionContext;
pub use executor::{ChainExecutor, ChainRequest};
pub use orchestrator::{GenerateRequest, Orchestrator};
pub use params::{NovelDataLookup, NovelDataRequest, ParamKind, ParameterDefinition};
pub use plan::INPUT_PARAM;
pub use postprocess::PostProcessingRule;
pub use prompt::{PromptBuilder, Sanitizer, TaskCatalog, TaskTemplate};
pub use step::{ChainSpec, GenerationConstraints, InputSource, OutputFormat, RuleStep};
pub use tokens::{HeuristicTokenEstimator, TokenEstimator};
pub use types::{ExecutionResult, StepPhase, StepResult, StepStatus};
