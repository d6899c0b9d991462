//! Model resolution, adapter caching and fallback.
//!
//! The [`Orchestrator`] is the only place that instantiates provider
//! adapters. It is constructed explicitly and shared behind an `Arc`; there
//! is no global instance.
//!
//! ## Resolution
//!
//! ```text
//! requested id ──(empty)──► default id ──(empty)──► Config error
//!      │
//!      ▼
//!  cached? ──yes──► adapter
//!      │no
//!      ▼
//!  configured, enabled, provider enabled, constructor ok? ──yes──► cache + adapter
//!      │no
//!      ▼
//!  fallback id unset or == requested ──► ExhaustedFallback
//!      │
//!      ▼
//!  same checks for fallback (once, never recursively) ──no──► NoProviderAvailable
//! ```

use crate::backend::{ConnectionTest, LlmRequest, LlmResponse, ProviderAdapter, ProviderRegistry};
use crate::config::EngineConfig;
use crate::error::{ChainError, Result};
use crate::events::{emit, Event, EventHandler};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type AdapterCell = Arc<OnceCell<Arc<dyn ProviderAdapter>>>;

/// One call to [`Orchestrator::generate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateRequest {
    /// Logical model id; the configured default when `None` or empty.
    pub model_id: Option<String>,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub json_mode: bool,
    /// Falls back to `EngineConfig::default_temperature`.
    pub temperature: Option<f64>,
    /// Falls back to `EngineConfig::default_max_tokens`.
    pub max_tokens: Option<u32>,
    pub overrides: Map<String, Value>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
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

    pub fn with_overrides(mut self, overrides: Map<String, Value>) -> Self {
        self.overrides = overrides;
        self
    }
}

/// An adapter together with the logical id it was resolved under.
#[derive(Clone)]
pub struct ResolvedAdapter {
    /// The id that actually served: the requested one or the fallback.
    pub model_id: String,
    pub adapter: Arc<dyn ProviderAdapter>,
    /// Whether the fallback model was substituted.
    pub fell_back: bool,
}

impl std::fmt::Debug for ResolvedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAdapter")
            .field("model_id", &self.model_id)
            .field("adapter", &self.adapter.name())
            .field("fell_back", &self.fell_back)
            .finish()
    }
}

/// Resolves logical model ids to cached adapters and invokes them.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use novel_rulechain::config::EngineConfig;
/// use novel_rulechain::orchestrator::{GenerateRequest, Orchestrator};
///
/// # async fn run() -> novel_rulechain::error::Result<()> {
/// let config = Arc::new(EngineConfig::load("engine.toml")?);
/// let orchestrator = Orchestrator::new(config);
/// let response = orchestrator
///     .generate(GenerateRequest::new("Summarize: ...").with_max_tokens(256))
///     .await?;
/// println!("{} ({} tokens)", response.text, response.total_tokens);
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    config: Arc<EngineConfig>,
    registry: ProviderRegistry,
    cache: Mutex<HashMap<String, AdapterCell>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("cached_models", &self.cached_models())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

impl Orchestrator {
    /// An orchestrator using every adapter compiled into this build.
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self::with_registry(config, ProviderRegistry::builtin())
    }

    pub fn with_registry(config: Arc<EngineConfig>, registry: ProviderRegistry) -> Self {
        Self {
            config,
            registry,
            cache: Mutex::new(HashMap::new()),
            event_handler: None,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Logical ids with an instantiated adapter, sorted.
    pub fn cached_models(&self) -> Vec<String> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<String> = cache
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Resolve a logical model id to an adapter, applying the single-hop
    /// fallback.
    ///
    /// # Errors
    ///
    /// - [`ChainError::Config`] when no id is given and no default is configured.
    /// - [`ChainError::ExhaustedFallback`] when the model is unusable and the
    ///   fallback is unset or is the same model.
    /// - [`ChainError::NoProviderAvailable`] when the fallback is unusable too.
    pub async fn resolve(&self, model_id: Option<&str>) -> Result<ResolvedAdapter> {
        let requested = self.config.requested_model_id(model_id)?;

        let reason = match self.instantiate(&requested).await {
            Ok(adapter) => {
                return Ok(ResolvedAdapter {
                    model_id: requested,
                    adapter,
                    fell_back: false,
                })
            }
            Err(reason) => reason,
        };

        let fallback = match self.config.fallback_model() {
            Some(fallback) if fallback != requested => fallback.to_string(),
            _ => {
                warn!(model_id = %requested, %reason, "model unavailable and no usable fallback");
                return Err(ChainError::ExhaustedFallback {
                    model_id: requested,
                    reason,
                });
            }
        };

        match self.instantiate(&fallback).await {
            Ok(adapter) => {
                warn!(requested = %requested, fallback = %fallback, %reason, "falling back to default model");
                emit(
                    &self.event_handler,
                    Event::Fallback {
                        requested,
                        used: fallback.clone(),
                    },
                );
                Ok(ResolvedAdapter {
                    model_id: fallback,
                    adapter,
                    fell_back: true,
                })
            }
            Err(fallback_reason) => Err(ChainError::NoProviderAvailable {
                requested,
                fallback,
                reason: fallback_reason,
            }),
        }
    }

    /// Generate a completion.
    ///
    /// Adapter failures never surface as `Err`: a content-safety block
    /// becomes a response with `is_blocked_by_safety = true`, and any other
    /// provider error a response with `error` set. Only resolution failures
    /// (see [`resolve`](Self::resolve)) are returned as errors.
    ///
    /// When the call is blocked and a distinct `safety_fallback_model_id` is
    /// configured, that model gets exactly one attempt. Its response is used
    /// only if it succeeds; otherwise the original blocked response is kept.
    pub async fn generate(&self, request: GenerateRequest) -> Result<LlmResponse> {
        let resolved = self.resolve(request.model_id.as_deref()).await?;
        let llm_request = LlmRequest {
            prompt: request.prompt,
            system_prompt: request.system_prompt,
            json_mode: request.json_mode,
            temperature: request
                .temperature
                .unwrap_or(self.config.default_temperature),
            max_tokens: request.max_tokens.unwrap_or(self.config.default_max_tokens),
            overrides: request.overrides,
        };

        let response = self
            .dispatch(&resolved.model_id, &resolved.adapter, &llm_request)
            .await;
        if !response.is_blocked_by_safety {
            return Ok(response);
        }

        let Some(safety_id) = self
            .config
            .safety_fallback_model()
            .filter(|id| *id != resolved.model_id)
        else {
            return Ok(response);
        };

        let adapter = match self.instantiate(safety_id).await {
            Ok(adapter) => adapter,
            Err(reason) => {
                warn!(model_id = %safety_id, %reason, "safety fallback model unavailable");
                return Ok(response);
            }
        };

        info!(blocked = %resolved.model_id, fallback = %safety_id, "retrying blocked call on safety fallback model");
        let retry = self.dispatch(safety_id, &adapter, &llm_request).await;
        let ok = retry.is_ok();
        emit(
            &self.event_handler,
            Event::SafetyFallback {
                blocked: resolved.model_id.clone(),
                used: safety_id.to_string(),
                ok,
            },
        );
        Ok(if ok { retry } else { response })
    }

    /// Probe the adapter a logical id resolves to.
    ///
    /// `model_override` is a vendor model name to probe instead of the
    /// configured one.
    pub async fn test_connection(
        &self,
        model_id: Option<&str>,
        model_override: Option<&str>,
    ) -> Result<ConnectionTest> {
        let resolved = self.resolve(model_id).await?;
        let mut test = resolved.adapter.test_connection(model_override).await;
        if let Value::Object(ref mut details) = test.details {
            details.insert("logical_id".into(), Value::from(resolved.model_id));
            details.insert("fell_back".into(), Value::from(resolved.fell_back));
        }
        Ok(test)
    }

    /// Fetch or construct the adapter for one logical id, without fallback.
    ///
    /// Only configured, enabled models get a cache slot. The map lock is
    /// held only to fetch the per-id cell; construction runs inside the cell
    /// so concurrent resolutions of one id build a single adapter while other
    /// ids proceed independently. A failed construction leaves the cell empty.
    async fn instantiate(&self, model_id: &str) -> std::result::Result<Arc<dyn ProviderAdapter>, String> {
        let model = self.config.usable_model(model_id)?;
        let cell = {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            cache.entry(model_id.to_string()).or_default().clone()
        };

        let adapter = cell
            .get_or_try_init(|| async {
                let provider = self.config.provider(&model.provider_tag);
                let adapter = self
                    .registry
                    .construct(model, &provider)
                    .map_err(|e| format!("cannot instantiate '{model_id}': {e}"))?;
                debug!(model_id, provider = adapter.name(), "adapter instantiated");
                Ok::<_, String>(adapter)
            })
            .await?;
        Ok(adapter.clone())
    }

    async fn dispatch(
        &self,
        model_id: &str,
        adapter: &Arc<dyn ProviderAdapter>,
        request: &LlmRequest,
    ) -> LlmResponse {
        let supports_system = adapter.capabilities().supports_system_prompt
            && self
                .config
                .model(model_id)
                .map_or(true, |m| m.supports_system_prompt);
        let folded;
        let request = if supports_system || request.system().is_none() {
            request
        } else {
            folded = request.folded();
            &folded
        };

        match adapter.generate(request).await {
            Ok(response) => {
                debug!(
                    model_id,
                    prompt_tokens = response.prompt_tokens,
                    completion_tokens = response.completion_tokens,
                    "generation finished"
                );
                response.with_model(model_id)
            }
            Err(err) => {
                warn!(model_id, error = %err, kind = ?err.kind(), "generation failed");
                LlmResponse::from_error(model_id, err)
            }
        }
    }
}
