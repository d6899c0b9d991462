//! Static table of adapter constructors keyed by provider tag.
//!
//! Vendor adapters are compiled in (or out) through Cargo features; the
//! registry is an explicit value handed to the orchestrator, so tests can
//! build one containing only mocks.

use super::{LocalAdapter, ProviderAdapter};
use crate::config::{ModelConfig, ProviderConfig};
use crate::error::ProviderError;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds an adapter for one model. Missing credentials and similar
/// construction failures are reported as [`ProviderError`]s.
pub type AdapterConstructor = Arc<
    dyn Fn(&ModelConfig, &ProviderConfig) -> Result<Arc<dyn ProviderAdapter>, ProviderError>
        + Send
        + Sync,
>;

/// Provider tag → constructor.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use novel_rulechain::backend::{MockAdapter, ProviderAdapter, ProviderRegistry};
///
/// let registry = ProviderRegistry::builtin()
///     .register("mock", |_, _| Ok(Arc::new(MockAdapter::fixed("hi")) as Arc<dyn ProviderAdapter>));
/// assert!(registry.contains("local"));
/// assert!(registry.contains("mock"));
/// ```
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    constructors: HashMap<String, AdapterConstructor>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

impl ProviderRegistry {
    /// A registry with no providers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every adapter compiled into this build: `openai`, `anthropic` and
    /// `gemini` (feature-gated), plus `local` (alias `ollama`).
    pub fn builtin() -> Self {
        let registry = Self::empty()
            .register("local", |m, p| {
                Ok(Arc::new(LocalAdapter::from_config(m, p)?) as Arc<dyn ProviderAdapter>)
            })
            .register("ollama", |m, p| {
                Ok(Arc::new(LocalAdapter::from_config(m, p)?) as Arc<dyn ProviderAdapter>)
            });
        #[cfg(feature = "openai")]
        let registry = registry.register("openai", |m, p| {
            Ok(Arc::new(super::OpenAiAdapter::from_config(m, p)?) as Arc<dyn ProviderAdapter>)
        });
        #[cfg(feature = "anthropic")]
        let registry = registry.register("anthropic", |m, p| {
            Ok(Arc::new(super::AnthropicAdapter::from_config(m, p)?) as Arc<dyn ProviderAdapter>)
        });
        #[cfg(feature = "gemini")]
        let registry = registry.register("gemini", |m, p| {
            Ok(Arc::new(super::GeminiAdapter::from_config(m, p)?) as Arc<dyn ProviderAdapter>)
        });
        registry
    }

    /// Add or replace the constructor for `tag`.
    pub fn register<F>(mut self, tag: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&ModelConfig, &ProviderConfig) -> Result<Arc<dyn ProviderAdapter>, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(tag.into(), Arc::new(constructor));
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Instantiate the adapter for `model` using its provider tag.
    pub fn construct(
        &self,
        model: &ModelConfig,
        provider: &ProviderConfig,
    ) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        let constructor = self.constructors.get(&model.provider_tag).ok_or_else(|| {
            ProviderError::generic(format!(
                "no adapter registered for provider tag '{}' (compiled in: {})",
                model.provider_tag,
                self.tags().join(", ")
            ))
        })?;
        constructor(model, provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockAdapter;

    #[test]
    fn builtin_contains_compiled_adapters() {
        let registry = ProviderRegistry::builtin();
        assert!(registry.contains("local"));
        assert!(registry.contains("ollama"));
        #[cfg(feature = "openai")]
        assert!(registry.contains("openai"));
        #[cfg(feature = "gemini")]
        assert!(registry.contains("gemini"));
        assert!(!registry.contains("mock"));
    }

    #[test]
    fn construct_dispatches_on_provider_tag() {
        let registry = ProviderRegistry::empty().register("mock", |m, _| {
            Ok(Arc::new(MockAdapter::fixed("x").with_model(m.api_model_id.clone()))
                as Arc<dyn ProviderAdapter>)
        });
        let model = ModelConfig::new("m", "mock", "scripted-1");
        let adapter = registry.construct(&model, &ProviderConfig::default()).unwrap();
        assert_eq!(adapter.name(), "mock");
        assert_eq!(adapter.model_id(), "scripted-1");
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let registry = ProviderRegistry::empty();
        let model = ModelConfig::new("m", "nope", "x");
        let err = registry
            .construct(&model, &ProviderConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("'nope'"));
    }

    #[test]
    fn constructor_errors_propagate() {
        #[cfg(feature = "openai")]
        {
            let model = ModelConfig::new("gpt", "openai", "gpt-4o-mini");
            let result = ProviderRegistry::builtin().construct(&model, &ProviderConfig::default());
            assert!(matches!(result, Err(ProviderError::Auth(_))));
        }
    }
}
