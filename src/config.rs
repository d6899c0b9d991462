//! Process-wide engine configuration.
//!
//! [`EngineConfig`] is loaded once at startup (TOML, or YAML with the `yaml`
//! feature), optionally layered with API keys from the environment, and then
//! shared read-only behind an `Arc` by the orchestrator, the executor and the
//! dry-run estimator.

use crate::error::{ChainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// One configured model, addressed by its logical id.
#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// User-facing identifier, unique across the configuration.
    pub logical_id: String,
    #[serde(default)]
    pub display_name: String,
    /// Registry key of the adapter family (e.g. `"openai"`, `"anthropic"`).
    pub provider_tag: String,
    /// The vendor's own model name.
    pub api_model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_context_tokens")]
    pub max_context_tokens: u32,
    #[serde(default = "default_true")]
    pub supports_system_prompt: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("logical_id", &self.logical_id)
            .field("display_name", &self.display_name)
            .field("provider_tag", &self.provider_tag)
            .field("api_model_id", &self.api_model_id)
            .field("api_key", &self.api_key.as_deref().map(redact))
            .field("base_url", &self.base_url)
            .field("max_context_tokens", &self.max_context_tokens)
            .field("supports_system_prompt", &self.supports_system_prompt)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Mask an API key for `Debug` output, keeping at most six leading characters.
pub(crate) fn redact(key: &str) -> String {
    if key.chars().count() > 6 {
        format!("{}***", key.chars().take(6).collect::<String>())
    } else {
        "***".to_string()
    }
}

impl ModelConfig {
    /// Minimal config for a model; other fields take their defaults.
    pub fn new(
        logical_id: impl Into<String>,
        provider_tag: impl Into<String>,
        api_model_id: impl Into<String>,
    ) -> Self {
        let logical_id = logical_id.into();
        Self {
            display_name: logical_id.clone(),
            logical_id,
            provider_tag: provider_tag.into(),
            api_model_id: api_model_id.into(),
            api_key: None,
            base_url: None,
            max_context_tokens: default_context_tokens(),
            supports_system_prompt: true,
            enabled: true,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_max_context_tokens(mut self, tokens: u32) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    pub fn without_system_prompt(mut self) -> Self {
        self.supports_system_prompt = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Per-provider-tag settings shared by every model of that provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Transport retries for rate-limit and connection failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Vendor model name used by connection tests when none is given.
    #[serde(default)]
    pub default_test_model: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            default_test_model: None,
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Bounds applied by the [`Sanitizer`](crate::prompt::Sanitizer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizerConfig {
    /// Maximum characters of any single sanitized value, truncation marker included.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

/// Token totals separating the LOW / MEDIUM / HIGH cost tiers of a dry run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostThresholds {
    /// Totals up to and including this value are LOW.
    #[serde(default = "default_cost_low")]
    pub low: u64,
    /// Totals up to and including this value (and above `low`) are MEDIUM.
    #[serde(default = "default_cost_high")]
    pub high: u64,
}

impl Default for CostThresholds {
    fn default() -> Self {
        Self {
            low: default_cost_low(),
            high: default_cost_high(),
        }
    }
}

/// Engine-wide configuration.
///
/// # Example
///
/// ```
/// use novel_rulechain::config::EngineConfig;
///
/// let config = EngineConfig::from_toml_str(r#"
///     default_model_id = "fast"
///
///     [[models]]
///     logical_id = "fast"
///     provider_tag = "local"
///     api_model_id = "llama3.2:3b"
///     base_url = "http://localhost:11434"
/// "#).unwrap();
/// assert_eq!(config.model("fast").unwrap().api_model_id, "llama3.2:3b");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub default_model_id: Option<String>,
    /// Single-hop substitute when a requested model cannot be resolved.
    #[serde(default)]
    pub default_fallback_model_id: Option<String>,
    /// Independent substitute used once when a call is blocked by a safety filter.
    #[serde(default)]
    pub safety_fallback_model_id: Option<String>,
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
    #[serde(default)]
    pub cost: CostThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model_id: None,
            default_fallback_model_id: None,
            safety_fallback_model_id: None,
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            models: Vec::new(),
            providers: HashMap::new(),
            sanitizer: SanitizerConfig::default(),
            cost: CostThresholds::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)
            .map_err(|e| ChainError::Config(format!("invalid TOML configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(text)
            .map_err(|e| ChainError::Config(format!("invalid YAML configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file; the format follows the extension
    /// (`.toml`, or `.yaml`/`.yml` with the `yaml` feature).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ChainError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            #[cfg(feature = "yaml")]
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    /// Fill missing API keys from `<PROVIDER_TAG>_API_KEY` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    /// Keys already set in the file are left alone.
    pub fn apply_env(&mut self) {
        let _ = dotenvy::dotenv();
        for model in &mut self.models {
            if model.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
                continue;
            }
            let var = format!(
                "{}_API_KEY",
                model.provider_tag.to_ascii_uppercase().replace('-', "_")
            );
            if let Ok(key) = std::env::var(&var) {
                if !key.is_empty() {
                    tracing::debug!(model_id = %model.logical_id, env = %var, "API key taken from environment");
                    model.api_key = Some(key);
                }
            }
        }
    }

    /// Reject duplicate logical ids and dangling default references.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for model in &self.models {
            if model.logical_id.trim().is_empty() {
                return Err(ChainError::Config("model with empty logical_id".into()));
            }
            if !seen.insert(model.logical_id.as_str()) {
                return Err(ChainError::Config(format!(
                    "duplicate logical model id '{}'",
                    model.logical_id
                )));
            }
        }
        for (label, id) in [
            ("default_model_id", &self.default_model_id),
            ("default_fallback_model_id", &self.default_fallback_model_id),
            ("safety_fallback_model_id", &self.safety_fallback_model_id),
        ] {
            if let Some(id) = id.as_deref().filter(|id| !id.is_empty()) {
                if !seen.contains(id) {
                    return Err(ChainError::Config(format!(
                        "{label} refers to unknown model '{id}'"
                    )));
                }
            }
        }
        if self.cost.low > self.cost.high {
            return Err(ChainError::Config(format!(
                "cost thresholds out of order: low {} > high {}",
                self.cost.low, self.cost.high
            )));
        }
        Ok(())
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_provider(mut self, tag: impl Into<String>, provider: ProviderConfig) -> Self {
        self.providers.insert(tag.into(), provider);
        self
    }

    pub fn with_default_model(mut self, id: impl Into<String>) -> Self {
        self.default_model_id = Some(id.into());
        self
    }

    pub fn with_fallback_model(mut self, id: impl Into<String>) -> Self {
        self.default_fallback_model_id = Some(id.into());
        self
    }

    pub fn with_safety_fallback_model(mut self, id: impl Into<String>) -> Self {
        self.safety_fallback_model_id = Some(id.into());
        self
    }

    pub fn with_cost_thresholds(mut self, low: u64, high: u64) -> Self {
        self.cost = CostThresholds { low, high };
        self
    }

    /// Look up a model by logical id, regardless of enablement.
    pub fn model(&self, logical_id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.logical_id == logical_id)
    }

    /// Settings for a provider tag; tags without an entry get defaults.
    pub fn provider(&self, tag: &str) -> ProviderConfig {
        self.providers.get(tag).cloned().unwrap_or_default()
    }

    /// The process-wide default model id, treating an empty string as unset.
    pub fn default_model(&self) -> Option<&str> {
        non_empty(self.default_model_id.as_deref())
    }

    pub fn fallback_model(&self) -> Option<&str> {
        non_empty(self.default_fallback_model_id.as_deref())
    }

    pub fn safety_fallback_model(&self) -> Option<&str> {
        non_empty(self.safety_fallback_model_id.as_deref())
    }

    /// A model usable without instantiating anything: present, enabled, and
    /// its provider enabled. Returns the reason otherwise.
    pub fn usable_model(&self, logical_id: &str) -> std::result::Result<&ModelConfig, String> {
        let model = self
            .model(logical_id)
            .ok_or_else(|| format!("model '{logical_id}' is not configured"))?;
        if !model.enabled {
            return Err(format!("model '{logical_id}' is disabled"));
        }
        if !self.provider(&model.provider_tag).enabled {
            return Err(format!(
                "provider '{}' of model '{logical_id}' is disabled",
                model.provider_tag
            ));
        }
        Ok(model)
    }

    /// Substitute the default model when none was requested.
    pub fn requested_model_id(&self, requested: Option<&str>) -> Result<String> {
        non_empty(requested)
            .or_else(|| self.default_model())
            .map(str::to_string)
            .ok_or_else(|| {
                ChainError::Config("no model specified and no default configured".into())
            })
    }

    /// Pick the model a call would use, applying the single-hop fallback,
    /// without constructing an adapter. Used by the dry-run estimator.
    pub fn effective_model(&self, requested: Option<&str>) -> Result<&ModelConfig> {
        let id = self.requested_model_id(requested)?;
        match self.usable_model(&id) {
            Ok(model) => Ok(model),
            Err(reason) => match self.fallback_model() {
                Some(fallback) if fallback != id => {
                    self.usable_model(fallback)
                        .map_err(|fallback_reason| ChainError::NoProviderAvailable {
                            requested: id.clone(),
                            fallback: fallback.to_string(),
                            reason: fallback_reason,
                        })
                }
                _ => Err(ChainError::ExhaustedFallback { model_id: id, reason }),
            },
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn default_true() -> bool {
    true
}

fn default_context_tokens() -> u32 {
    8_192
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_chars() -> usize {
    20_000
}

fn default_cost_low() -> u64 {
    4_000
}

fn default_cost_high() -> u64 {
    16_000
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        default_model_id = "gpt"
        default_fallback_model_id = "local"

        [[models]]
        logical_id = "gpt"
        provider_tag = "openai"
        api_model_id = "gpt-4o-mini"
        max_context_tokens = 128000

        [[models]]
        logical_id = "local"
        provider_tag = "local"
        api_model_id = "qwen2.5:7b"
        base_url = "http://localhost:11434"
        supports_system_prompt = false

        [providers.openai]
        timeout_secs = 30
        max_retries = 4
    "#;

    #[test]
    fn parses_toml_with_defaults() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.default_model(), Some("gpt"));
        assert_eq!(config.default_temperature, 0.7);
        assert_eq!(config.default_max_tokens, 2048);
        assert_eq!(config.sanitizer.max_chars, 20_000);

        let gpt = config.model("gpt").unwrap();
        assert!(gpt.enabled);
        assert!(gpt.supports_system_prompt);
        assert_eq!(gpt.max_context_tokens, 128_000);
        assert!(!config.model("local").unwrap().supports_system_prompt);

        let openai = config.provider("openai");
        assert_eq!(openai.timeout(), Duration::from_secs(30));
        assert_eq!(openai.max_retries, 4);
        // unknown tags get defaults
        assert_eq!(config.provider("gemini").max_retries, 2);
    }

    #[test]
    fn rejects_duplicate_logical_ids() {
        let config = EngineConfig::default()
            .with_model(ModelConfig::new("a", "openai", "x"))
            .with_model(ModelConfig::new("a", "local", "y"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_unknown_default() {
        let config = EngineConfig::default()
            .with_model(ModelConfig::new("a", "openai", "x"))
            .with_default_model("missing");
        assert!(matches!(config.validate(), Err(ChainError::Config(_))));
    }

    #[test]
    fn requested_model_substitutes_default() {
        let config = EngineConfig::default()
            .with_model(ModelConfig::new("a", "openai", "x"))
            .with_default_model("a");
        assert_eq!(config.requested_model_id(None).unwrap(), "a");
        assert_eq!(config.requested_model_id(Some("")).unwrap(), "a");
        assert_eq!(config.requested_model_id(Some("b")).unwrap(), "b");

        let bare = EngineConfig::default();
        let err = bare.requested_model_id(None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: no model specified and no default configured"
        );
    }

    #[test]
    fn effective_model_applies_single_hop_fallback() {
        let config = EngineConfig::default()
            .with_model(ModelConfig::new("primary", "openai", "x").disabled())
            .with_model(ModelConfig::new("backup", "local", "y"))
            .with_fallback_model("backup");
        assert_eq!(
            config.effective_model(Some("primary")).unwrap().logical_id,
            "backup"
        );

        let self_fallback = EngineConfig::default()
            .with_model(ModelConfig::new("primary", "openai", "x").disabled())
            .with_fallback_model("primary");
        assert!(matches!(
            self_fallback.effective_model(Some("primary")),
            Err(ChainError::ExhaustedFallback { .. })
        ));
    }

    #[test]
    fn disabled_provider_makes_model_unusable() {
        let config = EngineConfig::default()
            .with_model(ModelConfig::new("a", "openai", "x"))
            .with_provider(
                "openai",
                ProviderConfig {
                    enabled: false,
                    ..Default::default()
                },
            );
        let reason = config.usable_model("a").unwrap_err();
        assert!(reason.contains("provider 'openai'"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let model = ModelConfig::new("a", "openai", "x").with_api_key("sk-1234567890abcdef");
        let out = format!("{:?}", model);
        assert!(!out.contains("1234567890abcdef"));
        assert!(out.contains("sk-123***"));
    }

    #[test]
    fn redact_counts_characters_not_bytes() {
        let model = ModelConfig::new("a", "openai", "x").with_api_key("s中文密钥abcdef");
        let out = format!("{:?}", model);
        assert!(out.contains("s中文密钥a***"));
        assert!(!out.contains("bcdef"));
        assert_eq!(redact("密钥"), "***");
    }

    #[test]
    fn partial_cost_table_keeps_other_default() {
        let config = EngineConfig::from_toml_str("[cost]\nlow = 1000\n").unwrap();
        assert_eq!(config.cost.low, 1_000);
        assert_eq!(config.cost.high, 16_000);

        let config = EngineConfig::from_toml_str("[cost]\nhigh = 50000\n").unwrap();
        assert_eq!(config.cost.low, 4_000);
        assert_eq!(config.cost.high, 50_000);
    }
}
