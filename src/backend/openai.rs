//! Adapter for OpenAI-compatible chat APIs.
//!
//! [`OpenAiAdapter`] covers OpenAI itself and the many servers that speak
//! its protocol (vLLM, llama.cpp server, LM Studio, Together AI, Groq...).
//!
//! Endpoint: `/v1/chat/completions`.

use super::{
    build_client, log_retry, merge_overrides, normalize_base_url, probe_request,
    send_json, usage_field, with_backoff, BackoffConfig, Capabilities, ConnectionTest,
    LlmRequest, LlmResponse, ProviderAdapter,
};
use crate::config::{redact, ModelConfig, ProviderConfig};
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Adapter for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use novel_rulechain::backend::OpenAiAdapter;
/// use novel_rulechain::config::{ModelConfig, ProviderConfig};
///
/// let model = ModelConfig::new("gpt", "openai", "gpt-4o-mini").with_api_key("sk-...");
/// let adapter = OpenAiAdapter::from_config(&model, &ProviderConfig::default()).unwrap();
/// ```
#[derive(Clone)]
pub struct OpenAiAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    capabilities: Capabilities,
    backoff: BackoffConfig,
    default_test_model: Option<String>,
}

impl std::fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdapter")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_deref().map(redact))
            .field("model", &self.model)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl OpenAiAdapter {
    /// Build an adapter for one configured model.
    ///
    /// The API key is required for the default endpoint; a custom
    /// `base_url` (a self-hosted compatible server) may run without one.
    pub fn from_config(
        model: &ModelConfig,
        provider: &ProviderConfig,
    ) -> Result<Self, ProviderError> {
        let api_key = model.api_key.clone().filter(|k| !k.is_empty());
        if api_key.is_none() && model.base_url.is_none() {
            return Err(ProviderError::Auth(format!(
                "no API key configured for model '{}'",
                model.logical_id
            )));
        }
        Ok(Self {
            client: build_client(provider)?,
            base_url: normalize_base_url(model.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
            api_key,
            model: model.api_model_id.clone(),
            capabilities: Capabilities {
                max_context_tokens: model.max_context_tokens,
                supports_system_prompt: model.supports_system_prompt,
            },
            backoff: BackoffConfig::from_provider(provider),
            default_test_model: provider.default_test_model.clone(),
        })
    }

    /// Replace the transport retry policy.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    fn build_body(model: &str, request: &LlmRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = request.system() {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        merge_overrides(&mut body, &request.overrides);
        body
    }

    fn parse_response(json_resp: &Value) -> Result<LlmResponse, ProviderError> {
        let choice = json_resp.get("choices").and_then(|c| c.get(0));
        let text = choice
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let usage = json_resp.get("usage").cloned().unwrap_or(Value::Null);
        let prompt_tokens = usage_field(&usage, "prompt_tokens").unwrap_or(0);
        let completion_tokens = usage_field(&usage, "completion_tokens").unwrap_or(0);

        if finish_reason.as_deref() == Some("content_filter") {
            return Err(ProviderError::ContentSafety {
                message: "completion stopped by content filter".into(),
                prompt_tokens,
                completion_tokens,
            });
        }

        Ok(LlmResponse::new(text)
            .with_usage(prompt_tokens, completion_tokens)
            .with_finish_reason(finish_reason))
    }

    /// Recognize prompt-level safety rejections, which arrive as 400s.
    fn refine_error(_status: u16, body: &str) -> Option<ProviderError> {
        let parsed: Value = serde_json::from_str(body).ok()?;
        let code = parsed.get("error")?.get("code")?.as_str()?;
        matches!(code, "content_policy_violation" | "content_filter").then(|| {
            ProviderError::ContentSafety {
                message: parsed["error"]["message"]
                    .as_str()
                    .unwrap_or(code)
                    .to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
            }
        })
    }

    async fn call(&self, model: &str, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = Self::build_body(model, request);
        tracing::debug!(provider = "openai", model, %url, "sending chat completion");

        with_backoff(&self.backoff, log_retry("openai", model), || {
            let mut req = self.client.post(&url).json(&body);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }
            async move {
                let json_resp = send_json(req, Self::refine_error).await?;
                Self::parse_response(&json_resp)
            }
        })
        .await
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        self.call(&self.model, request).await
    }

    async fn test_connection(&self, model_override: Option<&str>) -> ConnectionTest {
        let model = model_override
            .or(self.default_test_model.as_deref())
            .unwrap_or(&self.model);
        let outcome = self.call(model, &probe_request()).await;
        ConnectionTest::from_probe("openai", model, outcome)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
