//! Adapter for the Anthropic Messages API.
//!
//! Endpoint: `/v1/messages`, authenticated with `x-api-key` and pinned to
//! one `anthropic-version`. The system prompt is a top-level field rather
//! than a message.

use super::{
    build_client, log_retry, merge_overrides, normalize_base_url, probe_request,
    send_json, with_backoff, BackoffConfig, Capabilities, ConnectionTest, LlmRequest,
    LlmResponse, ProviderAdapter,
};
use crate::config::{redact, ModelConfig, ProviderConfig};
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Adapter for Claude models.
#[derive(Clone)]
pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    capabilities: Capabilities,
    backoff: BackoffConfig,
    default_test_model: Option<String>,
}

impl std::fmt::Debug for AnthropicAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicAdapter")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

impl AnthropicAdapter {
    /// Build an adapter for one configured model. An API key is required.
    pub fn from_config(
        model: &ModelConfig,
        provider: &ProviderConfig,
    ) -> Result<Self, ProviderError> {
        let api_key = model
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ProviderError::Auth(format!(
                    "no API key configured for model '{}'",
                    model.logical_id
                ))
            })?;
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

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    fn build_body(model: &str, request: &LlmRequest) -> Value {
        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if let Some(system) = request.system() {
            body["system"] = json!(system);
        }
        // No native JSON switch; the prompt carries the instruction.
        merge_overrides(&mut body, &request.overrides);
        body
    }

    fn parse_response(json_resp: Value) -> Result<LlmResponse, ProviderError> {
        let data: MessagesResponse = serde_json::from_value(json_resp)
            .map_err(|e| ProviderError::generic(format!("unexpected Messages API response: {e}")))?;

        let text: String = data
            .content
            .iter()
            .filter(|block| block.r#type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        if data.stop_reason.as_deref() == Some("refusal") {
            return Err(ProviderError::ContentSafety {
                message: "model refused the request".into(),
                prompt_tokens: data.usage.input_tokens,
                completion_tokens: data.usage.output_tokens,
            });
        }

        Ok(LlmResponse::new(text)
            .with_usage(data.usage.input_tokens, data.usage.output_tokens)
            .with_finish_reason(data.stop_reason))
    }

    async fn call(&self, model: &str, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = Self::build_body(model, request);
        tracing::debug!(provider = "anthropic", model, "sending messages request");

        with_backoff(&self.backoff, log_retry("anthropic", model), || {
            let req = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body);
            async move {
                let json_resp = send_json(req, |_, _| None).await?;
                Self::parse_response(json_resp)
            }
        })
        .await
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        self.call(&self.model, request).await
    }

    async fn test_connection(&self, model_override: Option<&str>) -> ConnectionTest {
        let model = model_override
            .or(self.default_test_model.as_deref())
            .unwrap_or(&self.model);
        let outcome = self.call(model, &probe_request()).await;
        ConnectionTest::from_probe("anthropic", model, outcome)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}
