//! Adapter for the Google Gemini `generateContent` API.
//!
//! Endpoint: `/v1beta/models/{model}:generateContent`, keyed by the
//! `x-goog-api-key` header. Safety blocks arrive in a 200 response, either as a
//! `promptFeedback.blockReason` or as a candidate `finishReason`.

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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Candidate finish reasons that mean the output was withheld on policy grounds.
const SAFETY_FINISH_REASONS: &[&str] = &["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII"];

/// Adapter for Gemini models.
#[derive(Clone)]
pub struct GeminiAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    capabilities: Capabilities,
    backoff: BackoffConfig,
    default_test_model: Option<String>,
}

impl std::fmt::Debug for GeminiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiAdapter")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

impl GeminiAdapter {
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

    fn build_body(request: &LlmRequest) -> Value {
        let mut generation_config = json!({
            "temperature": request.temperature,
            "maxOutputTokens": request.max_tokens,
        });
        if request.json_mode {
            generation_config["responseMimeType"] = json!("application/json");
        }
        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": request.prompt}]}],
            "generationConfig": generation_config,
        });
        if let Some(system) = request.system() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        merge_overrides(&mut body, &request.overrides);
        body
    }

    fn parse_response(json_resp: Value) -> Result<LlmResponse, ProviderError> {
        let data: GenerateContentResponse = serde_json::from_value(json_resp)
            .map_err(|e| ProviderError::generic(format!("unexpected Gemini response: {e}")))?;

        let usage = data.usage_metadata.unwrap_or_default();
        let prompt_tokens = usage.prompt_token_count;
        let completion_tokens = usage.candidates_token_count;

        if let Some(reason) = data.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ProviderError::ContentSafety {
                message: format!("prompt blocked: {reason}"),
                prompt_tokens,
                completion_tokens,
            });
        }

        let candidate = data
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::generic("no candidates in Gemini response"))?;

        if let Some(reason) = candidate
            .finish_reason
            .as_deref()
            .filter(|r| SAFETY_FINISH_REASONS.contains(r))
        {
            return Err(ProviderError::ContentSafety {
                message: format!("candidate withheld: {reason}"),
                prompt_tokens,
                completion_tokens,
            });
        }

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        Ok(LlmResponse::new(text)
            .with_usage(prompt_tokens, completion_tokens)
            .with_finish_reason(candidate.finish_reason))
    }

    async fn call(&self, model: &str, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let body = Self::build_body(request);
        tracing::debug!(provider = "gemini", model, "sending generateContent request");

        with_backoff(&self.backoff, log_retry("gemini", model), || {
            let req = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
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
impl ProviderAdapter for GeminiAdapter {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        self.call(&self.model, request).await
    }

    async fn test_connection(&self, model_override: Option<&str>) -> ConnectionTest {
        let model = model_override
            .or(self.default_test_model.as_deref())
            .unwrap_or(&self.model);
        let outcome = self.call(model, &probe_request()).await;
        ConnectionTest::from_probe("gemini", model, outcome)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn name(&self) -> &'static str {
        "gemini"
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}
