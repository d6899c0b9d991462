//! Adapter for a local model server speaking Ollama's native API.
//!
//! Endpoint: `/api/chat` with `stream: false`. Local servers do not always
//! report token usage; when they don't, counts are estimated with the
//! character heuristic and the response is flagged `usage_estimated`.

use super::{
    build_client, log_retry, merge_overrides, normalize_base_url, probe_request, send_json,
    usage_field, with_backoff, BackoffConfig, Capabilities, ConnectionTest, LlmRequest,
    LlmResponse, ProviderAdapter,
};
use crate::config::{ModelConfig, ProviderConfig};
use crate::error::ProviderError;
use crate::tokens::estimate_tokens;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Adapter for Ollama and compatible local servers. No authentication.
#[derive(Debug, Clone)]
pub struct LocalAdapter {
    client: Client,
    base_url: String,
    model: String,
    capabilities: Capabilities,
    backoff: BackoffConfig,
    default_test_model: Option<String>,
}

impl LocalAdapter {
    pub fn from_config(
        model: &ModelConfig,
        provider: &ProviderConfig,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(provider)?,
            base_url: normalize_base_url(model.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
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
        let mut messages = Vec::new();
        if let Some(system) = request.system() {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });
        if request.json_mode {
            body["format"] = json!("json");
        }
        merge_overrides(&mut body, &request.overrides);
        body
    }

    fn parse_response(json_resp: &Value, request: &LlmRequest) -> LlmResponse {
        let text = json_resp
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let finish_reason = json_resp
            .get("done_reason")
            .and_then(Value::as_str)
            .map(str::to_string);

        let reported = (
            usage_field(json_resp, "prompt_eval_count"),
            usage_field(json_resp, "eval_count"),
        );
        let (prompt_tokens, completion_tokens, estimated) = match reported {
            (Some(p), Some(c)) => (p, c, false),
            (p, c) => {
                let prompt_text = match request.system() {
                    Some(system) => format!("{system}\n\n{}", request.prompt),
                    None => request.prompt.clone(),
                };
                (
                    p.unwrap_or_else(|| estimate_tokens(&prompt_text)),
                    c.unwrap_or_else(|| estimate_tokens(&text)),
                    true,
                )
            }
        };

        let mut response = LlmResponse::new(text)
            .with_usage(prompt_tokens, completion_tokens)
            .with_finish_reason(finish_reason);
        response.usage_estimated = estimated;
        response
    }

    async fn call(&self, model: &str, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = Self::build_body(model, request);
        tracing::debug!(provider = "local", model, %url, "sending chat request");

        with_backoff(&self.backoff, log_retry("local", model), || {
            let req = self.client.post(&url).json(&body);
            async move {
                let json_resp = send_json(req, |_, _| None).await?;
                Ok(Self::parse_response(&json_resp, request))
            }
        })
        .await
    }
}

#[async_trait]
impl ProviderAdapter for LocalAdapter {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        self.call(&self.model, request).await
    }

    async fn test_connection(&self, model_override: Option<&str>) -> ConnectionTest {
        let model = model_override
            .or(self.default_test_model.as_deref())
            .unwrap_or(&self.model);
        let outcome = self.call(model, &probe_request()).await;
        ConnectionTest::from_probe("local", model, outcome)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base_url: &str) -> LocalAdapter {
        let model = ModelConfig::new("local", "local", "llama3.2").with_base_url(base_url);
        LocalAdapter::from_config(&model, &ProviderConfig::default())
            .unwrap()
            .with_backoff(BackoffConfig {
                initial_delay: Duration::ZERO,
                ..BackoffConfig::none()
            })
    }

    #[test]
    fn test_chat_payload() {
        let request = LlmRequest::new("Why is the sky blue?")
            .with_system_prompt("You are a helpful assistant.");
        let body = LocalAdapter::build_body("llama3.2", &request);

        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["temperature"], 0.7);
        assert_eq!(body["options"]["num_predict"], 2048);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "Why is the sky blue?");
        assert!(body.get("format").is_none());
    }

    #[test]
    fn test_json_mode_and_overrides() {
        let mut overrides = Map::new();
        overrides.insert("keep_alive".into(), json!("5m"));
        let request = LlmRequest::new("x")
            .with_json_mode(true)
            .with_overrides(overrides);
        let body = LocalAdapter::build_body("llama3.2", &request);
        assert_eq!(body["format"], "json");
        assert_eq!(body["keep_alive"], "5m");
    }

    #[test]
    fn test_reported_usage_is_copied() {
        let resp = json!({
            "message": {"role": "assistant", "content": "hi"},
            "done_reason": "stop",
            "prompt_eval_count": 26,
            "eval_count": 3
        });
        let response = LocalAdapter::parse_response(&resp, &LlmRequest::new("hello"));
        assert_eq!(response.prompt_tokens, 26);
        assert_eq!(response.completion_tokens, 3);
        assert!(!response.usage_estimated);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_missing_usage_is_estimated() {
        let resp = json!({"message": {"content": "abcdefgh"}});
        let request = LlmRequest::new("abcd").with_system_prompt("ab");
        let response = LocalAdapter::parse_response(&resp, &request);
        // "ab\n\nabcd" is 8 chars
        assert_eq!(response.prompt_tokens, 2);
        assert_eq!(response.completion_tokens, 2);
        assert_eq!(response.total_tokens, 4);
        assert!(response.usage_estimated);
    }

    #[tokio::test]
    async fn test_generate_against_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "llama3.2", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "Hello world (summary)."},
                "done": true,
                "done_reason": "stop"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = adapter(&format!("{}/api", server.uri()))
            .generate(&LlmRequest::new("Hello world."))
            .await
            .unwrap();
        assert_eq!(response.text, "Hello world (summary).");
        assert!(response.usage_estimated);
        assert_eq!(response.prompt_tokens, 3);
    }

    #[tokio::test]
    async fn test_server_error_is_generic() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let test = adapter(&server.uri()).test_connection(None).await;
        assert!(!test.ok);
        assert_eq!(test.details["error_kind"], "generic");
        assert!(test.message.contains("model not found"));
    }
}
