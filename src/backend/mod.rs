//! Provider adapter trait and normalized request/response types.
//!
//! The [`ProviderAdapter`] trait abstracts over LLM vendors, translating
//! between the normalized [`LlmRequest`]/[`LlmResponse`] types and each
//! vendor's HTTP API. Every adapter maps vendor failures onto the shared
//! [`ProviderError`] taxonomy at its boundary.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator ──► LlmRequest ──► ProviderAdapter::generate() ──► LlmResponse
//!                                          │
//!            ┌──────────────┬──────────────┼──────────────┬─────────────┐
//!       OpenAiAdapter  AnthropicAdapter  GeminiAdapter  LocalAdapter  MockAdapter
//!   /v1/chat/completions  /v1/messages  :generateContent  /api/chat    (scripted)
//! ```

#[cfg(feature = "anthropic")]
pub mod anthropic;
pub mod backoff;
#[cfg(feature = "gemini")]
pub mod gemini;
pub mod local;
pub mod mock;
#[cfg(feature = "openai")]
pub mod openai;
pub mod registry;

#[cfg(feature = "anthropic")]
pub use anthropic::AnthropicAdapter;
pub use backoff::{BackoffConfig, JitterStrategy};
#[cfg(feature = "gemini")]
pub use gemini::GeminiAdapter;
pub use local::LocalAdapter;
pub use mock::{MockAdapter, MockReply};
#[cfg(feature = "openai")]
pub use openai::OpenAiAdapter;
pub use registry::{AdapterConstructor, ProviderRegistry};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;

/// A normalized LLM request, independent of vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    /// The user prompt text.
    pub prompt: String,

    /// Optional system prompt. Adapters for models without system-prompt
    /// support never see one; the orchestrator folds it into `prompt`.
    pub system_prompt: Option<String>,

    /// Ask the vendor for JSON output via its native switch, if any.
    pub json_mode: bool,

    pub temperature: f64,

    pub max_tokens: u32,

    /// Extra vendor body fields, merged into the request body last.
    pub overrides: Map<String, Value>,
}

impl LlmRequest {
    /// A request with temperature 0.7 and 2048 max tokens.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            json_mode: false,
            temperature: 0.7,
            max_tokens: 2048,
            overrides: Map::new(),
        }
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
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_overrides(mut self, overrides: Map<String, Value>) -> Self {
        self.overrides = overrides;
        self
    }

    /// The system prompt, treating an empty string as absent.
    pub fn system(&self) -> Option<&str> {
        self.system_prompt.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Copy of this request with the system prompt prepended to the user
    /// prompt, for models that do not accept a separate system role.
    pub fn folded(&self) -> Self {
        let mut folded = self.clone();
        if let Some(system) = self.system() {
            folded.prompt = format!("{system}\n\n{}", self.prompt);
        }
        folded.system_prompt = None;
        folded
    }
}

/// A normalized LLM response.
///
/// Returned by every adapter call and by the orchestrator. Failures that
/// the orchestrator absorbs are represented here too: `error` is set, and
/// `is_blocked_by_safety` marks content-filter refusals.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,

    /// Logical id of the model that actually served the call.
    pub model_id_used: String,

    pub prompt_tokens: u32,

    pub completion_tokens: u32,

    pub total_tokens: u32,

    /// Vendor finish/stop reason, verbatim.
    pub finish_reason: Option<String>,

    pub error: Option<ProviderError>,

    pub is_blocked_by_safety: bool,

    /// Token counts are a heuristic estimate, not vendor-reported.
    pub usage_estimated: bool,
}

impl LlmResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Set token usage; the total is derived.
    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self.total_tokens = prompt_tokens.saturating_add(completion_tokens);
        self
    }

    pub fn with_finish_reason(mut self, reason: Option<String>) -> Self {
        self.finish_reason = reason;
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id_used = model_id.into();
        self
    }

    /// Response standing in for a failed call.
    ///
    /// A [`ProviderError::ContentSafety`] produces a blocked response that
    /// carries the token counts known at failure time.
    pub fn from_error(model_id: impl Into<String>, error: ProviderError) -> Self {
        let mut response = Self::new("").with_model(model_id);
        if let ProviderError::ContentSafety {
            prompt_tokens,
            completion_tokens,
            ..
        } = &error
        {
            response = response.with_usage(*prompt_tokens, *completion_tokens);
            response.is_blocked_by_safety = true;
        }
        response.error = Some(error);
        response
    }

    /// Neither an error nor a safety block.
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && !self.is_blocked_by_safety
    }
}

/// What a configured model can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub max_context_tokens: u32,
    pub supports_system_prompt: bool,
}

/// Outcome of [`ProviderAdapter::test_connection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub ok: bool,
    pub message: String,
    /// Vendor- or failure-specific details (model probed, error kind, usage).
    pub details: Value,
}

impl ConnectionTest {
    /// Summarize a probe call made against `model`.
    pub fn from_probe(
        provider: &str,
        model: &str,
        outcome: Result<LlmResponse, ProviderError>,
    ) -> Self {
        match outcome {
            Ok(response) => ConnectionTest {
                ok: true,
                message: format!("{provider} model '{model}' responded"),
                details: serde_json::json!({
                    "model": model,
                    "finish_reason": response.finish_reason,
                    "total_tokens": response.total_tokens,
                }),
            },
            Err(err) => ConnectionTest {
                ok: false,
                message: format!("{provider} model '{model}' failed: {err}"),
                details: serde_json::json!({
                    "model": model,
                    "error_kind": err.kind(),
                }),
            },
        }
    }
}

/// Abstraction over LLM vendors.
///
/// One instance serves one configured model. Implementors translate the
/// normalized [`LlmRequest`] into the vendor's HTTP API and map every
/// vendor failure onto [`ProviderError`].
///
/// Built-in implementations: [`OpenAiAdapter`], [`AnthropicAdapter`],
/// [`GeminiAdapter`], [`LocalAdapter`], [`MockAdapter`].
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn ProviderAdapter>`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Execute one completion, including the adapter's own transport retries.
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError>;

    /// Issue a minimal request to check credentials and reachability.
    ///
    /// `model_override` is a vendor model name to probe instead of the
    /// configured one.
    async fn test_connection(&self, model_override: Option<&str>) -> ConnectionTest;

    fn capabilities(&self) -> Capabilities;

    /// Provider tag, for logging and diagnostics.
    fn name(&self) -> &'static str;

    /// Vendor model name this adapter calls.
    fn model_id(&self) -> &str;
}

/// The request used by connection probes.
pub(crate) fn probe_request() -> LlmRequest {
    LlmRequest::new("Reply with the single word: ok")
        .with_temperature(0.0)
        .with_max_tokens(8)
}

/// Whether a [`ProviderError`] should be retried under `config`.
///
/// Rate limits and connection failures always are; generic API errors only
/// when their status is in `config.retryable_statuses`.
pub fn is_retryable(error: &ProviderError, config: &BackoffConfig) -> bool {
    match error {
        ProviderError::RateLimit { .. } | ProviderError::Connection(_) => true,
        ProviderError::Generic {
            status: Some(status),
            ..
        } => config.retryable_statuses.contains(status),
        _ => false,
    }
}

/// Run `op` with transport-level retry and exponential backoff.
///
/// Returns the first success, or the last error once retries are exhausted
/// or a non-retryable error occurs. `on_retry` is invoked before each retry
/// with `(attempt, delay, error)`.
pub async fn with_backoff<T, F, Fut>(
    config: &BackoffConfig,
    mut on_retry: impl FnMut(u32, Duration, &ProviderError),
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < config.max_retries && is_retryable(&err, config) => {
                attempt += 1;
                let retry_after = match &err {
                    ProviderError::RateLimit { retry_after, .. } => *retry_after,
                    _ => None,
                };
                let delay = config.delay_before(attempt, retry_after);
                on_retry(attempt, delay, &err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Log a transport retry. Used as the `on_retry` hook by the HTTP adapters.
pub(crate) fn log_retry<'a>(
    provider: &'static str,
    model: &'a str,
) -> impl FnMut(u32, Duration, &ProviderError) + 'a {
    move |attempt: u32, delay: Duration, err: &ProviderError| {
        tracing::warn!(
            provider,
            model,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying LLM request"
        );
    }
}

/// Build the HTTP client for an adapter with the provider's timeout.
pub(crate) fn build_client(provider: &ProviderConfig) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(provider.timeout())
        .build()
        .map_err(|e| ProviderError::Connection(format!("cannot build HTTP client: {e}")))
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Send a prepared request and return the JSON body of a successful reply.
///
/// Non-success statuses are mapped through [`ProviderError::from_status`];
/// `refine` gets a chance to recognize vendor-specific error bodies first
/// (safety refusals reported as 400s, for instance).
pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
    refine: fn(u16, &str) -> Option<ProviderError>,
) -> Result<Value, ProviderError> {
    let resp = request.send().await?;
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        return Err(refine(status, &body)
            .unwrap_or_else(|| ProviderError::from_status(status, body, retry_after)));
    }
    Ok(resp.json::<Value>().await?)
}

/// Merge request overrides into a vendor body, replacing existing keys.
pub(crate) fn merge_overrides(body: &mut Value, overrides: &Map<String, Value>) {
    if let Some(obj) = body.as_object_mut() {
        for (k, v) in overrides {
            obj.insert(k.clone(), v.clone());
        }
    }
}

/// Read a `u32` usage counter out of a vendor JSON object.
pub(crate) fn usage_field(value: &Value, key: &str) -> Option<u32> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

/// Strip trailing slashes and known endpoint suffixes from a base URL so
/// adapters can append their own paths.
pub(crate) fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    for suffix in [
        "/v1/chat/completions",
        "/v1/messages",
        "/v1beta",
        "/v1",
        "/api/chat",
        "/api",
    ] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant(max_retries: u32) -> BackoffConfig {
        BackoffConfig {
            max_retries,
            initial_delay: Duration::ZERO,
            jitter: JitterStrategy::None,
            ..BackoffConfig::standard()
        }
    }

    #[test]
    fn test_is_retryable_rate_limit_and_connection() {
        let config = BackoffConfig::standard();
        assert!(is_retryable(
            &ProviderError::RateLimit {
                message: "slow".into(),
                retry_after: None
            },
            &config
        ));
        assert!(is_retryable(&ProviderError::Connection("refused".into()), &config));
    }

    #[test]
    fn test_is_retryable_status_list() {
        let config = BackoffConfig::standard();
        let unavailable = ProviderError::Generic {
            status: Some(503),
            message: "unavailable".into(),
        };
        let bad_request = ProviderError::Generic {
            status: Some(400),
            message: "bad".into(),
        };
        assert!(is_retryable(&unavailable, &config));
        assert!(!is_retryable(&bad_request, &config));
        assert!(!is_retryable(&ProviderError::Auth("no".into()), &config));
        assert!(!is_retryable(
            &ProviderError::ContentSafety {
                message: "blocked".into(),
                prompt_tokens: 0,
                completion_tokens: 0
            },
            &config
        ));
    }

    #[tokio::test]
    async fn test_backoff_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let mut retries = Vec::new();
        let result = with_backoff(
            &instant(3),
            |attempt, _, _| retries.push(attempt),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Connection("refused".into()))
                } else {
                    Ok("done")
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_backoff_gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_backoff(
            &instant(2),
            |_, _, _| {},
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Connection("refused".into()))
            },
        )
        .await;
        assert!(matches!(result, Err(ProviderError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_does_not_retry_auth() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_backoff(
            &instant(5),
            |_, _, _| {},
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Auth("bad key".into()))
            },
        )
        .await;
        assert!(matches!(result, Err(ProviderError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fold_system_prompt() {
        let request = LlmRequest::new("Summarize this.").with_system_prompt("You are terse.");
        let folded = request.folded();
        assert_eq!(folded.prompt, "You are terse.\n\nSummarize this.");
        assert!(folded.system_prompt.is_none());

        let blank = LlmRequest::new("p").with_system_prompt("  ").folded();
        assert_eq!(blank.prompt, "p");
    }

    #[test]
    fn test_blocked_response_keeps_partial_usage() {
        let response = LlmResponse::from_error(
            "gpt",
            ProviderError::ContentSafety {
                message: "filtered".into(),
                prompt_tokens: 12,
                completion_tokens: 3,
            },
        );
        assert!(response.is_blocked_by_safety);
        assert_eq!(response.total_tokens, 15);
        assert!(!response.is_ok());

        let failed = LlmResponse::from_error("gpt", ProviderError::Auth("no".into()));
        assert!(!failed.is_blocked_by_safety);
        assert_eq!(failed.total_tokens, 0);
    }

    #[test]
    fn test_merge_overrides_replaces_keys() {
        let mut body = json!({"model": "a", "temperature": 0.7});
        let mut overrides = Map::new();
        overrides.insert("temperature".into(), json!(0.1));
        overrides.insert("top_p".into(), json!(0.9));
        merge_overrides(&mut body, &overrides);
        assert_eq!(body["temperature"], 0.1);
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["model"], "a");
    }

    #[test]
    fn test_parse_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("https://api.openai.com/v1/"), "https://api.openai.com");
        assert_eq!(normalize_base_url("http://localhost:11434/api"), "http://localhost:11434");
        assert_eq!(
            normalize_base_url("https://generativelanguage.googleapis.com/v1beta"),
            "https://generativelanguage.googleapis.com"
        );
        assert_eq!(normalize_base_url("http://host:8080"), "http://host:8080");
    }

    #[test]
    fn test_connection_test_from_probe() {
        let ok = ConnectionTest::from_probe("openai", "gpt-4o", Ok(LlmResponse::new("ok")));
        assert!(ok.ok);
        assert_eq!(ok.details["model"], "gpt-4o");

        let failed = ConnectionTest::from_probe(
            "openai",
            "gpt-4o",
            Err(ProviderError::Auth("invalid key".into())),
        );
        assert!(!failed.ok);
        assert!(failed.message.contains("invalid key"));
        assert_eq!(failed.details["error_kind"], "auth");
    }
}
