//! Mock adapter for testing without a live LLM.
//!
//! [`MockAdapter`] plays back scripted replies in order and records every
//! request it receives, so tests can assert both what a chain produced and
//! what it sent.
//!
//! # Example
//!
//! ```
//! use novel_rulechain::backend::{MockAdapter, MockReply};
//! use novel_rulechain::error::ProviderError;
//!
//! let mock = MockAdapter::new(vec![
//!     MockReply::text("first answer"),
//!     MockReply::Error(ProviderError::Connection("refused".into())),
//! ]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Capabilities, ConnectionTest, LlmRequest, LlmResponse, ProviderAdapter};
use crate::error::ProviderError;
use crate::tokens::estimate_tokens;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Error(ProviderError),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    /// A content-safety block with the given partial usage.
    pub fn blocked(prompt_tokens: u32) -> Self {
        MockReply::Error(ProviderError::ContentSafety {
            message: "blocked by mock safety filter".into(),
            prompt_tokens,
            completion_tokens: 0,
        })
    }
}

/// A test adapter that returns scripted replies in order.
///
/// Cycles back to the beginning when all replies have been consumed.
#[derive(Debug)]
pub struct MockAdapter {
    replies: Vec<MockReply>,
    index: AtomicUsize,
    requests: Mutex<Vec<LlmRequest>>,
    model: String,
    capabilities: Capabilities,
}

impl MockAdapter {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            model: "mock-model".into(),
            capabilities: Capabilities {
                max_context_tokens: 8_192,
                supports_system_prompt: true,
            },
        }
    }

    /// A mock that always returns the same text.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self::new(vec![MockReply::text(text)])
    }

    /// A mock that always fails with `error`.
    pub fn failing(error: ProviderError) -> Self {
        Self::new(vec![MockReply::Error(error)])
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn next_reply(&self) -> Option<MockReply> {
        if self.replies.is_empty() {
            return None;
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.replies.len();
        Some(self.replies[idx].clone())
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        match self.next_reply() {
            Some(MockReply::Text(text)) => {
                let prompt_tokens = estimate_tokens(&request.prompt)
                    + request.system().map(estimate_tokens).unwrap_or(0);
                let completion_tokens = estimate_tokens(&text);
                let mut response = LlmResponse::new(text)
                    .with_usage(prompt_tokens, completion_tokens)
                    .with_finish_reason(Some("stop".into()));
                response.usage_estimated = true;
                Ok(response)
            }
            Some(MockReply::Error(err)) => Err(err),
            None => Err(ProviderError::generic("mock adapter has no scripted replies")),
        }
    }

    async fn test_connection(&self, model_override: Option<&str>) -> ConnectionTest {
        let model = model_override.unwrap_or(&self.model);
        let outcome = match self.next_reply() {
            Some(MockReply::Error(err)) => Err(err),
            _ => Ok(LlmResponse::new("ok")),
        };
        ConnectionTest::from_probe("mock", model, outcome)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
