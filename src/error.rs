use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the rule-chain engine.
///
/// Only [`ChainError::Config`] and the resolution failures derived from it
/// (`ExhaustedFallback`, `NoProviderAvailable`) abort a whole chain run.
/// Everything else is caught at step granularity by the executor and
/// recorded as a [`StepError`].
#[derive(Error, Debug)]
pub enum ChainError {
    /// No model could be determined, or the configuration itself is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested model failed and no usable fallback exists
    /// (unset, or identical to the model that just failed).
    #[error("model '{model_id}' is unavailable and no fallback can be attempted: {reason}")]
    ExhaustedFallback { model_id: String, reason: String },

    /// Both the requested model and its fallback failed to resolve.
    #[error("no provider available for '{requested}' (fallback '{fallback}' also failed: {reason})")]
    NoProviderAvailable {
        requested: String,
        fallback: String,
        reason: String,
    },

    /// A required parameter could not be determined.
    #[error("parameter '{parameter}' could not be resolved: {reason}")]
    ParameterResolution { parameter: String, reason: String },

    /// Parameter definitions nested deeper than the hard bound.
    #[error("parameter '{parameter}' is cyclic or nested too deeply (depth {depth})")]
    CyclicOrTooDeepParameter { parameter: String, depth: usize },

    /// Template/variable mismatch while building a prompt.
    #[error("prompt build failed: {0}")]
    PromptBuild(String),

    /// A provider adapter failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A post-processing rule failed. Non-fatal: the raw text is kept.
    #[error("post-processing rule '{rule}' failed: {reason}")]
    PostProcessing { rule: String, reason: String },

    /// The run was cancelled via the cancellation flag.
    #[error("chain execution was cancelled")]
    Cancelled,

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl ChainError {
    /// Flat classification used in step records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Config(_)
            | ChainError::ExhaustedFallback { .. }
            | ChainError::NoProviderAvailable { .. } => ErrorKind::Config,
            ChainError::ParameterResolution { .. } | ChainError::CyclicOrTooDeepParameter { .. } => {
                ErrorKind::ParameterResolution
            }
            ChainError::PromptBuild(_) => ErrorKind::PromptBuild,
            ChainError::Provider(e) => e.kind(),
            ChainError::PostProcessing { .. } => ErrorKind::PostProcessing,
            ChainError::Cancelled => ErrorKind::Cancelled,
            ChainError::Json(_) | ChainError::Other(_) => ErrorKind::Generic,
        }
    }

    /// Whether this error is one of the structural resolution failures
    /// that abort a chain before any step runs.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Config
    }
}

impl From<anyhow::Error> for ChainError {
    fn from(err: anyhow::Error) -> Self {
        ChainError::Other(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

/// Shared error taxonomy for every provider adapter.
///
/// Adapters map vendor HTTP statuses and payloads onto these five kinds at
/// their boundary; nothing vendor-specific leaks past an adapter.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProviderError {
    /// Credentials rejected or missing.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Vendor rate limit hit. `retry_after` comes from the `Retry-After` header.
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Transport failure: refused connection, DNS, timeout.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The vendor blocked the prompt or the completion on safety grounds.
    #[error("blocked by content safety filter: {message}")]
    ContentSafety {
        message: String,
        prompt_tokens: u32,
        completion_tokens: u32,
    },

    /// Any other API failure.
    #[error("API error{}: {message}", status_suffix(.status))]
    Generic {
        status: Option<u16>,
        message: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl ProviderError {
    pub fn generic(message: impl Into<String>) -> Self {
        ProviderError::Generic {
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Auth(_) => ErrorKind::Auth,
            ProviderError::RateLimit { .. } => ErrorKind::RateLimit,
            ProviderError::Connection(_) => ErrorKind::Connection,
            ProviderError::ContentSafety { .. } => ErrorKind::ContentSafety,
            ProviderError::Generic { .. } => ErrorKind::Generic,
        }
    }

    /// Map a non-success HTTP status to the shared taxonomy.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => ProviderError::Auth(body),
            429 => ProviderError::RateLimit {
                message: body,
                retry_after,
            },
            408 => ProviderError::Connection(body),
            _ => ProviderError::Generic {
                status: Some(status),
                message: body,
            },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        // Request URLs can carry credentials.
        let err = err.without_url();
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ProviderError::Connection(err.to_string())
        } else if err.is_decode() {
            ProviderError::generic(format!("malformed response body: {err}"))
        } else {
            ProviderError::Generic {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

/// Flat, serializable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    ParameterResolution,
    PromptBuild,
    Auth,
    RateLimit,
    Connection,
    ContentSafety,
    Generic,
    PostProcessing,
    Cancelled,
}

/// A recorded, non-fatal failure attached to a step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ChainError> for StepError {
    fn from(err: &ChainError) -> Self {
        StepError::new(err.kind(), err.to_string())
    }
}

impl From<&ProviderError> for StepError {
    fn from(err: &ProviderError) -> Self {
        StepError::new(err.kind(), err.to_string())
    }
}
