//! Transport-level retry with exponential backoff and jitter.
//!
//! [`BackoffConfig`] controls how rate limits, connection failures and
//! transient 5xx statuses are retried inside an adapter. The retry count
//! normally comes from the provider's [`ProviderConfig`]; the orchestrator
//! itself never retries across providers.

use crate::config::ProviderConfig;
use std::time::Duration;

/// Configuration for transport-level retry with exponential backoff and jitter.
///
/// # Example
///
/// ```
/// use novel_rulechain::backend::BackoffConfig;
/// use novel_rulechain::config::ProviderConfig;
///
/// let none = BackoffConfig::none();
/// assert_eq!(none.max_retries, 0);
///
/// let from_provider = BackoffConfig::from_provider(&ProviderConfig::default());
/// assert_eq!(from_provider.max_retries, 2);
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of transport retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each retry.
    pub multiplier: f64,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    pub jitter: JitterStrategy,

    /// HTTP statuses of [`ProviderError::Generic`](crate::error::ProviderError::Generic)
    /// that are retried. Rate limits and connection failures always are.
    pub retryable_statuses: Vec<u16>,

    /// Whether a vendor `Retry-After` replaces the computed delay.
    pub respect_retry_after: bool,
}

/// Jitter strategy to prevent thundering herd on shared rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// Delay is exactly the calculated value.
    None,

    /// Random value in `[0, calculated_delay]`.
    Full,

    /// `calculated_delay/2 + random in [0, calculated_delay/2]`.
    Equal,
}

impl BackoffConfig {
    /// No transport retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Cloud API defaults: 3 retries, 1s initial, 2x multiplier, 30s max,
    /// full jitter, respects `Retry-After`.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: JitterStrategy::Full,
            retryable_statuses: vec![500, 502, 503, 504, 529],
            respect_retry_after: true,
        }
    }

    /// Standard settings with the retry count configured for a provider.
    pub fn from_provider(provider: &ProviderConfig) -> Self {
        Self {
            max_retries: provider.max_retries,
            ..Self::standard()
        }
    }

    /// Calculate the delay for attempt N (0-indexed).
    ///
    /// The base delay is `initial_delay * multiplier^attempt`, capped at
    /// `max_delay`, then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };

        Duration::from_secs_f64(jittered)
    }

    /// The delay before retry `attempt` (1-indexed), preferring a vendor hint.
    pub(crate) fn delay_before(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) if self.respect_retry_after => hint.min(self.max_delay),
            _ => self.delay_for_attempt(attempt.saturating_sub(1)),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(max_delay: Duration) -> BackoffConfig {
        BackoffConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay,
            jitter: JitterStrategy::None,
            retryable_statuses: vec![503],
            respect_retry_after: true,
        }
    }

    #[test]
    fn test_backoff_delay_exponential() {
        let config = fixed(Duration::from_secs(60));
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_delay_capped_at_max() {
        let config = fixed(Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_jitter_full_in_range() {
        let config = BackoffConfig {
            jitter: JitterStrategy::Full,
            ..fixed(Duration::from_secs(60))
        };
        for _ in 0..100 {
            assert!(config.delay_for_attempt(1) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_retry_after_hint_wins_but_is_capped() {
        let config = fixed(Duration::from_secs(10));
        assert_eq!(
            config.delay_before(1, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.delay_before(1, Some(Duration::from_secs(300))),
            Duration::from_secs(10)
        );
        assert_eq!(config.delay_before(2, None), Duration::from_secs(2));

        let ignoring = BackoffConfig {
            respect_retry_after: false,
            ..config
        };
        assert_eq!(
            ignoring.delay_before(1, Some(Duration::from_secs(3))),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_from_provider_takes_retry_count() {
        let provider = ProviderConfig {
            max_retries: 7,
            ..Default::default()
        };
        let config = BackoffConfig::from_provider(&provider);
        assert_eq!(config.max_retries, 7);
        assert!(config.retryable_statuses.contains(&503));
    }
}
