//! Provider configuration and setting resolution.
//!
//! A [`ProviderConfig`] holds what the caller supplied; [`ProviderSettings`]
//! is what a provider actually uses after falling back to provider defaults
//! and the credential environment variable.

use crate::error::UnknownErrorPolicy;
use crate::provider::ProviderDefaults;
use crate::rate_limiter::RateLimitPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Caller-supplied provider configuration.
///
/// Every field is optional except the timeout; unset fields are resolved
/// once at construction time:
///
/// | field | resolution order |
/// |---|---|
/// | `api_key` | explicit value, then the provider's credential env var |
/// | `model` | explicit value, then [`ProviderDefaults::default_model`] |
/// | `max_tokens` | explicit value, then [`ProviderDefaults::default_max_tokens`] |
/// | `temperature` | explicit value, then [`ProviderDefaults::default_temperature`] |
///
/// # Examples
///
/// ```
/// use llm_providers::ProviderConfig;
///
/// let config = ProviderConfig::new().with_model("claude-3-haiku-20240307").with_max_tokens(512);
/// assert_eq!(config.max_tokens, Some(512));
///
/// // legacy callers may pass a bare credential
/// let legacy = ProviderConfig::from("sk-ant-...");
/// assert_eq!(legacy.api_key.as_deref(), Some("sk-ant-..."));
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API credential
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model identifier
    #[serde(default)]
    pub model: Option<String>,
    /// Maximum output tokens
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Optional outbound rate limit
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    /// Custom API base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Request timeout
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    /// Classification of errors the taxonomy does not recognize
    #[serde(default)]
    pub unknown_errors: UnknownErrorPolicy,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: None,
            max_tokens: None,
            temperature: None,
            rate_limit: None,
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            unknown_errors: UnknownErrorPolicy::default(),
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("rate_limit", &self.rate_limit)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("unknown_errors", &self.unknown_errors)
            .finish()
    }
}

impl ProviderConfig {
    /// Creates an empty configuration; everything resolves to defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the API key.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the model to use.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the maximum tokens to generate.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the rate-limit policy.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Sets the base URL for the API.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how unrecognized errors are classified.
    #[must_use]
    pub fn with_unknown_errors(mut self, policy: UnknownErrorPolicy) -> Self {
        self.unknown_errors = policy;
        self
    }
}

impl From<&str> for ProviderConfig {
    fn from(api_key: &str) -> Self {
        Self::new().with_api_key(api_key)
    }
}

impl From<String> for ProviderConfig {
    fn from(api_key: String) -> Self {
        Self::new().with_api_key(api_key)
    }
}

/// Settings a provider instance actually uses.
#[derive(Clone, PartialEq, Serialize)]
pub struct ProviderSettings {
    /// Resolved credential, if any source supplied one
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Resolved model identifier
    pub model: String,
    /// Resolved maximum output tokens
    pub max_tokens: u32,
    /// Resolved sampling temperature
    pub temperature: f32,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl ProviderSettings {
    /// Resolves settings for provider `P`, reading the credential from the
    /// process environment.
    #[must_use]
    pub fn resolve<P: ProviderDefaults>(config: &ProviderConfig) -> Self {
        Self::resolve_with::<P, _>(config, |name| std::env::var(name).ok())
    }

    /// Resolves settings for provider `P` using `env` to look up the
    /// credential variable. Empty values count as unset.
    #[must_use]
    pub fn resolve_with<P, F>(config: &ProviderConfig, env: F) -> Self
    where
        P: ProviderDefaults,
        F: Fn(&str) -> Option<String>,
    {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| env(P::api_key_env_var()).filter(|value| !value.is_empty()));

        Self {
            api_key,
            model: config.model.clone().unwrap_or_else(P::default_model),
            max_tokens: config.max_tokens.unwrap_or_else(P::default_max_tokens),
            temperature: config.temperature.unwrap_or_else(P::default_temperature),
        }
    }
}

/// Retry configuration for [`generate_with_retry`].
///
/// [`generate_with_retry`]: crate::CompletionProvider::generate_with_retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_retries: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Backoff multiplier (exponential factor)
    pub backoff_multiplier: u32,
}

impl RetryConfig {
    /// Creates a retry configuration with the default backoff curve.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Sets the initial backoff duration.
    #[must_use]
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Sets the maximum backoff duration.
    #[must_use]
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: u32) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay after the given (1-based) failed attempt.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.backoff_multiplier.saturating_pow(attempt - 1);
        self.initial_backoff
            .saturating_mul(multiplier)
            .min(self.max_backoff)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2,
        }
    }
}
