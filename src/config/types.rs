//! Configuration file schema.
//!
//! Types for defining multiple named providers in a TOML file.

use crate::config::provider::ProviderConfig;
use crate::error::UnknownErrorPolicy;
use crate::rate_limiter::RateLimitPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root of a providers configuration file.
///
/// ```toml
/// default_provider = "claude"
///
/// [providers.claude]
/// type = "anthropic"
/// model = "claude-sonnet-4-20250514"
/// api_key_env = "ANTHROPIC_API_KEY"
///
/// [providers.claude.rate_limit]
/// tokens_per_interval = 50
/// interval = "minute"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersFile {
    /// The name of the provider to use when none is specified.
    ///
    /// If not set and only one provider is defined, that provider
    /// becomes the default.
    pub default_provider: Option<String>,

    /// Named provider configurations.
    #[serde(default)]
    pub providers: HashMap<String, NamedProviderConfig>,
}

impl ProvidersFile {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named provider to the configuration.
    #[must_use]
    pub fn with_provider(mut self, name: impl Into<String>, config: NamedProviderConfig) -> Self {
        self.providers.insert(name.into(), config);
        self
    }

    /// Sets the default provider name.
    #[must_use]
    pub fn with_default_provider(mut self, name: impl Into<String>) -> Self {
        self.default_provider = Some(name.into());
        self
    }

    /// Returns the explicit default, or the only provider when exactly one
    /// is defined.
    #[must_use]
    pub fn effective_default(&self) -> Option<&str> {
        if let Some(ref name) = self.default_provider {
            return Some(name.as_str());
        }

        if self.providers.len() == 1 {
            return self.providers.keys().next().map(String::as_str);
        }

        None
    }

    /// Looks up a provider by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NamedProviderConfig> {
        self.providers.get(name)
    }

    /// Returns the effective default provider's configuration.
    #[must_use]
    pub fn default_config(&self) -> Option<&NamedProviderConfig> {
        self.effective_default().and_then(|name| self.get(name))
    }

    /// Returns true if no providers are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Configuration for a single named provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedProviderConfig {
    /// The provider type, e.g. "anthropic".
    #[serde(rename = "type")]
    pub provider_type: String,

    /// Model override; the provider default applies when unset.
    #[serde(default)]
    pub model: Option<String>,

    /// Direct API key value (discouraged - use api_key_env instead).
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key, if it differs from the
    /// provider's standard variable.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Custom base URL for the API.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum tokens to generate.
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Outbound rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,

    /// Classification of unrecognized errors.
    #[serde(default)]
    pub unknown_errors: Option<UnknownErrorPolicy>,
}

impl NamedProviderConfig {
    /// Creates a configuration for the Anthropic provider.
    #[must_use]
    pub fn anthropic() -> Self {
        Self {
            provider_type: "anthropic".to_string(),
            ..Default::default()
        }
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the API key environment variable.
    #[must_use]
    pub fn with_api_key_env(mut self, env_var: impl Into<String>) -> Self {
        self.api_key_env = Some(env_var.into());
        self
    }

    /// Sets a direct API key (discouraged).
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the timeout in seconds.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Sets the rate limit policy.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Converts to a runtime [`ProviderConfig`], reading `api_key_env` from
    /// the process environment.
    #[must_use]
    pub fn to_provider_config(&self) -> ProviderConfig {
        self.to_provider_config_with(|name| std::env::var(name).ok())
    }

    /// Converts to a runtime [`ProviderConfig`] using `env` for lookups.
    ///
    /// A direct `api_key` wins over `api_key_env`. When neither yields a
    /// value the key stays unset so the provider's standard variable is
    /// consulted at construction.
    #[must_use]
    pub fn to_provider_config_with<F>(&self, env: F) -> ProviderConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|name| env(name))
                .filter(|value| !value.is_empty())
        });

        let mut config = ProviderConfig {
            api_key,
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            rate_limit: self.rate_limit,
            base_url: self.base_url.clone(),
            ..ProviderConfig::default()
        };

        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }

        if let Some(policy) = self.unknown_errors {
            config.unknown_errors = policy;
        }

        config
    }
}
