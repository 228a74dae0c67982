//! The completion-provider contract.
//!
//! Concrete backends implement [`ProviderDefaults`] for their static
//! defaults and [`CompletionProvider`] for the two primitive operations,
//! `complete` and `stream`. Everything else (chat flattening, retries,
//! progress reporting, connection checks, introspection) is derived from
//! those two and the shared [`ProviderCore`].
//!
//! # Example
//!
//! ```ignore
//! use llm_providers::{AnthropicProvider, CompletionOptions, CompletionProvider, ProviderConfig};
//!
//! let provider = AnthropicProvider::new(ProviderConfig::new().with_max_tokens(256))?;
//! let answer = provider
//!     .generate_with_retry("Name three prime numbers.", &CompletionOptions::new(), 3)
//!     .await?;
//! ```

use crate::config::{ProviderConfig, ProviderSettings, RetryConfig};
use crate::error::{format_error_with, BoxError, ProviderError};
use crate::messages::{flatten_chat, ChatMessage, CompletionOptions, RequestSettings};
use crate::rate_limiter::RateLimiter;
use crate::streaming::{self, TextStream};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Static defaults a concrete provider type declares.
///
/// These are consulted before an instance exists, while its settings are
/// being resolved.
pub trait ProviderDefaults {
    /// Model used when the configuration names none.
    fn default_model() -> String;

    /// Environment variable holding the credential.
    fn api_key_env_var() -> &'static str;

    /// Maximum output tokens when the configuration names none.
    fn default_max_tokens() -> u32 {
        4096
    }

    /// Sampling temperature when the configuration names none.
    fn default_temperature() -> f32 {
        0.7
    }
}

/// Feature flags a provider advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Incremental text delivery
    pub streaming: bool,
    /// Tool or function calling
    pub function_calling: bool,
    /// Native multi-message conversations
    pub chat: bool,
    /// Image inputs
    pub vision: bool,
}

/// Snapshot of a provider's identity and resolved settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    /// Short provider name, e.g. `"anthropic"`
    pub name: String,
    /// Resolved model identifier
    pub model: String,
    /// Resolved maximum output tokens
    pub max_tokens: u32,
    /// Resolved sampling temperature
    pub temperature: f32,
    /// Advertised capabilities
    pub capabilities: Capabilities,
}

/// Callback invoked with each streamed chunk.
pub type ProgressCallback = Box<dyn FnMut(&str) + Send + 'static>;

/// State shared by every provider: the caller's configuration, the settings
/// resolved from it, and the optional rate limiter.
#[derive(Debug)]
pub struct ProviderCore {
    name: String,
    config: ProviderConfig,
    settings: ProviderSettings,
    default_model: String,
    api_key_env_var: &'static str,
    rate_limiter: Option<RateLimiter>,
}

impl ProviderCore {
    /// Resolves settings for provider type `P`, reading the credential
    /// variable from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_CONFIG` if the rate-limit policy is unusable.
    pub fn new<P: ProviderDefaults>(config: ProviderConfig) -> Result<Self, ProviderError> {
        Self::new_with_env::<P, _>(config, |name| std::env::var(name).ok())
    }

    /// Resolves settings for provider type `P` using `env` for variable
    /// lookups.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_CONFIG` if the rate-limit policy is unusable.
    pub fn new_with_env<P, F>(config: ProviderConfig, env: F) -> Result<Self, ProviderError>
    where
        P: ProviderDefaults,
        F: Fn(&str) -> Option<String>,
    {
        let settings = ProviderSettings::resolve_with::<P, _>(&config, env);
        let rate_limiter = config.rate_limit.map(RateLimiter::new).transpose()?;
        let name = type_short_name::<P>();

        tracing::debug!(
            provider = %name,
            model = %settings.model,
            max_tokens = settings.max_tokens,
            has_api_key = settings.api_key.is_some(),
            rate_limited = rate_limiter.is_some(),
            "provider configured"
        );

        Ok(Self {
            name,
            config,
            settings,
            default_model: P::default_model(),
            api_key_env_var: P::api_key_env_var(),
            rate_limiter,
        })
    }

    /// Short provider name derived from the concrete type.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this provider was built from.
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The resolved settings.
    #[must_use]
    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// The provider type's default model.
    #[must_use]
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// The provider type's credential variable.
    #[must_use]
    pub fn api_key_env_var(&self) -> &'static str {
        self.api_key_env_var
    }

    /// The rate limiter, when the configuration carries a policy.
    #[must_use]
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// Returns the resolved credential.
    ///
    /// # Errors
    ///
    /// Returns an `AUTHENTICATION_ERROR` naming the credential variable when
    /// no key was supplied.
    pub fn require_api_key(&self) -> Result<&str, ProviderError> {
        self.settings.api_key.as_deref().ok_or_else(|| {
            ProviderError::authentication(format!(
                "no API key configured for {}; set {} or pass api_key",
                self.name, self.api_key_env_var
            ))
        })
    }

    /// Merges per-call options over the resolved settings.
    #[must_use]
    pub fn merge_options(&self, options: &CompletionOptions) -> RequestSettings {
        RequestSettings {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.settings.model.clone()),
            max_tokens: options.max_tokens.unwrap_or(self.settings.max_tokens),
            temperature: options.temperature.unwrap_or(self.settings.temperature),
            system: options.system.clone(),
        }
    }

    /// Runs `operation` after taking `token_cost` tokens from the rate
    /// limiter, if one is configured.
    ///
    /// In fire-immediately mode the operation runs even when the bucket is
    /// short. Policies with `reject_on_deficit` set abort instead, with an
    /// operational `RATE_LIMITED` error carrying the time until the bucket
    /// recovers.
    ///
    /// # Errors
    ///
    /// Returns the limiter's error, the deficit error above, or whatever
    /// `operation` returns.
    pub async fn with_rate_limit<T, Fut>(
        &self,
        token_cost: u32,
        operation: Fut,
    ) -> Result<T, ProviderError>
    where
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if let Some(limiter) = &self.rate_limiter {
            let remaining = limiter.remove_tokens(token_cost).await?;
            if remaining < 0.0 {
                let wait_ms = (-remaining / limiter.policy().refill_per_ms()).ceil();
                let retry_after = Duration::from_millis(wait_ms.max(1.0) as u64);
                if limiter.policy().reject_on_deficit {
                    tracing::debug!(
                        provider = %self.name,
                        deficit = -remaining,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "rate limit exceeded, rejecting call"
                    );
                    return Err(ProviderError::rate_limited(
                        format!("rate limit exceeded for {}", self.name),
                        Some(retry_after),
                    ));
                }
                tracing::debug!(
                    provider = %self.name,
                    deficit = -remaining,
                    recovers_in_ms = retry_after.as_millis() as u64,
                    "rate limit exceeded, sending anyway"
                );
            }
        }

        operation.await
    }
}

/// A text-completion backend.
///
/// Implementors supply [`core`](Self::core), [`complete`](Self::complete)
/// and [`stream`](Self::stream); the remaining operations have working
/// defaults built on those. Capability predicates default to `false` and
/// should be overridden to advertise what the backend supports.
#[async_trait]
pub trait CompletionProvider: Send + Sync + fmt::Debug {
    /// Shared provider state.
    fn core(&self) -> &ProviderCore;

    /// Produces a full completion for `prompt`.
    ///
    /// # Errors
    ///
    /// Returns a normalized [`ProviderError`] on failure.
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError>;

    /// Produces the completion for `prompt` incrementally.
    ///
    /// # Errors
    ///
    /// Returns a normalized [`ProviderError`] if the stream cannot be
    /// started. Failures after that surface as stream items.
    async fn stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<TextStream, ProviderError>;

    /// Short provider name.
    fn name(&self) -> &str {
        self.core().name()
    }

    /// The resolved model.
    fn model(&self) -> &str {
        &self.core().settings().model
    }

    /// The resolved maximum output tokens.
    fn max_tokens(&self) -> u32 {
        self.core().settings().max_tokens
    }

    /// The resolved sampling temperature.
    fn temperature(&self) -> f32 {
        self.core().settings().temperature
    }

    /// Normalizes any error using this provider's unknown-error policy.
    fn format_error(&self, err: BoxError) -> ProviderError {
        format_error_with(err, self.core().config().unknown_errors)
    }

    /// Whether [`stream`](Self::stream) delivers incremental output.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Whether the backend supports tool or function calling.
    fn supports_function_calling(&self) -> bool {
        false
    }

    /// Whether the backend handles conversations natively.
    fn supports_chat(&self) -> bool {
        false
    }

    /// Whether the backend accepts image inputs.
    fn supports_vision(&self) -> bool {
        false
    }

    /// All capability predicates in one value.
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: self.supports_streaming(),
            function_calling: self.supports_function_calling(),
            chat: self.supports_chat(),
            vision: self.supports_vision(),
        }
    }

    /// Completes a conversation.
    ///
    /// The default flattens the transcript into `"<Role>: <content>"` blocks
    /// joined by blank lines and delegates to [`complete`](Self::complete).
    ///
    /// # Errors
    ///
    /// Returns whatever `complete` returns.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.complete(&flatten_chat(messages), options).await
    }

    /// Calls [`complete`](Self::complete) up to `max_retries` times with the
    /// default backoff. Zero is treated as a single attempt.
    ///
    /// # Errors
    ///
    /// Returns the first non-operational error, or the last error once all
    /// attempts are spent.
    async fn generate_with_retry(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        max_retries: u32,
    ) -> Result<String, ProviderError> {
        self.generate_with_retry_config(prompt, options, &RetryConfig::new(max_retries))
            .await
    }

    /// Calls [`complete`](Self::complete) under an explicit retry policy.
    ///
    /// # Errors
    ///
    /// Returns the first non-operational error, or the last error once all
    /// attempts are spent.
    async fn generate_with_retry_config(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        retry: &RetryConfig,
    ) -> Result<String, ProviderError> {
        let attempts = retry.max_retries.max(1);
        let mut attempt = 1;

        loop {
            match self.complete(prompt, options).await {
                Ok(text) => {
                    if attempt > 1 {
                        tracing::info!(provider = %self.name(), attempt, "request succeeded after retry");
                    }
                    return Ok(text);
                }
                Err(error) if !error.is_operational() => {
                    tracing::warn!(provider = %self.name(), error = %error, "non-retryable error");
                    return Err(error);
                }
                Err(error) if attempt >= attempts => {
                    tracing::error!(
                        provider = %self.name(),
                        attempts,
                        error = %error,
                        "all retry attempts exhausted"
                    );
                    return Err(error);
                }
                Err(error) => {
                    let delay = retry.backoff_for_attempt(attempt);
                    tracing::warn!(
                        provider = %self.name(),
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Streams `prompt`, calling `on_progress` with each chunk before it is
    /// yielded.
    ///
    /// # Errors
    ///
    /// Returns whatever [`stream`](Self::stream) returns.
    async fn stream_with_progress(
        &self,
        prompt: &str,
        on_progress: ProgressCallback,
        options: &CompletionOptions,
    ) -> Result<TextStream, ProviderError> {
        let inner = self.stream(prompt, options).await?;
        Ok(streaming::with_progress(inner, on_progress))
    }

    /// Checks that the provider can answer a minimal request.
    async fn validate(&self) -> bool {
        let options = CompletionOptions::new().with_max_tokens(10);
        match self.complete("Hello", &options).await {
            Ok(_) => true,
            Err(error) => {
                tracing::warn!(provider = %self.name(), error = %error, "provider validation failed");
                false
            }
        }
    }

    /// Same check as [`validate`](Self::validate).
    async fn test_connection(&self) -> bool {
        self.validate().await
    }

    /// Identity and resolved settings.
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name().to_string(),
            model: self.model().to_string(),
            max_tokens: self.max_tokens(),
            temperature: self.temperature(),
            capabilities: self.capabilities(),
        }
    }
}

/// `my_crate::FooProvider<T>` becomes `"foo"`.
fn type_short_name<P>() -> String {
    let full = std::any::type_name::<P>();
    let path = full.split('<').next().unwrap_or(full);
    let short = path.rsplit("::").next().unwrap_or(path);
    short.strip_suffix("Provider").unwrap_or(short).to_lowercase()
}
