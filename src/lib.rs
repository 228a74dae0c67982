//! # llm-providers: uniform completion providers
//!
//! One contract for talking to heterogeneous LLM backends, with retry and
//! backoff, token-bucket rate limiting, capability detection and streaming.
//!
//! ## Architecture
//!
//! - **Provider contract**: [`CompletionProvider`] with derived chat, retry,
//!   progress and introspection operations on top of `complete`/`stream`
//! - **Provider core**: [`ProviderCore`] resolves configuration once and
//!   owns the optional [`RateLimiter`]
//! - **Errors**: every failure is a [`ProviderError`] whose
//!   `is_operational` flag decides whether a retry makes sense
//! - **Anthropic**: [`AnthropicProvider`], the reference implementation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use llm_providers::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ProviderError> {
//!     let provider = AnthropicProvider::new(ProviderConfig::new().with_max_tokens(256))?;
//!
//!     let answer = provider
//!         .generate_with_retry("Say hello.", &CompletionOptions::new(), 3)
//!         .await?;
//!     println!("{answer}");
//!
//!     let mut stream = provider.stream("Count to five.", &CompletionOptions::new()).await?;
//!     while let Some(chunk) = stream.next().await {
//!         print!("{}", chunk?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod anthropic;
pub mod config;
pub mod error;
pub mod logging;
pub mod messages;
pub mod provider;
pub mod rate_limiter;
pub mod streaming;

pub use anthropic::AnthropicProvider;
pub use config::{ProviderConfig, ProviderSettings, RetryConfig};
pub use error::{format_error, format_error_with, ErrorCode, ProviderError, UnknownErrorPolicy};
pub use messages::{ChatMessage, CompletionOptions, RequestSettings, Role};
pub use provider::{
    Capabilities, CompletionProvider, ProgressCallback, ProviderCore, ProviderDefaults,
    ProviderInfo,
};
pub use rate_limiter::{Interval, RateLimitPolicy, RateLimiter, TokenBucket};
pub use streaming::{CancelHandle, TextStream};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::anthropic::AnthropicProvider;
    pub use crate::config::{ProviderConfig, RetryConfig};
    pub use crate::error::{ErrorCode, ProviderError};
    pub use crate::messages::{ChatMessage, CompletionOptions, Role};
    pub use crate::provider::{CompletionProvider, ProviderDefaults};
    pub use crate::rate_limiter::{Interval, RateLimitPolicy};
    pub use crate::streaming::TextStream;

    pub use futures::StreamExt;
}
