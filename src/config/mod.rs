//! Provider configuration.
//!
//! Runtime settings live in [`ProviderConfig`]. Named provider definitions
//! can also be loaded from TOML. The search order is:
//! 1. `./providers.toml` (project-local)
//! 2. `~/.config/llm-providers/config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! default_provider = "claude"
//!
//! [providers.claude]
//! type = "anthropic"
//! model = "claude-sonnet-4-20250514"
//! api_key_env = "ANTHROPIC_API_KEY"
//!
//! [providers.claude.rate_limit]
//! tokens_per_interval = 50
//! interval = "minute"
//!
//! [providers.fast]
//! type = "anthropic"
//! model = "claude-3-haiku-20240307"
//! max_tokens = 512
//! ```

mod file;
mod provider;
mod types;

pub use file::{from_path, from_str, load, search_paths, xdg_config_dir};
pub use provider::{ProviderConfig, ProviderSettings, RetryConfig, DEFAULT_TIMEOUT};
pub use types::{NamedProviderConfig, ProvidersFile};
