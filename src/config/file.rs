//! Configuration file loading.
//!
//! Provider definitions are read from TOML files at a project-local path
//! or the platform configuration directory.

use crate::config::types::ProvidersFile;
use crate::error::ProviderError;
use std::path::{Path, PathBuf};

/// Project-local configuration file name.
const LOCAL_CONFIG_NAME: &str = "providers.toml";

/// File name within the platform configuration directory.
const XDG_CONFIG_NAME: &str = "config.toml";

/// Directory name used under the platform configuration directory.
const APP_NAME: &str = "llm-providers";

/// Loads configuration from the default search paths.
///
/// Search order:
/// 1. `./providers.toml` (project-local)
/// 2. `~/.config/llm-providers/config.toml`
///
/// Returns an empty configuration if no file is found.
///
/// # Errors
///
/// Returns an `INVALID_CONFIG` error if a file exists but cannot be parsed.
pub fn load() -> Result<ProvidersFile, ProviderError> {
    for path in search_paths() {
        if path.exists() {
            tracing::debug!(path = %path.display(), "loading provider configuration");
            return from_path(&path);
        }
    }

    Ok(ProvidersFile::default())
}

/// Loads configuration from a specific file path.
///
/// # Errors
///
/// Returns an `INVALID_CONFIG` error if the file cannot be read or does not
/// match the expected schema.
pub fn from_path(path: &Path) -> Result<ProvidersFile, ProviderError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ProviderError::invalid_config(
            "config_file",
            format!("failed to read '{}': {}", path.display(), e),
        )
    })?;

    from_str(&contents).map_err(|e| {
        ProviderError::invalid_config(
            "config_file",
            format!("failed to parse '{}': {}", path.display(), e.message()),
        )
    })
}

/// Parses configuration from a TOML string.
///
/// # Errors
///
/// Returns an `INVALID_CONFIG` error if the TOML is invalid or doesn't match
/// the schema.
pub fn from_str(toml_str: &str) -> Result<ProvidersFile, ProviderError> {
    let file: ProvidersFile = toml::from_str(toml_str)
        .map_err(|e| ProviderError::invalid_config("config", format!("invalid TOML: {e}")))?;

    for (name, provider) in &file.providers {
        if let Some(policy) = provider.rate_limit {
            policy.validate().map_err(|e| {
                ProviderError::invalid_config(
                    format!("providers.{name}.rate_limit"),
                    e.message().to_string(),
                )
            })?;
        }
    }

    if let Some(ref name) = file.default_provider {
        if !file.providers.contains_key(name) {
            return Err(ProviderError::invalid_config(
                "default_provider",
                format!("no provider named '{name}' is defined"),
            ));
        }
    }

    Ok(file)
}

/// Returns the paths that would be searched for configuration files.
#[must_use]
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_CONFIG_NAME)];

    if let Some(dir) = xdg_config_dir() {
        paths.push(dir.join(XDG_CONFIG_NAME));
    }

    paths
}

/// Returns the crate's directory under the platform configuration directory.
#[must_use]
pub fn xdg_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME))
}
