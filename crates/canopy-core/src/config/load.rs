//! Configuration loading from files and environment
//!
//! This module handles loading configuration from:
//! 1. Built-in defaults
//! 2. Global config: ~/.config/canopy/config.toml
//! 3. An explicit config file (CLI `--config`)
//! 4. Environment variables: CANOPY_*
//!
//! Files are partial: any key they leave out keeps the value from the
//! previous layer.

use std::path::{Path, PathBuf};

use super::types::Config;
use crate::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// PUBLIC API
// ═══════════════════════════════════════════════════════════════════════════

/// Load configuration from all sources with hierarchy
///
/// # Errors
///
/// Returns error if:
/// - A config file is malformed TOML
/// - An explicit config file does not exist
/// - An environment override cannot be parsed
/// - Config values fail validation
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut layered = toml::Value::try_from(Config::default())
        .map_err(|e| Error::internal(format!("Failed to serialize default config: {e}")))?;

    if let Some(global_path) = global_config_path().filter(|path| path.exists()) {
        tracing::debug!("Loading global config from {}", global_path.display());
        merge_values(&mut layered, load_toml_file(&global_path)?);
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::invalid_config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        tracing::debug!("Loading config from {}", path.display());
        merge_values(&mut layered, load_toml_file(path)?);
    }

    let config: Config = layered.try_into()?;
    let config = config.apply_env_vars()?;
    config.validate()?;
    Ok(config)
}

/// Get path to global config file
pub fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "canopy")
        .map(|proj_dirs| proj_dirs.config_dir().join("config.toml"))
}

/// Parse a TOML config file into an untyped value for layering
///
/// # Errors
///
/// Returns error if the path is a directory, cannot be read, or is malformed
pub fn load_toml_file(path: &Path) -> Result<toml::Value> {
    if path.is_dir() {
        return Err(Error::invalid_config(format!(
            "Config path is a directory, not a file: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::io_error(format!("Failed to read config file {}: {e}", path.display()))
    })?;

    content.parse::<toml::Value>().map_err(|e| {
        Error::invalid_config(format!(
            "Failed to parse config file {}: {e}",
            path.display()
        ))
    })
}

/// Deep-merge `overlay` into `base`; tables merge key by key, everything
/// else (including arrays) is replaced.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ENVIRONMENT VARIABLE OVERRIDES
// ═══════════════════════════════════════════════════════════════════════════

impl Config {
    /// Apply `CANOPY_*` environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns error if environment variable values are invalid
    pub fn apply_env_vars(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup("CANOPY_WORKSPACES_ROOT") {
            self.workspaces_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("CANOPY_REPOS_ROOT") {
            self.repos_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("CANOPY_STATE_DIR") {
            self.state_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("CANOPY_POOL_SIZE") {
            self.executor.pool_size = parse_env("CANOPY_POOL_SIZE", &value)?;
        }
        if let Some(value) = lookup("CANOPY_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("CANOPY_RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("CANOPY_LOCK_TIMEOUT_MS") {
            self.lock.timeout_ms = parse_env("CANOPY_LOCK_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("CANOPY_LOCK_STALE_AFTER_SECS") {
            self.lock.stale_after_secs = parse_env("CANOPY_LOCK_STALE_AFTER_SECS", &value)?;
        }
        if let Some(value) = lookup("CANOPY_METADATA_TTL_SECS") {
            self.cache.metadata_ttl_secs = parse_env("CANOPY_METADATA_TTL_SECS", &value)?;
        }
        if let Some(value) = lookup("CANOPY_USAGE_TTL_SECS") {
            self.cache.usage_ttl_secs = parse_env("CANOPY_USAGE_TTL_SECS", &value)?;
        }
        if let Some(value) = lookup("CANOPY_HOOKS_CONTINUE_ON_ERROR") {
            self.hooks.continue_on_error = parse_env("CANOPY_HOOKS_CONTINUE_ON_ERROR", &value)?;
        }
        Ok(self)
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::invalid_config(format!("Invalid {key} value '{value}': {e}")))
}
