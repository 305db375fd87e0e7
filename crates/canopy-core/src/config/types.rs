//! Configuration structure definitions

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding one subdirectory per workspace
    pub workspaces_root: PathBuf,
    /// Directory holding the canonical bare clones (`<name>.git`)
    pub repos_root: PathBuf,
    /// Directory for metadata, archive records and lock markers
    pub state_dir: PathBuf,
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub lock: LockConfig,
    pub cache: CacheConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub pool_size: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction in `[0, 1]` of each delay that may be added or subtracted
    pub jitter: f64,
    pub network_timeout_secs: u64,
    pub local_timeout_secs: u64,
}

impl RetryConfig {
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub const fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub const fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_ms: u64,
    pub stale_after_secs: u64,
    pub poll_interval_ms: u64,
}

impl LockConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub metadata_ttl_secs: u64,
    pub usage_ttl_secs: u64,
}

impl CacheConfig {
    pub const fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    pub const fn usage_ttl(&self) -> Duration {
        Duration::from_secs(self.usage_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HooksConfig {
    pub post_create: Vec<HookSpec>,
    pub pre_close: Vec<HookSpec>,
    /// Global continue-on-error; a hook's own flag takes precedence
    pub continue_on_error: bool,
    /// Default per-hook timeout
    pub timeout_secs: u64,
}

/// One lifecycle hook.
///
/// In TOML a hook is either a bare command string or a table:
///
/// ```toml
/// [hooks]
/// post_create = ["npm ci", { command = "make bootstrap", timeout_secs = 600 }]
/// ```
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HookSpec {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
}

impl HookSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout_secs: None,
            continue_on_error: None,
        }
    }

    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub const fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = Some(continue_on_error);
        self
    }
}

impl<'de> Deserialize<'de> for HookSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawHook {
            Command(String),
            Table {
                command: String,
                timeout_secs: Option<u64>,
                continue_on_error: Option<bool>,
            },
        }

        Ok(match RawHook::deserialize(deserializer)? {
            RawHook::Command(command) => Self::new(command),
            RawHook::Table {
                command,
                timeout_secs,
                continue_on_error,
            } => Self {
                command,
                timeout_secs,
                continue_on_error,
            },
        })
    }
}
