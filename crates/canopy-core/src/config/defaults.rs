//! Default value implementations

use std::path::PathBuf;

use super::types::{CacheConfig, Config, ExecutorConfig, HooksConfig, LockConfig, RetryConfig};

impl Default for Config {
    fn default() -> Self {
        let base = default_base_dir();
        let state_dir = directories::ProjectDirs::from("", "", "canopy")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| base.join("state"));
        Self {
            workspaces_root: base.join("workspaces"),
            repos_root: base.join("repos"),
            state_dir,
            executor: ExecutorConfig::default(),
            retry: RetryConfig::default(),
            lock: LockConfig::default(),
            cache: CacheConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

/// `~/canopy`, or `./.canopy` when no home directory can be determined.
fn default_base_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join("canopy"))
        .unwrap_or_else(|| PathBuf::from(".canopy"))
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.2,
            network_timeout_secs: 300,
            local_timeout_secs: 30,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            stale_after_secs: 600,
            poll_interval_ms: 50,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: 30,
            usage_ttl_secs: 60,
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            post_create: Vec::new(),
            pre_close: Vec::new(),
            continue_on_error: false,
            timeout_secs: 300,
        }
    }
}
