//! Configuration loading and management
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config: ~/.config/canopy/config.toml
//! 3. Explicit config file
//! 4. Environment variables: CANOPY_*
//!
//! Values are read once when the service is constructed.
//!
//! # Example Config
//!
//! ```toml
//! workspaces_root = "/home/me/work"
//! repos_root = "/home/me/.canopy/repos"
//!
//! [executor]
//! pool_size = 8
//!
//! [retry]
//! max_attempts = 5
//! initial_delay_ms = 250
//!
//! [lock]
//! timeout_ms = 10000
//! stale_after_secs = 900
//!
//! [hooks]
//! post_create = ["npm ci"]
//! pre_close = [{ command = "make clean", continue_on_error = true }]
//! ```

mod defaults;
mod load;
mod types;
mod validate;

#[cfg(test)]
mod tests_loading;

pub use load::{global_config_path, load_config, load_toml_file};
pub use types::{
    CacheConfig, Config, ExecutorConfig, HookSpec, HooksConfig, LockConfig, RetryConfig,
};
