//! Configuration validation

use super::types::Config;
use crate::{executor::MAX_POOL_SIZE, Error, Result};

impl Config {
    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any values are out of range or invalid
    pub fn validate(&self) -> Result<()> {
        if self.executor.pool_size == 0 || self.executor.pool_size > MAX_POOL_SIZE {
            return Err(Error::invalid_config(format!(
                "executor.pool_size must be 1-{MAX_POOL_SIZE}"
            )));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(Error::invalid_config("retry.max_attempts must be at least 1"));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(Error::invalid_config(
                "retry.initial_delay_ms cannot exceed retry.max_delay_ms",
            ));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(Error::invalid_config("retry.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(Error::invalid_config("retry.jitter must be within 0.0-1.0"));
        }
        if retry.network_timeout_secs == 0 || retry.local_timeout_secs == 0 {
            return Err(Error::invalid_config("retry timeouts must be positive"));
        }

        if self.lock.timeout_ms == 0 || self.lock.stale_after_secs == 0 {
            return Err(Error::invalid_config(
                "lock.timeout_ms and lock.stale_after_secs must be positive",
            ));
        }
        if self.lock.poll_interval_ms == 0 || self.lock.poll_interval_ms >= self.lock.timeout_ms {
            return Err(Error::invalid_config(
                "lock.poll_interval_ms must be positive and below lock.timeout_ms",
            ));
        }

        if self.cache.metadata_ttl_secs == 0 || self.cache.usage_ttl_secs == 0 {
            return Err(Error::invalid_config("cache TTLs must be positive"));
        }

        if self
            .hooks
            .post_create
            .iter()
            .chain(&self.hooks.pre_close)
            .any(|hook| hook.command.trim().is_empty())
        {
            return Err(Error::invalid_config("hook commands cannot be empty"));
        }

        Ok(())
    }
}
