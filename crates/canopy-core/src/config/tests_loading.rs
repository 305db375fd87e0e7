//! Loading and validation tests for configuration

use std::{collections::HashMap, io::Write, path::PathBuf};

use serial_test::serial;

use super::{load_config, load_toml_file, Config, HookSpec};
use crate::{Error, ErrorKind, Result};

fn write_config(dir: &tempfile::TempDir, body: &str) -> Result<PathBuf> {
    let path = dir.path().join("config.toml");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(body.as_bytes())?;
    Ok(path)
}

#[test]
fn test_defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.executor.pool_size, 4);
    assert_eq!(config.retry.network_timeout_secs, 300);
    assert_eq!(config.retry.local_timeout_secs, 30);
    assert_eq!(config.cache.usage_ttl_secs, 60);
}

#[test]
#[serial]
fn test_partial_file_keeps_other_defaults() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(
        &dir,
        r#"
workspaces_root = "/tmp/canopy-ws"

[retry]
max_attempts = 5

[hooks]
post_create = ["npm ci", { command = "make", timeout_secs = 10, continue_on_error = true }]
"#,
    )?;

    let config = load_config(Some(&path))?;
    assert_eq!(config.workspaces_root, PathBuf::from("/tmp/canopy-ws"));
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.initial_delay_ms, 500);
    assert_eq!(config.executor.pool_size, 4);
    assert_eq!(
        config.hooks.post_create,
        vec![
            HookSpec::new("npm ci"),
            HookSpec::new("make")
                .with_timeout_secs(10)
                .with_continue_on_error(true),
        ]
    );
    Ok(())
}

#[test]
fn test_malformed_toml_returns_config_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(&dir, "workspaces_root = \n invalid toml [[[")?;
    let err = load_toml_file(&path).err();
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::InvalidConfig));
    Ok(())
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    let result = load_config(Some(std::path::Path::new("/nonexistent/canopy.toml")));
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn test_env_overrides() -> Result<()> {
    let env: HashMap<&str, &str> = [
        ("CANOPY_POOL_SIZE", "8"),
        ("CANOPY_LOCK_TIMEOUT_MS", "200"),
        ("CANOPY_STATE_DIR", "/tmp/canopy-state"),
    ]
    .into_iter()
    .collect();

    let config = Config::default().apply_env_from(|key| env.get(key).map(ToString::to_string))?;
    assert_eq!(config.executor.pool_size, 8);
    assert_eq!(config.lock.timeout_ms, 200);
    assert_eq!(config.state_dir, PathBuf::from("/tmp/canopy-state"));
    Ok(())
}

#[test]
fn test_env_override_parse_error() {
    let result = Config::default().apply_env_from(|key| {
        (key == "CANOPY_POOL_SIZE").then(|| "lots".to_string())
    });
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
#[serial]
fn test_process_env_is_applied() -> Result<()> {
    std::env::set_var("CANOPY_RETRY_MAX_ATTEMPTS", "7");
    let result = load_config(None);
    std::env::remove_var("CANOPY_RETRY_MAX_ATTEMPTS");
    assert_eq!(result?.retry.max_attempts, 7);
    Ok(())
}

#[test]
fn test_validation_rejects_bad_retry_settings() {
    let mut config = Config::default();
    config.retry.multiplier = 0.5;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.retry.initial_delay_ms = 20_000;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.retry.max_attempts = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.retry.jitter = 1.5;
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_pool_size_out_of_range() {
    let mut config = Config::default();
    config.executor.pool_size = 0;
    assert!(config.validate().is_err());
    config.executor.pool_size = crate::executor::MAX_POOL_SIZE + 1;
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_poll_interval_above_timeout() {
    let mut config = Config::default();
    config.lock.poll_interval_ms = config.lock.timeout_ms;
    assert!(config.validate().is_err());
}
