//! Shared harness: a service over in-memory fakes rooted in a temp dir.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{path::PathBuf, sync::Arc};

use canopy_core::{
    config::HookSpec,
    ports::{GitAdapter, HookExecutor, WorkspaceStore},
    testing::{FakeGit, MemoryStore, RecordingHooks},
    Config, Repo, WorkspaceService,
};
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub git: Arc<FakeGit>,
    pub store: Arc<MemoryStore>,
    pub hooks: Arc<RecordingHooks>,
    pub service: WorkspaceService,
}

/// Fast retries and a short lock timeout.
pub fn test_config(root: &std::path::Path) -> Config {
    let mut config = Config {
        workspaces_root: root.join("workspaces"),
        repos_root: root.join("repos"),
        state_dir: root.join("state"),
        ..Config::default()
    };
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter = 0.0;
    config.lock.timeout_ms = 200;
    config.lock.poll_interval_ms = 10;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_hooks(post_create: &[&str], pre_close: &[&str]) -> Self {
        Self::with_config(|config| {
            config.hooks.post_create = post_create.iter().copied().map(HookSpec::new).collect();
            config.hooks.pre_close = pre_close.iter().copied().map(HookSpec::new).collect();
        })
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        Self::build(MemoryStore::new(), adjust)
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self::build(store, |_| {})
    }

    fn build(store: MemoryStore, adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut config = test_config(dir.path());
        adjust(&mut config);
        config.validate().expect("valid test config");

        let git = Arc::new(FakeGit::new(config.repos_root.clone()));
        let store = Arc::new(store);
        let hooks = Arc::new(RecordingHooks::new());
        let git_port: Arc<dyn GitAdapter> = git.clone();
        let store_port: Arc<dyn WorkspaceStore> = store.clone();
        let hooks_port: Arc<dyn HookExecutor> = hooks.clone();
        let service = WorkspaceService::new(config, git_port, store_port, hooks_port);
        Self {
            dir,
            git,
            store,
            hooks,
            service,
        }
    }

    pub fn workspace_dir(&self, id: &str) -> PathBuf {
        self.service.workspace_dir(id)
    }
}

pub fn repos(names: &[&str]) -> Vec<Repo> {
    names
        .iter()
        .map(|name| Repo::new(*name, format!("git@example.com:org/{name}.git")))
        .collect()
}
