//! Workspace lifecycle orchestration
//!
//! [`WorkspaceService`] is the single entry point for every workspace
//! operation. Mutations take the workspace lock first and release it on
//! every exit path; reads never lock. Git, storage and hooks are reached only
//! through the injected ports.
//!
//! ```text
//! create ──▶ lock ──▶ Transaction[metadata, directory, worktrees] ──▶ hooks
//! close  ──▶ lock ──▶ clean gate ──▶ hooks ──▶ delete | archive
//! ```

mod close;
mod create;
mod query;
mod repos;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio_util::sync::CancellationToken;

pub use close::{CloseMode, CloseOptions, CloseOutcome};
pub use create::{CreateOutcome, CreateRequest};
pub use query::{WorkspaceStatus, WorkspaceSummary};

use crate::{
    config::Config,
    disk_usage::DiskUsageCache,
    domain::{validate_workspace_id, Repo, Workspace},
    executor::{RepoExecutor, RunOptions, RunReport},
    lock::{LockManager, WorkspaceLockGuard},
    metadata_cache::WorkspaceCache,
    ports::{GitAdapter, HookExecutor, Location, RepoStatus, WorkspaceStore},
    retry::{OperationClass, RetryPolicy},
    Error, Result,
};

/// Coordinates locks, caches, the executor and the ports.
#[derive(Clone)]
pub struct WorkspaceService {
    config: Arc<Config>,
    git: Arc<dyn GitAdapter>,
    store: Arc<dyn WorkspaceStore>,
    hooks: Arc<dyn HookExecutor>,
    cache: WorkspaceCache,
    usage: DiskUsageCache,
    locks: LockManager,
    executor: RepoExecutor,
    retry: RetryPolicy,
}

impl std::fmt::Debug for WorkspaceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceService")
            .field("workspaces_root", &self.config.workspaces_root)
            .field("executor", &self.executor)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl WorkspaceService {
    pub fn new(
        config: Config,
        git: Arc<dyn GitAdapter>,
        store: Arc<dyn WorkspaceStore>,
        hooks: Arc<dyn HookExecutor>,
    ) -> Self {
        Self {
            cache: WorkspaceCache::new(Arc::clone(&store), config.cache.metadata_ttl()),
            usage: DiskUsageCache::new(config.cache.usage_ttl()),
            locks: LockManager::from_config(&config.state_dir, &config.lock),
            executor: RepoExecutor::from_config(&config.executor),
            retry: RetryPolicy::from_config(&config.retry),
            config: Arc::new(config),
            git,
            store,
            hooks,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn cache(&self) -> &WorkspaceCache {
        &self.cache
    }

    /// Directory of workspace `id` (whether or not it exists).
    pub fn workspace_dir(&self, id: &str) -> PathBuf {
        self.config.workspaces_root.join(id)
    }

    async fn lock(&self, id: &str, cancel: &CancellationToken) -> Result<WorkspaceLockGuard> {
        self.locks
            .acquire(id, self.config.lock.timeout(), cancel)
            .await
    }

    /// Fresh read of an active workspace, bypassing any cached snapshot.
    /// Callers hold the workspace lock.
    async fn load_for_update(&self, id: &str) -> Result<(Workspace, Location)> {
        self.cache.invalidate(id);
        self.load_active(id).await
    }

    async fn load_active(&self, id: &str) -> Result<(Workspace, Location)> {
        validate_workspace_id(id)?;
        self.cache
            .get(id)
            .await?
            .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))
    }

    /// Save `workspace`; the cache entry is invalidated whether or not the
    /// write succeeded.
    async fn persist(&self, workspace: &Workspace) -> Result<Location> {
        let saved = self.store.save(workspace).await;
        self.cache.invalidate(&workspace.id);
        saved
    }

    /// Reject the close/removal of repositories with local work.
    async fn ensure_clean(
        &self,
        workspace: &Workspace,
        repos: &[Repo],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let report = self
            .status_all(&self.workspace_dir(&workspace.id), repos, cancel)
            .await;

        if let Some(error) = report.error {
            return Err(error);
        }
        for result in report.results {
            if let Some(error) = result.error {
                return Err(error);
            }
            let reason = result.output.as_ref().and_then(RepoStatus::unclean_reason);
            if let Some(reason) = reason {
                return Err(Error::RepoNotClean {
                    repo: result.repo,
                    reason,
                });
            }
        }
        Ok(())
    }

    /// `git status` of each repository under `dir`, local budget per repo.
    async fn status_all(
        &self,
        dir: &Path,
        repos: &[Repo],
        cancel: &CancellationToken,
    ) -> RunReport<RepoStatus> {
        let git = Arc::clone(&self.git);
        let retry = self.retry.clone();
        let dir = dir.to_path_buf();
        self.executor
            .run(
                repos,
                move |repo: Repo, token: CancellationToken| {
                    let git = Arc::clone(&git);
                    let retry = retry.clone();
                    let worktree = dir.join(&repo.name);
                    async move {
                        let operation = format!("status {}", repo.name);
                        retry
                            .bounded(&operation, OperationClass::Local, &token, git.status(&worktree))
                            .await
                    }
                },
                RunOptions::parallel().with_continue_on_error(true),
                cancel,
            )
            .await
    }
}

/// Remove the worktree of every repository in `repos`, logging instead of
/// failing. Runs on cleanup paths, so it ignores caller cancellation but
/// bounds each removal by the local budget. Worktrees whose directory never
/// appeared are still unregistered, since an interrupted `worktree add` can
/// leave a registration behind.
async fn remove_worktrees_best_effort(
    git: &dyn GitAdapter,
    retry: &RetryPolicy,
    dir: &Path,
    repos: &[Repo],
) {
    let cancel = CancellationToken::new();
    for repo in repos {
        let worktree = dir.join(&repo.name);
        let existed = tokio::fs::try_exists(&worktree).await.unwrap_or(true);
        let operation = format!("remove worktree {}", repo.name);
        let removed = retry
            .bounded(
                &operation,
                OperationClass::Local,
                &cancel,
                git.remove_worktree(&git.canonical_path(&repo.name), &worktree),
            )
            .await;
        match removed {
            Ok(()) => {}
            Err(e) if existed => {
                tracing::warn!(repo = %repo.name, path = %worktree.display(), "Failed to remove worktree: {e}");
            }
            Err(e) => {
                tracing::debug!(repo = %repo.name, "No worktree to remove: {e}");
            }
        }
    }
}

async fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_error(format!(
            "Failed to remove '{}': {e}",
            dir.display()
        ))),
    }
}
