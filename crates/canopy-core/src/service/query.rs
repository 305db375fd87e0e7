//! Read-only operations. None of these take the workspace lock.

use std::{path::PathBuf, sync::Arc};

use tokio_util::sync::CancellationToken;

use super::WorkspaceService;
use crate::{
    disk_usage::DiskUsage,
    domain::{Repo, Workspace, WorkspaceState},
    executor::{RepoTaskResult, RunOptions, RunReport},
    ports::{CommandOutput, RepoStatus},
    Error, Result,
};

/// One row of `list`.
#[derive(Debug, Clone)]
pub struct WorkspaceSummary {
    pub workspace: Workspace,
    pub state: WorkspaceState,
    /// Present only for active workspaces
    pub path: Option<PathBuf>,
    pub usage: Option<DiskUsage>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceStatus {
    pub workspace: Workspace,
    pub path: PathBuf,
    /// Per-repository status in workspace order; failures are kept per repo
    pub repos: Vec<RepoTaskResult<RepoStatus>>,
}

impl WorkspaceService {
    /// All active workspaces, plus archived ones when `include_closed`.
    ///
    /// Active rows carry the `locked` flag and cached disk usage.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be listed
    #[tracing::instrument(skip_all)]
    pub async fn list(&self, include_closed: bool) -> Result<Vec<WorkspaceSummary>> {
        let mut summaries = Vec::new();

        // Taken before the listing so a write that lands meanwhile wins.
        let ticket = self.cache.ticket();
        for (mut workspace, location) in self.store.list().await? {
            self.cache
                .fill(ticket, &workspace.id, workspace.clone(), location);
            workspace.locked = self.locks.is_locked(&workspace.id).await;
            let path = self.workspace_dir(&workspace.id);
            let usage = match self.usage.usage(&path).await {
                Ok(usage) => Some(usage),
                Err(e) => {
                    tracing::debug!(id = %workspace.id, error = %e, "No disk usage");
                    None
                }
            };
            summaries.push(WorkspaceSummary {
                state: workspace.state(),
                workspace,
                path: Some(path),
                usage,
            });
        }

        if include_closed {
            for workspace in self.store.list_closed().await? {
                summaries.push(WorkspaceSummary {
                    state: WorkspaceState::Archived,
                    workspace,
                    path: None,
                    usage: None,
                });
            }
        }

        summaries.sort_by(|a, b| {
            a.workspace
                .id
                .cmp(&b.workspace.id)
                .then_with(|| a.workspace.closed_at.cmp(&b.workspace.closed_at))
        });
        Ok(summaries)
    }

    /// Git status of every repository of a workspace.
    ///
    /// # Errors
    ///
    /// - `WorkspaceNotFound` if no active workspace has this id
    /// - `OperationCancelled` if `cancel` fires
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn status(&self, id: &str, cancel: &CancellationToken) -> Result<WorkspaceStatus> {
        let (mut workspace, _) = self.load_active(id).await?;
        workspace.locked = self.locks.is_locked(id).await;
        let path = self.workspace_dir(id);
        let report = self.status_all(&path, &workspace.repos, cancel).await;

        if let Some(error) = report.error {
            return Err(error);
        }
        Ok(WorkspaceStatus {
            workspace,
            path,
            repos: report.results,
        })
    }

    /// Directory of an active workspace.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceNotFound` if no active workspace has this id
    pub async fn workspace_path(&self, id: &str) -> Result<PathBuf> {
        self.load_active(id).await?;
        Ok(self.workspace_dir(id))
    }

    /// Run a command in every repository of a workspace.
    ///
    /// The returned report holds one result per repository; with
    /// continue-on-error off, `report.error` is the first failure.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `args` is empty
    /// - `WorkspaceNotFound` if no active workspace has this id
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn run(
        &self,
        id: &str,
        args: Vec<String>,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunReport<CommandOutput>> {
        if args.is_empty() {
            return Err(Error::invalid_input("no command given"));
        }
        let (workspace, _) = self.load_active(id).await?;

        let git = Arc::clone(&self.git);
        let dir = self.workspace_dir(id);
        let args = Arc::new(args);
        let report = self
            .executor
            .run(
                &workspace.repos,
                move |repo: Repo, token: CancellationToken| {
                    let git = Arc::clone(&git);
                    let args = Arc::clone(&args);
                    let worktree = dir.join(&repo.name);
                    async move { git.run_command(&worktree, &args, &token).await }
                },
                options,
                cancel,
            )
            .await;

        tracing::info!(
            repos = report.results.len(),
            failed = report.failures().count(),
            "Ran command across repositories"
        );
        Ok(report)
    }
}
