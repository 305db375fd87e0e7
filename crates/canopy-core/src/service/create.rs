//! Workspace creation

use std::{collections::HashSet, path::PathBuf, sync::Arc};

use tokio_util::sync::CancellationToken;

use super::{remove_dir_if_exists, remove_worktrees_best_effort, WorkspaceService};
use crate::{
    domain::{validate_branch, validate_repo_name, validate_workspace_id, Repo, Workspace},
    executor::RunOptions,
    ports::{HookContext, HookReport, HookStage},
    retry::OperationClass,
    transaction::Transaction,
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub id: String,
    pub branch: String,
    pub repos: Vec<Repo>,
}

impl CreateRequest {
    pub fn new(id: impl Into<String>, branch: impl Into<String>, repos: Vec<Repo>) -> Self {
        Self {
            id: id.into(),
            branch: branch.into(),
            repos,
        }
    }

    fn validate(&self) -> Result<()> {
        validate_workspace_id(&self.id)?;
        validate_branch(&self.branch)?;
        if self.repos.is_empty() {
            return Err(Error::invalid_input("a workspace needs at least one repository"));
        }
        let mut seen = HashSet::new();
        for repo in &self.repos {
            validate_repo_name(&repo.name)?;
            if !seen.insert(repo.name.as_str()) {
                return Err(Error::invalid_input(format!(
                    "repository '{}' listed more than once",
                    repo.name
                )));
            }
        }
        Ok(())
    }
}

/// A created (or restored) workspace.
///
/// Post-create hooks run after the workspace exists; their failure is
/// reported here and never undoes the creation.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub workspace: Workspace,
    pub path: PathBuf,
    pub hooks: Option<HookReport>,
    pub hook_error: Option<Error>,
}

impl WorkspaceService {
    /// Create a workspace with one worktree per repository.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a bad id, branch or repository list
    /// - `WorkspaceExists` if the id is taken
    /// - `WorkspaceLocked` if another operation holds the id
    /// - any clone or worktree failure, after everything was rolled back
    #[tracing::instrument(skip_all, fields(id = %request.id))]
    pub async fn create(
        &self,
        request: CreateRequest,
        cancel: &CancellationToken,
    ) -> Result<CreateOutcome> {
        request.validate()?;
        let _guard = self.lock(&request.id, cancel).await?;

        self.cache.invalidate(&request.id);
        if self.cache.get(&request.id).await?.is_some() {
            return Err(Error::WorkspaceExists(request.id));
        }
        if tokio::fs::try_exists(self.workspace_dir(&request.id))
            .await
            .unwrap_or(false)
        {
            return Err(Error::WorkspaceExists(request.id));
        }

        let workspace = Workspace::new(request.id, request.branch, request.repos);
        let path = self.create_locked(&workspace, cancel).await?;
        tracing::info!(repos = workspace.repos.len(), "Created workspace");

        Ok(self.finish_create(workspace, path, cancel).await)
    }

    /// Write metadata, directory and worktrees as one transaction.
    /// Caller holds the lock and has checked the id is free.
    pub(super) async fn create_locked(
        &self,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let id = workspace.id.clone();
        let dir = self.workspace_dir(&id);

        let (store, cache) = (Arc::clone(&self.store), self.cache.clone());
        let (undo_store, undo_cache) = (Arc::clone(&self.store), self.cache.clone());
        let (record, undo_id) = (workspace.clone(), id.clone());

        let (mkdir_path, rmdir_path) = (dir.clone(), dir.clone());

        let worktrees = self.worktree_step(workspace, cancel);

        let (result, report) = Transaction::new(format!("create {id}"))
            .step(
                "write metadata",
                move || async move {
                    let created = store.create(&record).await;
                    cache.invalidate(&record.id);
                    created.map(|_| ())
                },
                move || async move {
                    let deleted = undo_store.delete(&undo_id).await;
                    undo_cache.invalidate(&undo_id);
                    deleted
                },
            )
            .step(
                "create directory",
                move || async move {
                    tokio::fs::create_dir_all(&mkdir_path).await.map_err(|e| {
                        Error::io_error(format!(
                            "Failed to create '{}': {e}",
                            mkdir_path.display()
                        ))
                    })
                },
                move || async move { remove_dir_if_exists(&rmdir_path).await },
            )
            .step_no_rollback("create worktrees", worktrees)
            .execute_with_report()
            .await;

        if !report.is_clean() {
            tracing::warn!(
                failures = report.failures.len(),
                "Create rollback left residual state"
            );
        }
        result.map(|()| dir)
    }

    /// Ensure canonical clones and create worktrees in parallel. On failure
    /// every worktree of the workspace is removed before returning.
    fn worktree_step(
        &self,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<()>> + Send + 'static {
        let git = Arc::clone(&self.git);
        let retry = self.retry.clone();
        let undo_retry = self.retry.clone();
        let executor = self.executor;
        let dir = self.workspace_dir(&workspace.id);
        let branch = workspace.branch.clone();
        let repos = workspace.repos.clone();
        let cancel = cancel.clone();

        move || {
            Box::pin(async move {
                let task_git = Arc::clone(&git);
                let task_dir = dir.clone();
                let report = executor
                    .run(
                        &repos,
                        move |repo: Repo, token: CancellationToken| {
                            let git = Arc::clone(&task_git);
                            let retry = retry.clone();
                            let worktree = task_dir.join(&repo.name);
                            let branch = branch.clone();
                            async move {
                                let operation = format!("clone {}", repo.name);
                                let canonical = retry
                                    .execute(&operation, OperationClass::Network, None, &token, || {
                                        git.ensure_canonical(&repo.url, &repo.name, &token)
                                    })
                                    .await?;
                                let operation = format!("create worktree {}", repo.name);
                                retry
                                    .bounded(
                                        &operation,
                                        OperationClass::Local,
                                        &token,
                                        git.create_worktree(&canonical, &worktree, &branch),
                                    )
                                    .await
                            }
                        },
                        RunOptions::parallel(),
                        &cancel,
                    )
                    .await;

                let Some(error) = report.error else {
                    return Ok(());
                };

                // Tasks stopped mid-way may have registered a worktree
                // without reporting success, so every repository is cleaned.
                remove_worktrees_best_effort(git.as_ref(), &undo_retry, &dir, &repos).await;
                Err(error)
            })
        }
    }

    /// Run post-create hooks, folding their failure into the outcome.
    pub(super) async fn finish_create(
        &self,
        workspace: Workspace,
        path: PathBuf,
        cancel: &CancellationToken,
    ) -> CreateOutcome {
        let specs = &self.config.hooks.post_create;
        if specs.is_empty() {
            return CreateOutcome {
                workspace,
                path,
                hooks: None,
                hook_error: None,
            };
        }

        let ctx = HookContext::for_workspace(&workspace, &path);
        match self.hooks.run(HookStage::PostCreate, specs, &ctx, cancel).await {
            Ok(report) => CreateOutcome {
                workspace,
                path,
                hooks: Some(report),
                hook_error: None,
            },
            Err(e) => {
                tracing::warn!(id = %workspace.id, error = %e, "Post-create hook failed; workspace kept");
                CreateOutcome {
                    workspace,
                    path,
                    hooks: None,
                    hook_error: Some(e),
                }
            }
        }
    }
}
