//! Mutations of an active workspace: repositories, name and branch

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{remove_dir_if_exists, WorkspaceService};
use crate::{
    domain::{validate_branch, validate_repo_name, validate_workspace_id, Repo, Workspace},
    executor::{RunOptions, RunReport},
    retry::OperationClass,
    transaction::Transaction,
    Error, Result,
};

impl WorkspaceService {
    /// Add a repository to a workspace.
    ///
    /// # Errors
    ///
    /// - `RepoInUse` if the workspace already has a repository of that name
    /// - clone or worktree failures; a worktree created before a failed
    ///   metadata write is removed again
    #[tracing::instrument(skip_all, fields(id = %id, repo = %repo.name))]
    pub async fn add_repo(
        &self,
        id: &str,
        repo: Repo,
        cancel: &CancellationToken,
    ) -> Result<Workspace> {
        validate_workspace_id(id)?;
        validate_repo_name(&repo.name)?;
        let _guard = self.lock(id, cancel).await?;
        let (workspace, _) = self.load_for_update(id).await?;

        if workspace.has_repo(&repo.name) {
            return Err(Error::RepoInUse {
                repo: repo.name,
                workspace: id.to_string(),
            });
        }

        let operation = format!("clone {}", repo.name);
        let canonical = self
            .retry
            .execute(&operation, OperationClass::Network, None, cancel, || {
                self.git.ensure_canonical(&repo.url, &repo.name, cancel)
            })
            .await?;

        let worktree = self.workspace_dir(id).join(&repo.name);
        let mut updated = workspace.clone();
        updated.repos.push(repo);

        let (git, retry, add_canonical, add_worktree, branch) = (
            Arc::clone(&self.git),
            self.retry.clone(),
            canonical.clone(),
            worktree.clone(),
            workspace.branch.clone(),
        );
        let (undo_git, undo_retry, undo_canonical, undo_worktree) =
            (Arc::clone(&self.git), self.retry.clone(), canonical, worktree);
        let add_cancel = cancel.clone();
        let service = self.clone();
        let record = updated.clone();

        Transaction::new(format!("add repo to {id}"))
            .step(
                "create worktree",
                move || async move {
                    retry
                        .bounded(
                            "create worktree",
                            OperationClass::Local,
                            &add_cancel,
                            git.create_worktree(&add_canonical, &add_worktree, &branch),
                        )
                        .await
                },
                move || async move {
                    undo_retry
                        .bounded(
                            "remove worktree",
                            OperationClass::Local,
                            &CancellationToken::new(),
                            undo_git.remove_worktree(&undo_canonical, &undo_worktree),
                        )
                        .await
                },
            )
            .step_no_rollback("save metadata", move || async move {
                service.persist(&record).await.map(|_| ())
            })
            .execute()
            .await?;

        tracing::info!("Added repository");
        Ok(updated)
    }

    /// Remove a repository's worktree from a workspace.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the workspace has no repository of that name
    /// - `RepoNotClean` if the worktree has local work and `force` is off
    #[tracing::instrument(skip_all, fields(id = %id, repo = %name))]
    pub async fn remove_repo(
        &self,
        id: &str,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Workspace> {
        validate_workspace_id(id)?;
        let _guard = self.lock(id, cancel).await?;
        let (workspace, _) = self.load_for_update(id).await?;

        let repo = workspace.repo(name).cloned().ok_or_else(|| {
            Error::invalid_input(format!(
                "repository '{name}' is not part of workspace '{id}'"
            ))
        })?;

        if !force {
            self.ensure_clean(&workspace, std::slice::from_ref(&repo), cancel)
                .await?;
        }

        let worktree = self.workspace_dir(id).join(name);
        let removed = self
            .retry
            .bounded(
                "remove worktree",
                OperationClass::Local,
                cancel,
                self.git
                    .remove_worktree(&self.git.canonical_path(name), &worktree),
            )
            .await;
        if let Err(e) = removed {
            if !force {
                return Err(e);
            }
            tracing::warn!(error = %e, "Worktree removal failed; deleting directory");
            remove_dir_if_exists(&worktree).await?;
        }

        let mut updated = workspace;
        updated.repos.retain(|r| r.name != name);
        self.persist(&updated).await?;

        tracing::info!("Removed repository");
        Ok(updated)
    }

    /// Rename a workspace, moving its directory and metadata.
    ///
    /// # Errors
    ///
    /// - `WorkspaceNotFound` if `id` is not active
    /// - `WorkspaceExists` if `new_id` is already taken
    /// - `WorkspaceLocked` if either id is locked
    #[tracing::instrument(skip_all, fields(id = %id, new_id = %new_id))]
    pub async fn rename(
        &self,
        id: &str,
        new_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Workspace> {
        validate_workspace_id(id)?;
        validate_workspace_id(new_id)?;
        if id == new_id {
            return Err(Error::invalid_input("new id is the same as the old one"));
        }

        // Fixed order, so opposite renames cannot each hold one lock.
        let (first, second) = if id < new_id { (id, new_id) } else { (new_id, id) };
        let _first_guard = self.lock(first, cancel).await?;
        let _second_guard = self.lock(second, cancel).await?;

        let (workspace, _) = self.load_for_update(id).await?;
        self.cache.invalidate(new_id);
        if self.cache.get(new_id).await?.is_some() {
            return Err(Error::WorkspaceExists(new_id.to_string()));
        }

        let old_dir = self.workspace_dir(id);
        let new_dir = self.workspace_dir(new_id);
        if tokio::fs::try_exists(&new_dir).await.unwrap_or(false) {
            return Err(Error::WorkspaceExists(new_id.to_string()));
        }

        let renamed = Workspace {
            id: new_id.to_string(),
            ..workspace.clone()
        };

        let (from, to) = (old_dir.clone(), new_dir.clone());
        let (back_from, back_to) = (new_dir.clone(), old_dir.clone());
        let (git, retry, repos) = (Arc::clone(&self.git), self.retry.clone(), workspace.repos.clone());
        let (undo_git, undo_retry, undo_repos) =
            (Arc::clone(&self.git), self.retry.clone(), workspace.repos.clone());
        let repair_dir = new_dir.clone();

        let (store, cache, record) = (Arc::clone(&self.store), self.cache.clone(), renamed.clone());
        let (undo_store, undo_cache, new_key) =
            (Arc::clone(&self.store), self.cache.clone(), new_id.to_string());
        let (old_store, old_cache, old_key) =
            (Arc::clone(&self.store), self.cache.clone(), id.to_string());

        Transaction::new(format!("rename {id} to {new_id}"))
            .step(
                "move directory",
                move || async move { move_dir(&from, &to).await },
                move || async move {
                    move_dir(&back_from, &back_to).await?;
                    let cancel = CancellationToken::new();
                    for repo in &undo_repos {
                        let canonical = undo_git.canonical_path(&repo.name);
                        let repaired = undo_retry
                            .bounded(
                                "repair worktree",
                                OperationClass::Local,
                                &cancel,
                                undo_git.repair_worktree(&canonical, &back_to.join(&repo.name)),
                            )
                            .await;
                        if let Err(e) = repaired {
                            tracing::warn!(repo = %repo.name, "Failed to re-link worktree: {e}");
                        }
                    }
                    Ok(())
                },
            )
            .step_no_rollback("repair worktrees", move || async move {
                let cancel = CancellationToken::new();
                for repo in &repos {
                    let canonical = git.canonical_path(&repo.name);
                    retry
                        .bounded(
                            "repair worktree",
                            OperationClass::Local,
                            &cancel,
                            git.repair_worktree(&canonical, &repair_dir.join(&repo.name)),
                        )
                        .await?;
                }
                Ok(())
            })
            .step(
                "save metadata under new id",
                move || async move {
                    let created = store.create(&record).await;
                    cache.invalidate(&record.id);
                    created.map(|_| ())
                },
                move || async move {
                    let deleted = undo_store.delete(&new_key).await;
                    undo_cache.invalidate(&new_key);
                    deleted
                },
            )
            .step_no_rollback("delete old record", move || async move {
                let deleted = old_store.delete(&old_key).await;
                old_cache.invalidate(&old_key);
                deleted
            })
            .execute()
            .await?;

        self.cache.invalidate(id);
        self.cache.invalidate(new_id);
        self.usage.invalidate(&old_dir);
        tracing::info!("Renamed workspace");
        Ok(renamed)
    }

    /// Check out `branch` in every repository of the workspace.
    ///
    /// All or nothing: when a checkout or the metadata write fails, every
    /// repository is checked out back to the previous branch.
    ///
    /// # Errors
    ///
    /// Returns the first checkout failure; metadata keeps the old branch
    #[tracing::instrument(skip_all, fields(id = %id, branch = %branch))]
    pub async fn switch_branch(
        &self,
        id: &str,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<Workspace> {
        validate_workspace_id(id)?;
        validate_branch(branch)?;
        let _guard = self.lock(id, cancel).await?;
        let (workspace, _) = self.load_for_update(id).await?;

        let updated = Workspace {
            branch: branch.to_string(),
            ..workspace.clone()
        };

        let (service, target, forward_cancel) = (self.clone(), workspace.clone(), cancel.clone());
        let undo_service = self.clone();
        let previous = workspace;
        let (persist_service, record) = (self.clone(), updated.clone());
        let to_branch = branch.to_string();

        Transaction::new(format!("switch {id} to {branch}"))
            .step(
                "check out branch",
                move || async move {
                    let report = service
                        .checkout_all(&target, &to_branch, RunOptions::parallel(), &forward_cancel)
                        .await;
                    match report.error {
                        None => Ok(()),
                        Some(error) => {
                            // A failed step gets no rollback; undo partial checkouts here.
                            service.restore_branch(&target).await;
                            Err(error)
                        }
                    }
                },
                move || async move {
                    undo_service.restore_branch(&previous).await;
                    Ok(())
                },
            )
            .step_no_rollback("save metadata", move || async move {
                persist_service.persist(&record).await.map(|_| ())
            })
            .execute()
            .await?;

        tracing::info!("Switched branch");
        Ok(updated)
    }

    /// Check out `branch` in every repository, local budget per repo.
    async fn checkout_all(
        &self,
        workspace: &Workspace,
        branch: &str,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> RunReport<()> {
        let git = Arc::clone(&self.git);
        let retry = self.retry.clone();
        let dir = self.workspace_dir(&workspace.id);
        let target = branch.to_string();
        self.executor
            .run(
                &workspace.repos,
                move |repo: Repo, token: CancellationToken| {
                    let git = Arc::clone(&git);
                    let retry = retry.clone();
                    let worktree = dir.join(&repo.name);
                    let branch = target.clone();
                    async move {
                        let operation = format!("checkout {}", repo.name);
                        retry
                            .bounded(
                                &operation,
                                OperationClass::Local,
                                &token,
                                git.checkout(&worktree, &branch),
                            )
                            .await
                    }
                },
                options,
                cancel,
            )
            .await
    }

    /// Best-effort checkout of `workspace.branch` everywhere, ignoring
    /// caller cancellation.
    async fn restore_branch(&self, workspace: &Workspace) {
        let report = self
            .checkout_all(
                workspace,
                &workspace.branch,
                RunOptions::parallel().with_continue_on_error(true),
                &CancellationToken::new(),
            )
            .await;
        for failure in report.failures() {
            if let Some(error) = &failure.error {
                tracing::warn!(repo = %failure.repo, branch = %workspace.branch, "Failed to restore branch: {error}");
            }
        }
    }
}

async fn move_dir(from: &std::path::Path, to: &std::path::Path) -> Result<()> {
    tokio::fs::rename(from, to).await.map_err(|e| {
        Error::io_error(format!(
            "Failed to move '{}' to '{}': {e}",
            from.display(),
            to.display()
        ))
    })
}
