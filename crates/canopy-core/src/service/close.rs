//! Closing and restoring workspaces

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{create::CreateOutcome, remove_dir_if_exists, remove_worktrees_best_effort, WorkspaceService};
use crate::{
    domain::{validate_workspace_id, Workspace},
    ports::{HookContext, HookReport, HookStage},
    transaction::Transaction,
    Error, Result,
};

/// What happens to a closed workspace's metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CloseMode {
    /// Remove everything
    #[default]
    Delete,
    /// Keep the metadata in the archive so the workspace can be restored
    Archive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseOptions {
    pub mode: CloseMode,
    /// Skip the clean-tree gate
    pub force: bool,
}

impl CloseOptions {
    pub const fn archive() -> Self {
        Self {
            mode: CloseMode::Archive,
            force: false,
        }
    }

    #[must_use]
    pub const fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub workspace: Workspace,
    pub mode: CloseMode,
    pub hooks: Option<HookReport>,
}

impl WorkspaceService {
    /// Close a workspace, deleting or archiving it.
    ///
    /// # Errors
    ///
    /// - `WorkspaceNotFound` if no active workspace has this id
    /// - `RepoNotClean` if a repository has local work and `force` is off
    /// - `HookFailed`/`HookTimeout` if a pre-close hook fails
    /// - `IoFailed` if the directory cannot be removed (archive is undone)
    #[tracing::instrument(skip_all, fields(id = %id, mode = ?options.mode))]
    pub async fn close(
        &self,
        id: &str,
        options: CloseOptions,
        cancel: &CancellationToken,
    ) -> Result<CloseOutcome> {
        validate_workspace_id(id)?;
        let _guard = self.lock(id, cancel).await?;
        let (workspace, _) = self.load_for_update(id).await?;

        if !options.force {
            self.ensure_clean(&workspace, &workspace.repos, cancel).await?;
        }

        let hooks = if self.config.hooks.pre_close.is_empty() {
            None
        } else {
            let ctx = HookContext::for_workspace(&workspace, self.workspace_dir(id));
            Some(
                self.hooks
                    .run(HookStage::PreClose, &self.config.hooks.pre_close, &ctx, cancel)
                    .await?,
            )
        };

        let workspace = match options.mode {
            CloseMode::Delete => {
                self.delete_locked(&workspace).await?;
                workspace
            }
            CloseMode::Archive => self.archive_locked(&workspace).await?,
        };

        tracing::info!(mode = ?options.mode, "Closed workspace");
        Ok(CloseOutcome {
            workspace,
            mode: options.mode,
            hooks,
        })
    }

    /// Remove worktrees, directory and metadata. Caller holds the lock.
    async fn delete_locked(&self, workspace: &Workspace) -> Result<()> {
        let dir = self.workspace_dir(&workspace.id);
        remove_worktrees_best_effort(self.git.as_ref(), &self.retry, &dir, &workspace.repos).await;
        remove_dir_if_exists(&dir).await?;
        self.usage.invalidate(&dir);

        let deleted = self.store.delete(&workspace.id).await;
        self.cache.invalidate(&workspace.id);
        deleted
    }

    /// Move metadata to the archive, then delete the directory. A failed
    /// directory removal puts the active record back.
    async fn archive_locked(&self, workspace: &Workspace) -> Result<Workspace> {
        let id = workspace.id.clone();
        let dir = self.workspace_dir(&id);

        let archived = Arc::new(std::sync::Mutex::new(None::<Workspace>));
        let slot = Arc::clone(&archived);

        let (store, cache, active) = (Arc::clone(&self.store), self.cache.clone(), workspace.clone());
        let (undo_store, undo_cache, original) =
            (Arc::clone(&self.store), self.cache.clone(), workspace.clone());
        let (git, retry, repos, rm_dir) = (
            Arc::clone(&self.git),
            self.retry.clone(),
            workspace.repos.clone(),
            dir.clone(),
        );

        Transaction::new(format!("archive {id}"))
            .step(
                "archive metadata",
                move || async move {
                    cache.invalidate(&active.id);
                    let closed = store.close(&active).await;
                    cache.invalidate(&active.id);
                    let closed = closed?;
                    *slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(closed);
                    Ok(())
                },
                move || async move {
                    undo_store.delete_closed(&original.id).await?;
                    let saved = undo_store.save(&original).await;
                    undo_cache.invalidate(&original.id);
                    saved.map(|_| ())
                },
            )
            .step_no_rollback("delete directory", move || async move {
                remove_worktrees_best_effort(git.as_ref(), &retry, &rm_dir, &repos).await;
                remove_dir_if_exists(&rm_dir).await
            })
            .execute()
            .await?;

        self.usage.invalidate(&dir);
        let archived = archived
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        archived.ok_or_else(|| Error::internal(format!("archive of '{id}' produced no record")))
    }

    /// Bring an archived workspace back.
    ///
    /// With `force`, an active workspace already using the id is closed and
    /// deleted first (without the clean gate or hooks).
    ///
    /// # Errors
    ///
    /// - `WorkspaceNotFound` if there is no archived workspace with this id
    /// - `WorkspaceExists` if the id is active and `force` is off
    /// - any creation failure, after rollback
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn restore(
        &self,
        id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<CreateOutcome> {
        validate_workspace_id(id)?;
        let _guard = self.lock(id, cancel).await?;

        let archived = self
            .store
            .load_closed(id)
            .await?
            .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))?;

        self.cache.invalidate(id);
        if let Some((existing, _)) = self.cache.get(id).await? {
            if !force {
                return Err(Error::WorkspaceExists(id.to_string()));
            }
            tracing::info!("Force-closing active workspace before restore");
            self.delete_locked(&existing).await?;
        } else if tokio::fs::try_exists(self.workspace_dir(id))
            .await
            .unwrap_or(false)
        {
            if !force {
                return Err(Error::WorkspaceExists(id.to_string()));
            }
            remove_dir_if_exists(&self.workspace_dir(id)).await?;
        }

        let workspace = archived.reactivated();
        let path = self.create_locked(&workspace, cancel).await?;

        if let Err(e) = self.store.delete_closed(id).await {
            tracing::warn!(error = %e, "Restored workspace but could not delete its archive record");
        }
        tracing::info!("Restored workspace");

        Ok(self.finish_create(workspace, path, cancel).await)
    }
}
