//! Collaborator interfaces of the orchestration core
//!
//! The service only talks to git, durable storage and hooks through these
//! traits. Shipped implementations live in [`crate::git`], [`crate::storage`]
//! and [`crate::hooks`]; in-memory fakes live in `crate::testing`.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{config::HookSpec, domain::Workspace, Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// GIT
// ═══════════════════════════════════════════════════════════════════════════

/// Working tree state of one repository checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoStatus {
    /// Uncommitted changes or untracked files
    pub dirty: bool,
    /// Commits not on the upstream branch
    pub unpushed: u32,
    /// Upstream commits not merged locally
    pub behind: u32,
    /// Checked out branch, `None` when detached
    pub branch: Option<String>,
}

impl RepoStatus {
    pub const fn is_clean(&self) -> bool {
        !self.dirty && self.unpushed == 0
    }

    /// Human-readable reason the checkout may not be discarded.
    pub fn unclean_reason(&self) -> Option<String> {
        match (self.dirty, self.unpushed) {
            (false, 0) => None,
            (true, 0) => Some("uncommitted changes".to_string()),
            (false, n) => Some(format!("{n} unpushed commit(s)")),
            (true, n) => Some(format!("uncommitted changes and {n} unpushed commit(s)")),
        }
    }
}

/// Output of a command run inside a repository checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Git operations needed by the service.
///
/// Network operations (`ensure_canonical`, `clone_repo`, `fetch`, `push`,
/// `pull`) and `run_command` must stop promptly when `cancel` fires.
#[async_trait]
pub trait GitAdapter: Send + Sync {
    /// Path at which the canonical clone of `name` lives (or would live).
    fn canonical_path(&self, name: &str) -> PathBuf;

    /// Make sure a canonical clone of `url` exists, cloning if needed.
    async fn ensure_canonical(&self, url: &str, name: &str, cancel: &CancellationToken)
        -> Result<PathBuf>;

    async fn clone_repo(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<()>;

    async fn fetch(&self, repo: &Path, cancel: &CancellationToken) -> Result<()>;

    async fn push(&self, worktree: &Path, branch: &str, cancel: &CancellationToken) -> Result<()>;

    async fn pull(&self, worktree: &Path, cancel: &CancellationToken) -> Result<()>;

    /// Create a worktree of `canonical` at `worktree` on `branch`, creating
    /// the branch when it does not exist.
    async fn create_worktree(&self, canonical: &Path, worktree: &Path, branch: &str) -> Result<()>;

    async fn remove_worktree(&self, canonical: &Path, worktree: &Path) -> Result<()>;

    /// Re-link a worktree after its directory moved.
    async fn repair_worktree(&self, canonical: &Path, worktree: &Path) -> Result<()>;

    async fn status(&self, worktree: &Path) -> Result<RepoStatus>;

    async fn checkout(&self, worktree: &Path, branch: &str) -> Result<()>;

    /// Names of all canonical repositories.
    async fn list(&self) -> Result<Vec<String>>;

    async fn run_command(
        &self,
        worktree: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput>;
}

// ═══════════════════════════════════════════════════════════════════════════
// STORAGE
// ═══════════════════════════════════════════════════════════════════════════

/// Opaque handle to where a record is stored (a file path for the fs store).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location(PathBuf);

impl Location {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Result of a direct lookup by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Workspace, Location),
    Missing,
    /// The id does not map onto the store's naming scheme; scan `list()`.
    Unaddressable,
}

/// Durable source of truth for workspace metadata.
///
/// Active records and archived (closed) records are kept apart.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Persist a new record; `WorkspaceExists` if one is already present.
    async fn create(&self, workspace: &Workspace) -> Result<Location>;

    /// Persist a record, overwriting any existing one.
    async fn save(&self, workspace: &Workspace) -> Result<Location>;

    async fn load(&self, location: &Location) -> Result<Workspace>;

    async fn load_by_id(&self, id: &str) -> Result<Lookup>;

    /// Delete the active record; deleting a missing record is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<(Workspace, Location)>>;

    /// Move the active record to the archive with `closed_at` set.
    async fn close(&self, workspace: &Workspace) -> Result<Workspace>;

    async fn list_closed(&self) -> Result<Vec<Workspace>>;

    async fn load_closed(&self, id: &str) -> Result<Option<Workspace>>;

    async fn delete_closed(&self, id: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// HOOKS
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle point at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    PostCreate,
    PreClose,
}

impl HookStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PostCreate => "post_create",
            Self::PreClose => "pre_close",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workspace facts handed to hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    pub workspace_id: String,
    pub branch: String,
    pub path: PathBuf,
    pub repos: Vec<String>,
}

impl HookContext {
    pub fn for_workspace(workspace: &Workspace, path: impl Into<PathBuf>) -> Self {
        Self {
            workspace_id: workspace.id.clone(),
            branch: workspace.branch.clone(),
            path: path.into(),
            repos: workspace.repos.iter().map(|r| r.name.clone()).collect(),
        }
    }
}

/// Outcome of a single hook command.
#[derive(Debug, Clone)]
pub struct HookResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Failure tolerated because of continue-on-error
    pub error: Option<Error>,
}

impl HookResult {
    pub const fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Results of every hook that ran for one stage.
#[derive(Debug, Clone, Default)]
pub struct HookReport {
    pub results: Vec<HookResult>,
}

impl HookReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(HookResult::success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &HookResult> {
        self.results.iter().filter(|r| !r.success())
    }
}

/// Runs configured lifecycle hooks.
///
/// A failing hook aborts the stage with `HookFailed` or `HookTimeout` unless
/// continue-on-error applies to it, in which case the failure is recorded in
/// the report and the next hook runs.
#[async_trait]
pub trait HookExecutor: Send + Sync {
    async fn run(
        &self,
        stage: HookStage,
        hooks: &[HookSpec],
        ctx: &HookContext,
        cancel: &CancellationToken,
    ) -> Result<HookReport>;
}
