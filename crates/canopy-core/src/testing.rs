//! In-memory collaborators for tests
//!
//! Enabled for unit tests and, through the `test-support` feature, for the
//! integration tests. The fakes record what was asked of them and can be told
//! to fail or stall for specific repositories.

#![allow(clippy::missing_errors_doc)]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::HookSpec,
    domain::Workspace,
    ports::{
        CommandOutput, GitAdapter, HookContext, HookExecutor, HookReport, HookResult, HookStage,
        Location, Lookup, RepoStatus, WorkspaceStore,
    },
    Error, GitFailure, Result,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn repo_name_of(worktree: &Path) -> String {
    worktree
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════
// STORE
// ═══════════════════════════════════════════════════════════════════════════

/// `WorkspaceStore` backed by two maps, counting lookups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    active: Mutex<BTreeMap<String, Workspace>>,
    closed: Mutex<BTreeMap<String, Workspace>>,
    unaddressable: HashSet<String>,
    failing: Mutex<HashSet<&'static str>>,
    lookup_delay: Option<Duration>,
    list_delay: Option<Duration>,
    lookups: AtomicUsize,
    lists: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `id` as `Lookup::Unaddressable`, forcing a list scan.
    #[must_use]
    pub fn with_unaddressable(mut self, id: &str) -> Self {
        self.unaddressable.insert(id.to_string());
        self
    }

    /// Delay every `load_by_id` call.
    #[must_use]
    pub const fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = Some(delay);
        self
    }

    /// Delay every `list` call after taking its snapshot.
    #[must_use]
    pub const fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    /// Make every call to `operation` (e.g. `"save"`, `"close"`) fail.
    pub fn fail_operation(&self, operation: &'static str) {
        lock(&self.failing).insert(operation);
    }

    pub fn heal(&self) {
        lock(&self.failing).clear();
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn active_ids(&self) -> Vec<String> {
        lock(&self.active).keys().cloned().collect()
    }

    pub fn closed_ids(&self) -> Vec<String> {
        lock(&self.closed).keys().cloned().collect()
    }

    pub fn get_active(&self, id: &str) -> Option<Workspace> {
        lock(&self.active).get(id).cloned()
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if lock(&self.failing).contains(operation) {
            return Err(Error::io_error(format!("injected {operation} failure")));
        }
        Ok(())
    }

    fn location(id: &str) -> Location {
        Location::new(format!("memory/{id}"))
    }
}

#[async_trait]
impl WorkspaceStore for MemoryStore {
    async fn create(&self, workspace: &Workspace) -> Result<Location> {
        self.check("create")?;
        let mut active = lock(&self.active);
        if active.contains_key(&workspace.id) {
            return Err(Error::WorkspaceExists(workspace.id.clone()));
        }
        active.insert(workspace.id.clone(), workspace.clone());
        Ok(Self::location(&workspace.id))
    }

    async fn save(&self, workspace: &Workspace) -> Result<Location> {
        self.check("save")?;
        lock(&self.active).insert(workspace.id.clone(), workspace.clone());
        Ok(Self::location(&workspace.id))
    }

    async fn load(&self, location: &Location) -> Result<Workspace> {
        self.check("load")?;
        let id = location.to_string();
        let id = id.trim_start_matches("memory/");
        lock(&self.active)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))
    }

    async fn load_by_id(&self, id: &str) -> Result<Lookup> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check("load")?;
        if self.unaddressable.contains(id) {
            return Ok(Lookup::Unaddressable);
        }
        // Snapshot first, then stall: models a slow read racing a write.
        let snapshot = lock(&self.active).get(id).cloned();
        if let Some(delay) = self.lookup_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot.map_or(Lookup::Missing, |ws| Lookup::Found(ws, Self::location(id))))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check("delete")?;
        lock(&self.active).remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(Workspace, Location)>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.check("list")?;
        let snapshot: Vec<_> = lock(&self.active)
            .values()
            .map(|ws| (ws.clone(), Self::location(&ws.id)))
            .collect();
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }

    async fn close(&self, workspace: &Workspace) -> Result<Workspace> {
        self.check("close")?;
        let archived = workspace.archived();
        lock(&self.closed).insert(archived.id.clone(), archived.clone());
        lock(&self.active).remove(&workspace.id);
        Ok(archived)
    }

    async fn list_closed(&self) -> Result<Vec<Workspace>> {
        self.check("list")?;
        Ok(lock(&self.closed).values().cloned().collect())
    }

    async fn load_closed(&self, id: &str) -> Result<Option<Workspace>> {
        self.check("load")?;
        Ok(lock(&self.closed).get(id).cloned())
    }

    async fn delete_closed(&self, id: &str) -> Result<()> {
        self.check("delete_closed")?;
        lock(&self.closed).remove(id);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// GIT
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct InjectedFailure {
    failure: GitFailure,
    /// Remaining failures before the operation succeeds; `None` = forever
    remaining: Option<usize>,
}

/// `GitAdapter` that creates plain directories instead of worktrees.
#[derive(Debug)]
pub struct FakeGit {
    repos_root: PathBuf,
    calls: Mutex<Vec<String>>,
    canonical: Mutex<HashSet<String>>,
    clone_failures: Mutex<HashMap<String, InjectedFailure>>,
    checkout_failures: Mutex<HashSet<String>>,
    statuses: Mutex<HashMap<String, RepoStatus>>,
    outputs: Mutex<HashMap<String, CommandOutput>>,
    delays: Mutex<HashMap<String, Duration>>,
    worktree_delays: Mutex<HashMap<String, Duration>>,
    branches: Mutex<HashMap<PathBuf, String>>,
    /// Worktrees known to the canonical repositories, like `.git/worktrees`
    registered: Mutex<HashSet<PathBuf>>,
    clone_attempts: AtomicUsize,
}

impl FakeGit {
    pub fn new(repos_root: impl Into<PathBuf>) -> Self {
        Self {
            repos_root: repos_root.into(),
            calls: Mutex::default(),
            canonical: Mutex::default(),
            clone_failures: Mutex::default(),
            checkout_failures: Mutex::default(),
            statuses: Mutex::default(),
            outputs: Mutex::default(),
            delays: Mutex::default(),
            worktree_delays: Mutex::default(),
            branches: Mutex::default(),
            registered: Mutex::default(),
            clone_attempts: AtomicUsize::new(0),
        }
    }

    /// Every `ensure_canonical` for `repo` fails with `failure`.
    pub fn fail_clone(&self, repo: &str, failure: GitFailure) {
        lock(&self.clone_failures).insert(
            repo.to_string(),
            InjectedFailure {
                failure,
                remaining: None,
            },
        );
    }

    /// The next `times` calls of `ensure_canonical` for `repo` fail.
    pub fn fail_clone_times(&self, repo: &str, failure: GitFailure, times: usize) {
        lock(&self.clone_failures).insert(
            repo.to_string(),
            InjectedFailure {
                failure,
                remaining: Some(times),
            },
        );
    }

    pub fn fail_checkout(&self, repo: &str) {
        lock(&self.checkout_failures).insert(repo.to_string());
    }

    pub fn set_status(&self, repo: &str, status: RepoStatus) {
        lock(&self.statuses).insert(repo.to_string(), status);
    }

    pub fn set_output(&self, repo: &str, output: CommandOutput) {
        lock(&self.outputs).insert(repo.to_string(), output);
    }

    /// Stall clone and command calls for `repo`.
    pub fn set_delay(&self, repo: &str, delay: Duration) {
        lock(&self.delays).insert(repo.to_string(), delay);
    }

    /// Stall `create_worktree` for `repo` after it registered the worktree,
    /// like a `git worktree add` still checking out files.
    pub fn set_worktree_delay(&self, repo: &str, delay: Duration) {
        lock(&self.worktree_delays).insert(repo.to_string(), delay);
    }

    /// Clear injected failures and delays.
    pub fn heal(&self) {
        lock(&self.clone_failures).clear();
        lock(&self.checkout_failures).clear();
        lock(&self.delays).clear();
        lock(&self.worktree_delays).clear();
    }

    pub fn registered_worktrees(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = lock(&self.registered).iter().cloned().collect();
        paths.sort();
        paths
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn clone_attempts(&self) -> usize {
        self.clone_attempts.load(Ordering::SeqCst)
    }

    pub fn branch_of(&self, worktree: &Path) -> Option<String> {
        lock(&self.branches).get(worktree).cloned()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    async fn stall(&self, repo: &str, cancel: &CancellationToken) -> Result<()> {
        let delay = lock(&self.delays).get(repo).copied();
        if let Some(delay) = delay {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::cancelled(format!("fake git {repo}"))),
                () = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    fn injected_clone_failure(&self, repo: &str) -> Option<GitFailure> {
        let mut failures = lock(&self.clone_failures);
        let injected = failures.get_mut(repo)?;
        match &mut injected.remaining {
            None => Some(injected.failure),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(injected.failure)
            }
        }
    }
}

#[async_trait]
impl GitAdapter for FakeGit {
    fn canonical_path(&self, name: &str) -> PathBuf {
        self.repos_root.join(format!("{name}.git"))
    }

    async fn ensure_canonical(
        &self,
        url: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.clone_attempts.fetch_add(1, Ordering::SeqCst);
        self.record(format!("ensure_canonical {name}"));
        self.stall(name, cancel).await?;
        if let Some(failure) = self.injected_clone_failure(name) {
            return Err(Error::git("clone", name, failure, format!("injected failure for {url}")));
        }
        lock(&self.canonical).insert(name.to_string());
        Ok(self.canonical_path(name))
    }

    async fn clone_repo(&self, url: &str, dest: &Path, _cancel: &CancellationToken) -> Result<()> {
        self.record(format!("clone {url} {}", dest.display()));
        tokio::fs::create_dir_all(dest).await?;
        Ok(())
    }

    async fn fetch(&self, repo: &Path, _cancel: &CancellationToken) -> Result<()> {
        self.record(format!("fetch {}", repo.display()));
        Ok(())
    }

    async fn push(&self, worktree: &Path, branch: &str, _cancel: &CancellationToken) -> Result<()> {
        self.record(format!("push {} {branch}", repo_name_of(worktree)));
        Ok(())
    }

    async fn pull(&self, worktree: &Path, _cancel: &CancellationToken) -> Result<()> {
        self.record(format!("pull {}", repo_name_of(worktree)));
        Ok(())
    }

    async fn create_worktree(&self, _canonical: &Path, worktree: &Path, branch: &str) -> Result<()> {
        let repo = repo_name_of(worktree);
        self.record(format!("create_worktree {repo} {branch}"));
        if !lock(&self.registered).insert(worktree.to_path_buf()) {
            return Err(Error::git(
                "create worktree",
                &repo,
                GitFailure::Other,
                format!("'{}' is a missing but already registered worktree", worktree.display()),
            ));
        }
        tokio::fs::create_dir_all(worktree).await?;
        let delay = lock(&self.worktree_delays).get(&repo).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.branches).insert(worktree.to_path_buf(), branch.to_string());
        Ok(())
    }

    async fn remove_worktree(&self, _canonical: &Path, worktree: &Path) -> Result<()> {
        self.record(format!("remove_worktree {}", repo_name_of(worktree)));
        match tokio::fs::remove_dir_all(worktree).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        lock(&self.branches).remove(worktree);
        lock(&self.registered).remove(worktree);
        Ok(())
    }

    async fn repair_worktree(&self, _canonical: &Path, worktree: &Path) -> Result<()> {
        self.record(format!("repair_worktree {}", worktree.display()));
        // Re-point registrations of this repo whose directory moved away.
        let name = worktree.file_name();
        let mut registered = lock(&self.registered);
        registered.retain(|path| path.file_name() != name || path.exists());
        registered.insert(worktree.to_path_buf());
        drop(registered);

        let mut branches = lock(&self.branches);
        let moved = branches
            .keys()
            .find(|path| path.file_name() == name && !path.exists())
            .cloned();
        if let Some(branch) = moved.and_then(|old| branches.remove(&old)) {
            branches.insert(worktree.to_path_buf(), branch);
        }
        Ok(())
    }

    async fn status(&self, worktree: &Path) -> Result<RepoStatus> {
        let repo = repo_name_of(worktree);
        self.record(format!("status {repo}"));
        let mut status = lock(&self.statuses).get(&repo).cloned().unwrap_or_default();
        if status.branch.is_none() {
            status.branch = self.branch_of(worktree);
        }
        Ok(status)
    }

    async fn checkout(&self, worktree: &Path, branch: &str) -> Result<()> {
        let repo = repo_name_of(worktree);
        self.record(format!("checkout {repo} {branch}"));
        if lock(&self.checkout_failures).contains(&repo) {
            return Err(Error::git(
                "checkout",
                &repo,
                GitFailure::NotFound,
                format!("pathspec '{branch}' did not match"),
            ));
        }
        lock(&self.branches).insert(worktree.to_path_buf(), branch.to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = lock(&self.canonical).iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn run_command(
        &self,
        worktree: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let repo = repo_name_of(worktree);
        self.record(format!("run {repo} {}", args.join(" ")));
        self.stall(&repo, cancel).await?;
        Ok(lock(&self.outputs)
            .get(&repo)
            .cloned()
            .unwrap_or_else(|| CommandOutput {
                stdout: format!("{repo}: {}", args.join(" ")),
                stderr: String::new(),
                exit_code: 0,
            }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HOOKS
// ═══════════════════════════════════════════════════════════════════════════

/// `HookExecutor` that records invocations and can fail a stage.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    runs: Mutex<Vec<(HookStage, Vec<String>, HookContext)>>,
    failing: Mutex<HashSet<HookStage>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_stage(&self, stage: HookStage) {
        lock(&self.failing).insert(stage);
    }

    pub fn runs(&self) -> Vec<(HookStage, Vec<String>, HookContext)> {
        lock(&self.runs).clone()
    }
}

#[async_trait]
impl HookExecutor for RecordingHooks {
    async fn run(
        &self,
        stage: HookStage,
        hooks: &[HookSpec],
        ctx: &HookContext,
        _cancel: &CancellationToken,
    ) -> Result<HookReport> {
        let commands: Vec<String> = hooks.iter().map(|h| h.command.clone()).collect();
        lock(&self.runs).push((stage, commands, ctx.clone()));

        if lock(&self.failing).contains(&stage) {
            return Err(Error::HookFailed {
                stage: stage.to_string(),
                command: hooks.first().map(|h| h.command.clone()).unwrap_or_default(),
                exit_code: Some(1),
                stderr: format!("injected failure at {}", Utc::now().to_rfc3339()),
            });
        }

        Ok(HookReport {
            results: hooks
                .iter()
                .map(|h| HookResult {
                    command: h.command.clone(),
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::ZERO,
                    error: None,
                })
                .collect(),
        })
    }
}
