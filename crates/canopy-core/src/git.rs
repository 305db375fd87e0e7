//! Git adapter backed by the `git` binary
//!
//! Canonical repositories are bare clones at `<repos_root>/<name>.git`;
//! workspaces hold worktrees of them, so objects are stored once per
//! repository no matter how many workspaces use it.
//!
//! Every subprocess is spawned with `kill_on_drop`, so racing it against a
//! cancellation token and dropping it is enough to stop it.

use std::{
    path::{Path, PathBuf},
    process::{Output, Stdio},
};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{
    error::GitFailure,
    ports::{CommandOutput, GitAdapter, RepoStatus},
    Error, Result,
};

/// [`GitAdapter`] running `git` subprocesses.
#[derive(Debug, Clone)]
pub struct GitCli {
    git: PathBuf,
    repos_root: PathBuf,
}

impl GitCli {
    pub fn new(git: impl Into<PathBuf>, repos_root: impl Into<PathBuf>) -> Self {
        Self {
            git: git.into(),
            repos_root: repos_root.into(),
        }
    }

    /// Locate `git` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if no `git` binary can be found
    pub fn discover(repos_root: impl Into<PathBuf>) -> Result<Self> {
        let git = which::which("git")
            .map_err(|e| Error::invalid_config(format!("git not found on PATH: {e}")))?;
        Ok(Self::new(git, repos_root))
    }

    pub fn repos_root(&self) -> &Path {
        &self.repos_root
    }

    fn command(&self, cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.git);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run git, turning spawn failures, cancellation and non-zero exits into
    /// errors naming `operation` and `target`.
    async fn git(
        &self,
        operation: &str,
        target: &str,
        cwd: Option<&Path>,
        args: &[&str],
        cancel: Option<&CancellationToken>,
    ) -> Result<Output> {
        tracing::debug!(operation, target, ?args, "Running git");
        let output = self.command(cwd).args(args).output();

        let output = match cancel {
            Some(cancel) => tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::cancelled(format!("git {operation} {target}"))),
                output = output => output,
            },
            None => output.await,
        }
        .map_err(|e| Error::git(operation, target, GitFailure::Other, format!("failed to run git: {e}")))?;

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(Error::git(operation, target, classify_git_stderr(&stderr), stderr))
        }
    }

    /// Whether `git rev-parse --verify` resolves `reference` in `repo`.
    async fn has_ref(&self, repo: &Path, reference: &str) -> bool {
        self.command(Some(repo))
            .args(["rev-parse", "--verify", "--quiet", reference])
            .output()
            .await
            .is_ok_and(|output| output.status.success())
    }
}

/// Temporary clone directory, removed on drop unless kept. Dropping the
/// clone future mid-way must not leave a staging directory behind.
#[derive(Debug)]
struct StagingDir {
    path: PathBuf,
    keep: bool,
}

impl StagingDir {
    const fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        let path = std::mem::take(&mut self.path);
        let remove = move || match std::fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), "Failed to remove staging clone: {e}"),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(remove)),
            Err(_) => remove(),
        }
    }
}

#[async_trait]
impl GitAdapter for GitCli {
    fn canonical_path(&self, name: &str) -> PathBuf {
        self.repos_root.join(format!("{name}.git"))
    }

    async fn ensure_canonical(
        &self,
        url: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let path = self.canonical_path(name);
        if tokio::fs::try_exists(path.join("HEAD")).await.unwrap_or(false) {
            return Ok(path);
        }

        tokio::fs::create_dir_all(&self.repos_root)
            .await
            .map_err(|e| Error::io_error(format!("Failed to create repos root: {e}")))?;

        // Clone beside the final path and rename, so a half-finished clone
        // never looks like a canonical repository.
        let staging = StagingDir::new(
            self.repos_root
                .join(format!(".{name}.git.{}", uuid::Uuid::new_v4().simple())),
        );
        self.clone_repo(url, staging.path(), cancel).await?;

        let staged = staging.path().to_string_lossy().into_owned();
        self.git(
            "configure",
            name,
            None,
            &[
                "--git-dir",
                staged.as_str(),
                "config",
                "remote.origin.fetch",
                "+refs/heads/*:refs/remotes/origin/*",
            ],
            None,
        )
        .await?;

        match tokio::fs::rename(staging.path(), &path).await {
            Ok(()) => {
                staging.keep();
                tracing::info!(repo = name, path = %path.display(), "Cloned canonical repository");
                Ok(path)
            }
            // Another process finished the same clone first.
            Err(_) if tokio::fs::try_exists(path.join("HEAD")).await.unwrap_or(false) => Ok(path),
            Err(e) => Err(Error::io_error(format!(
                "Failed to move clone into '{}': {e}",
                path.display()
            ))),
        }
    }

    async fn clone_repo(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        let dest = dest.to_string_lossy().into_owned();
        self.git(
            "clone",
            url,
            None,
            &["clone", "--bare", "--quiet", "--", url, dest.as_str()],
            Some(cancel),
        )
        .await
        .map(|_| ())
    }

    async fn fetch(&self, repo: &Path, cancel: &CancellationToken) -> Result<()> {
        self.git(
            "fetch",
            &repo.to_string_lossy(),
            Some(repo),
            &["fetch", "--prune", "--quiet", "origin"],
            Some(cancel),
        )
        .await
        .map(|_| ())
    }

    async fn push(&self, worktree: &Path, branch: &str, cancel: &CancellationToken) -> Result<()> {
        self.git(
            "push",
            branch,
            Some(worktree),
            &["push", "--quiet", "--set-upstream", "origin", branch],
            Some(cancel),
        )
        .await
        .map(|_| ())
    }

    async fn pull(&self, worktree: &Path, cancel: &CancellationToken) -> Result<()> {
        self.git(
            "pull",
            &worktree.to_string_lossy(),
            Some(worktree),
            &["pull", "--ff-only", "--quiet"],
            Some(cancel),
        )
        .await
        .map(|_| ())
    }

    async fn create_worktree(&self, canonical: &Path, worktree: &Path, branch: &str) -> Result<()> {
        let path = worktree.to_string_lossy().into_owned();
        let path = path.as_str();
        let local = format!("refs/heads/{branch}");
        let remote = format!("refs/remotes/origin/{branch}");
        let remote_short = format!("origin/{branch}");

        let args: Vec<&str> = if self.has_ref(canonical, &local).await {
            vec!["worktree", "add", "--quiet", path, branch]
        } else if self.has_ref(canonical, &remote).await {
            vec!["worktree", "add", "--quiet", "--track", "-b", branch, path, remote_short.as_str()]
        } else {
            vec!["worktree", "add", "--quiet", "-b", branch, path]
        };

        self.git("create worktree", path, Some(canonical), &args, None)
            .await
            .map(|_| ())
    }

    async fn remove_worktree(&self, canonical: &Path, worktree: &Path) -> Result<()> {
        let path = worktree.to_string_lossy().into_owned();
        let path = path.as_str();
        let removed = self
            .git(
                "remove worktree",
                path,
                Some(canonical),
                &["worktree", "remove", "--force", "--force", path],
                None,
            )
            .await;

        match removed {
            Ok(_) => Ok(()),
            // Directory already gone: drop the stale registration instead.
            // Twice-forced removal above also covers a locked, half-added
            // worktree.
            Err(_) if !tokio::fs::try_exists(worktree).await.unwrap_or(true) => self
                .git("prune worktrees", path, Some(canonical), &["worktree", "prune"], None)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        }
    }

    async fn repair_worktree(&self, canonical: &Path, worktree: &Path) -> Result<()> {
        let path = worktree.to_string_lossy().into_owned();
        self.git(
            "repair worktree",
            &path,
            Some(canonical),
            &["worktree", "repair", path.as_str()],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn status(&self, worktree: &Path) -> Result<RepoStatus> {
        let target = worktree.to_string_lossy();
        let output = self
            .git(
                "status",
                &target,
                Some(worktree),
                &["status", "--porcelain=v2", "--branch"],
                None,
            )
            .await?;
        let porcelain = parse_porcelain_v2(&String::from_utf8_lossy(&output.stdout));

        let mut status = porcelain.status;
        if !porcelain.has_upstream && porcelain.has_commits {
            // No upstream: count commits that no remote branch contains.
            let output = self
                .git(
                    "count unpushed",
                    &target,
                    Some(worktree),
                    &["rev-list", "--count", "HEAD", "--not", "--remotes"],
                    None,
                )
                .await?;
            status.unpushed = String::from_utf8_lossy(&output.stdout)
                .trim()
                .parse()
                .unwrap_or(0);
        }
        Ok(status)
    }

    async fn checkout(&self, worktree: &Path, branch: &str) -> Result<()> {
        let switched = self
            .git("checkout", branch, Some(worktree), &["switch", "--quiet", branch], None)
            .await;
        match switched {
            Ok(_) => Ok(()),
            Err(e) if e.git_failure() == Some(GitFailure::NotFound) => self
                .git(
                    "checkout",
                    branch,
                    Some(worktree),
                    &["switch", "--quiet", "--create", branch],
                    None,
                )
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.repos_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with('.') {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(".git") {
                if entry.file_type().await?.is_dir() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn run_command(
        &self,
        worktree: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let Some((program, rest)) = args.split_first() else {
            return Err(Error::invalid_input("no command given"));
        };

        let output = Command::new(program)
            .args(rest)
            .current_dir(worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::cancelled(format!("{program} in {}", worktree.display()))),
            output = output => output.map_err(|e| Error::io_error(format!("Failed to run '{program}': {e}")))?,
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // Killed by a signal: report like a shell would
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PARSING
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Porcelain {
    status: RepoStatus,
    has_upstream: bool,
    has_commits: bool,
}

/// Parse `git status --porcelain=v2 --branch`.
fn parse_porcelain_v2(text: &str) -> Porcelain {
    let mut parsed = Porcelain::default();

    for line in text.lines() {
        if let Some(head) = line.strip_prefix("# branch.head ") {
            parsed.status.branch = (head != "(detached)").then(|| head.to_string());
        } else if let Some(oid) = line.strip_prefix("# branch.oid ") {
            parsed.has_commits = oid != "(initial)";
        } else if line.starts_with("# branch.upstream ") {
            parsed.has_upstream = true;
        } else if let Some(ab) = line.strip_prefix("# branch.ab ") {
            for part in ab.split_whitespace() {
                if let Some(ahead) = part.strip_prefix('+') {
                    parsed.status.unpushed = ahead.parse().unwrap_or(0);
                } else if let Some(behind) = part.strip_prefix('-') {
                    parsed.status.behind = behind.parse().unwrap_or(0);
                }
            }
        } else if !line.starts_with('#') && !line.is_empty() {
            parsed.status.dirty = true;
        }
    }

    parsed
}

/// Map git's stderr onto a failure sub-kind.
pub fn classify_git_stderr(stderr: &str) -> GitFailure {
    const AUTH: [&str; 6] = [
        "authentication failed",
        "permission denied (publickey",
        "could not read username",
        "403",
        "401",
        "access denied",
    ];
    const NOT_FOUND: [&str; 6] = [
        "repository not found",
        "not found",
        "does not appear to be a git repository",
        "did not match any",
        "invalid reference",
        "couldn't find remote ref",
    ];
    const NETWORK: [&str; 9] = [
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "operation timed out",
        "connection reset",
        "network is unreachable",
        "early eof",
        "the remote end hung up unexpectedly",
        "temporary failure in name resolution",
    ];
    const PERMISSION: [&str; 3] = [
        "permission denied",
        "read-only file system",
        "operation not permitted",
    ];

    let lower = stderr.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(&AUTH) {
        GitFailure::Auth
    } else if matches(&NETWORK) {
        GitFailure::Network
    } else if matches(&NOT_FOUND) {
        GitFailure::NotFound
    } else if matches(&PERMISSION) {
        GitFailure::Permission
    } else {
        GitFailure::Other
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command as StdCommand;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_staging_dir_is_removed_unless_kept() -> Result<()> {
        let dir = TempDir::new()?;
        let dropped = dir.path().join(".api.git.1");
        let kept = dir.path().join(".api.git.2");
        std::fs::create_dir_all(dropped.join("objects"))?;
        std::fs::create_dir_all(&kept)?;

        drop(StagingDir::new(dropped.clone()));
        StagingDir::new(kept.clone()).keep();

        assert!(!dropped.exists());
        assert!(kept.exists());
        Ok(())
    }

    #[test]
    fn test_parse_clean_tracking_branch() {
        let parsed = parse_porcelain_v2(
            "# branch.oid 1234abcd\n# branch.head main\n# branch.upstream origin/main\n# branch.ab +0 -2\n",
        );
        assert_eq!(parsed.status.branch.as_deref(), Some("main"));
        assert!(parsed.has_upstream);
        assert!(!parsed.status.dirty);
        assert_eq!(parsed.status.behind, 2);
        assert!(parsed.status.is_clean());
    }

    #[test]
    fn test_parse_dirty_and_ahead() {
        let parsed = parse_porcelain_v2(
            "# branch.oid 1234\n# branch.head feat\n# branch.upstream origin/feat\n# branch.ab +3 -0\n1 .M N... 100644 100644 100644 a b src/lib.rs\n? notes.txt\n",
        );
        assert!(parsed.status.dirty);
        assert_eq!(parsed.status.unpushed, 3);
    }

    #[test]
    fn test_parse_detached_without_upstream() {
        let parsed = parse_porcelain_v2("# branch.oid (initial)\n# branch.head (detached)\n");
        assert_eq!(parsed.status.branch, None);
        assert!(!parsed.has_upstream);
        assert!(!parsed.has_commits);
    }

    #[test]
    fn test_classify_git_stderr() {
        assert_eq!(
            classify_git_stderr("fatal: Authentication failed for 'https://x'"),
            GitFailure::Auth
        );
        assert_eq!(
            classify_git_stderr("remote: HTTP Basic: Access denied. 403"),
            GitFailure::Auth
        );
        assert_eq!(
            classify_git_stderr("fatal: unable to access: Could not resolve host: github.com"),
            GitFailure::Network
        );
        assert_eq!(
            classify_git_stderr("ERROR: Repository not found."),
            GitFailure::NotFound
        );
        assert_eq!(
            classify_git_stderr("error: unable to create file: Permission denied"),
            GitFailure::Permission
        );
        assert_eq!(classify_git_stderr("fatal: something odd"), GitFailure::Other);
    }

    fn run(dir: &Path, args: &[&str]) -> Result<()> {
        let status = StdCommand::new("git")
            .args(["-c", "user.name=Canopy", "-c", "user.email=canopy@example.com"])
            .args(args)
            .current_dir(dir)
            .output()?
            .status;
        if status.success() {
            Ok(())
        } else {
            Err(Error::internal(format!("git {args:?} failed")))
        }
    }

    /// A source repository with one commit on `main`.
    fn source_repo(root: &Path) -> Result<PathBuf> {
        let src = root.join("src-repo");
        std::fs::create_dir_all(&src)?;
        run(&src, &["init", "--quiet", "--initial-branch=main"])?;
        std::fs::write(src.join("README.md"), "hello\n")?;
        run(&src, &["add", "README.md"])?;
        run(&src, &["commit", "--quiet", "-m", "init"])?;
        Ok(src)
    }

    #[tokio::test]
    async fn test_worktree_lifecycle_against_local_repo() -> Result<()> {
        let Ok(git) = GitCli::discover(PathBuf::new()) else {
            return Ok(());
        };
        let root = TempDir::new()?;
        let Ok(src) = source_repo(root.path()) else {
            return Ok(());
        };
        let git = GitCli::new(git.git, root.path().join("repos"));
        let cancel = CancellationToken::new();
        let url = src.to_string_lossy().into_owned();

        let canonical = git.ensure_canonical(&url, "app", &cancel).await?;
        assert_eq!(canonical, root.path().join("repos/app.git"));
        // Second call finds the existing clone.
        assert_eq!(git.ensure_canonical(&url, "app", &cancel).await?, canonical);
        assert_eq!(git.list().await?, ["app"]);

        let worktree = root.path().join("ws/PROJ-1/app");
        git.create_worktree(&canonical, &worktree, "feature/x").await?;
        assert!(worktree.join("README.md").exists());

        let status = git.status(&worktree).await?;
        assert_eq!(status.branch.as_deref(), Some("feature/x"));
        assert!(!status.dirty);

        std::fs::write(worktree.join("new.txt"), "x")?;
        assert!(git.status(&worktree).await?.dirty);

        let output = git
            .run_command(&worktree, &["git".to_string(), "rev-parse".to_string(), "--abbrev-ref".to_string(), "HEAD".to_string()], &cancel)
            .await?;
        assert_eq!(output.stdout.trim(), "feature/x");

        git.remove_worktree(&canonical, &worktree).await?;
        assert!(!worktree.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_clone_of_missing_repo_fails_cleanly() -> Result<()> {
        let Ok(git) = GitCli::discover(PathBuf::new()) else {
            return Ok(());
        };
        let root = TempDir::new()?;
        let git = GitCli::new(git.git, root.path().join("repos"));

        let result = git
            .ensure_canonical(
                &root.path().join("nope").to_string_lossy(),
                "nope",
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
        assert!(!git.canonical_path("nope").exists());
        assert!(git.list().await?.is_empty());
        Ok(())
    }
}
