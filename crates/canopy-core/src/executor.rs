//! Bounded fan-out of per-repository work
//!
//! [`RepoExecutor::run`] applies one task to every repository of a workspace,
//! either in list order or in parallel on a `JoinSet` gated by a semaphore.
//! Results always come back index-aligned with the input.
//!
//! In fail-fast mode the first failure trips a child cancellation token:
//! queued tasks never start and in-flight tasks are dropped at their next
//! await point. The task closure also receives the token so long-running work
//! can stop on its own.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::Arc,
};

use futures::FutureExt;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ExecutorConfig,
    domain::Repo,
    ports::{CommandOutput, RepoStatus},
    Error, Result,
};

/// Upper bound on concurrently running repository tasks.
pub const MAX_POOL_SIZE: usize = 32;

pub const DEFAULT_POOL_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub parallel: bool,
    pub continue_on_error: bool,
}

impl RunOptions {
    pub const fn parallel() -> Self {
        Self {
            parallel: true,
            continue_on_error: false,
        }
    }

    pub const fn sequential() -> Self {
        Self {
            parallel: false,
            continue_on_error: false,
        }
    }

    #[must_use]
    pub const fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }
}

/// Value produced by a repository task.
///
/// Some outputs carry their own failure signal (a non-zero exit status);
/// `failure` turns it into an error.
pub trait TaskOutput: Send + 'static {
    fn failure(&self, _repo: &str) -> Option<Error> {
        None
    }
}

impl TaskOutput for () {}
impl TaskOutput for PathBuf {}
impl TaskOutput for RepoStatus {}

impl TaskOutput for CommandOutput {
    fn failure(&self, repo: &str) -> Option<Error> {
        (!self.success()).then(|| Error::CommandFailed {
            repo: repo.to_string(),
            exit_code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// Outcome of the task for one repository.
#[derive(Debug, Clone)]
pub struct RepoTaskResult<T = CommandOutput> {
    pub repo: String,
    pub output: Option<T>,
    pub error: Option<Error>,
}

impl<T> RepoTaskResult<T> {
    fn cancelled(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
            output: None,
            error: Some(Error::cancelled(format!("task for repository '{repo}'"))),
        }
    }

    fn failed(repo: &str, error: Error) -> Self {
        Self {
            repo: repo.to_string(),
            output: None,
            error: Some(error),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl<T: TaskOutput> RepoTaskResult<T> {
    fn from_outcome(repo: &str, outcome: Result<T>) -> Self {
        match outcome {
            Ok(output) => {
                let error = output.failure(repo);
                Self {
                    repo: repo.to_string(),
                    output: Some(output),
                    error,
                }
            }
            Err(error) => Self::failed(repo, error),
        }
    }
}

impl RepoTaskResult<CommandOutput> {
    pub fn stdout(&self) -> &str {
        self.output.as_ref().map_or("", |o| o.stdout.as_str())
    }

    pub fn stderr(&self) -> &str {
        self.output.as_ref().map_or("", |o| o.stderr.as_str())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.output.as_ref().map(|o| o.exit_code)
    }
}

/// Everything a run produced.
///
/// `error` is set when the run stopped early (fail-fast or cancellation);
/// with continue-on-error it stays `None` and callers inspect `results`.
#[derive(Debug, Clone)]
pub struct RunReport<T = CommandOutput> {
    pub results: Vec<RepoTaskResult<T>>,
    pub error: Option<Error>,
}

impl<T> RunReport<T> {
    /// # Errors
    ///
    /// Returns the error that stopped the run
    pub fn into_result(self) -> Result<Vec<RepoTaskResult<T>>> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.results),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &RepoTaskResult<T>> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// Runs per-repository tasks with bounded concurrency.
#[derive(Debug, Clone, Copy)]
pub struct RepoExecutor {
    pool_size: usize,
}

impl Default for RepoExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl RepoExecutor {
    /// Pool size is clamped to `1..=MAX_POOL_SIZE`.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.clamp(1, MAX_POOL_SIZE),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.pool_size)
    }

    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Run `task` once per repository.
    pub async fn run<T, F, Fut>(
        &self,
        repos: &[Repo],
        task: F,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> RunReport<T>
    where
        T: TaskOutput,
        F: Fn(Repo, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if options.parallel && repos.len() > 1 {
            self.run_parallel(repos, Arc::new(task), options, cancel).await
        } else {
            run_sequential(repos, task, options, cancel).await
        }
    }

    async fn run_parallel<T, F, Fut>(
        &self,
        repos: &[Repo],
        task: Arc<F>,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> RunReport<T>
    where
        T: TaskOutput,
        F: Fn(Repo, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let child = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut set = JoinSet::new();

        for (index, repo) in repos.iter().cloned().enumerate() {
            let task = Arc::clone(&task);
            let semaphore = Arc::clone(&semaphore);
            let token = child.clone();
            set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    () = token.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return (index, RepoTaskResult::cancelled(&repo.name));
                };
                if token.is_cancelled() {
                    return (index, RepoTaskResult::cancelled(&repo.name));
                }

                let name = repo.name.clone();
                tracing::debug!(repo = %name, "Starting repository task");
                let work = AssertUnwindSafe(task(repo, token.clone())).catch_unwind();
                let outcome = tokio::select! {
                    biased;
                    () = token.cancelled() => return (index, RepoTaskResult::cancelled(&name)),
                    outcome = work => outcome,
                };
                let result = match outcome {
                    Ok(outcome) => RepoTaskResult::from_outcome(&name, outcome),
                    Err(_) => RepoTaskResult::failed(
                        &name,
                        Error::internal(format!("task for repository '{name}' panicked")),
                    ),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<RepoTaskResult<T>>> = repos.iter().map(|_| None).collect();
        let mut first_error: Option<Error> = None;

        while let Some(joined) = set.join_next().await {
            let Ok((index, result)) = joined else {
                continue;
            };
            if first_error.is_none() && !options.continue_on_error && !child.is_cancelled() {
                if let Some(error) = &result.error {
                    tracing::debug!(repo = %result.repo, error = %error, "Repository task failed, cancelling the rest");
                    first_error = Some(error.clone());
                    child.cancel();
                }
            }
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        }

        let results = slots
            .into_iter()
            .zip(repos)
            .map(|(slot, repo)| slot.unwrap_or_else(|| RepoTaskResult::cancelled(&repo.name)))
            .collect();

        let error = first_error.or_else(|| {
            cancel
                .is_cancelled()
                .then(|| Error::cancelled("repository fan-out"))
        });
        RunReport { results, error }
    }
}

async fn run_sequential<T, F, Fut>(
    repos: &[Repo],
    task: F,
    options: RunOptions,
    cancel: &CancellationToken,
) -> RunReport<T>
where
    T: TaskOutput,
    F: Fn(Repo, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut results = Vec::with_capacity(repos.len());

    for repo in repos {
        if cancel.is_cancelled() {
            return RunReport {
                results,
                error: Some(Error::cancelled("repository fan-out")),
            };
        }

        tracing::debug!(repo = %repo.name, "Starting repository task");
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::cancelled(format!("task for repository '{}'", repo.name))),
            outcome = task(repo.clone(), cancel.clone()) => outcome,
        };
        let result = RepoTaskResult::from_outcome(&repo.name, outcome);
        let stop = if cancel.is_cancelled() {
            Some(Error::cancelled("repository fan-out"))
        } else if options.continue_on_error {
            None
        } else {
            result.error.clone()
        };
        results.push(result);

        if stop.is_some() {
            return RunReport { results, error: stop };
        }
    }

    RunReport {
        results,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::ErrorKind;

    fn repos(names: &[&str]) -> Vec<Repo> {
        names
            .iter()
            .map(|n| Repo::new(*n, format!("git@example.com:org/{n}.git")))
            .collect()
    }

    fn output(stdout: &str, exit_code: i32) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code,
        }
    }

    #[test]
    fn test_pool_size_is_clamped() {
        assert_eq!(RepoExecutor::new(0).pool_size(), 1);
        assert_eq!(RepoExecutor::new(100).pool_size(), MAX_POOL_SIZE);
        assert_eq!(RepoExecutor::default().pool_size(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_results_follow_input_order() {
        let executor = RepoExecutor::new(4);
        let list = repos(&["a", "b", "c", "d"]);
        let report = executor
            .run(
                &list,
                |repo: Repo, _cancel| async move {
                    let delay = match repo.name.as_str() {
                        "a" => 40,
                        "b" => 30,
                        "c" => 20,
                        _ => 10,
                    };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(output(&repo.name, 0))
                },
                RunOptions::parallel(),
                &CancellationToken::new(),
            )
            .await;

        assert!(report.error.is_none());
        let names: Vec<_> = report.results.iter().map(RepoTaskResult::stdout).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_concurrency() {
        let executor = RepoExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let list = repos(&["a", "b", "c", "d", "e", "f"]);

        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let report = executor
            .run(
                &list,
                move |_repo: Repo, _cancel| {
                    let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                RunOptions::parallel(),
                &CancellationToken::new(),
            )
            .await;

        assert!(report.error.is_none());
        assert_eq!(report.results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_stops_at_first_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let report = RepoExecutor::default()
            .run(
                &repos(&["a", "b", "c"]),
                move |repo: Repo, _cancel| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(output("", i32::from(repo.name == "b"))) }
                },
                RunOptions::sequential(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.error.map(|e| e.kind()), Some(ErrorKind::CommandFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_continue_on_error_runs_all() {
        let report = RepoExecutor::default()
            .run(
                &repos(&["a", "b", "c"]),
                |repo: Repo, _cancel| async move {
                    if repo.name == "b" {
                        Err(Error::io_error("disk full"))
                    } else {
                        Ok(output("ok", 0))
                    }
                },
                RunOptions::sequential().with_continue_on_error(true),
                &CancellationToken::new(),
            )
            .await;

        assert!(report.error.is_none());
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.failures().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = RepoExecutor::default()
            .run(
                &repos(&["a", "b"]),
                |_repo: Repo, _cancel| async { Ok(()) },
                RunOptions::parallel(),
                &cancel,
            )
            .await;

        assert_eq!(
            report.error.map(|e| e.kind()),
            Some(ErrorKind::OperationCancelled)
        );
        assert!(report.results.iter().all(|r| !r.is_success()));
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let report = RepoExecutor::default()
            .run(
                &repos(&["a", "b"]),
                |repo: Repo, _cancel| async move {
                    assert!(repo.name != "b", "boom");
                    Ok(())
                },
                RunOptions::parallel().with_continue_on_error(true),
                &CancellationToken::new(),
            )
            .await;

        assert!(report.results[0].is_success());
        assert_eq!(
            report.results[1].error.as_ref().map(Error::kind),
            Some(ErrorKind::InternalError)
        );
    }
}
