//! Ordered steps with compensating rollbacks
//!
//! A [`Transaction`] runs its steps strictly in order. When a step fails,
//! the rollbacks of every step that completed run in reverse order and the
//! step's own error is returned. Rollbacks are best effort: their failures
//! are logged and collected in a [`RollbackReport`], never returned in place
//! of the original error.
//!
//! ```ignore
//! Transaction::new("create PROJ-1")
//!     .step("save metadata", save, delete_record)
//!     .step("create directory", mkdir, remove_dir)
//!     .execute()
//!     .await?;
//! ```

use std::future::Future;

use futures::future::BoxFuture;

use crate::{Error, Result};

type StepFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Step {
    name: String,
    action: StepFn,
    rollback: Option<StepFn>,
}

/// A rollback that failed.
#[derive(Debug, Clone)]
pub struct RollbackFailure {
    pub step: String,
    pub error: Error,
}

/// What happened while unwinding a failed transaction.
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    /// Steps whose rollback succeeded, in the order they were undone
    pub rolled_back: Vec<String>,
    pub failures: Vec<RollbackFailure>,
}

impl RollbackReport {
    /// Whether the rollback (if any) left nothing behind.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A named sequence of (action, rollback) steps.
pub struct Transaction {
    name: String,
    steps: Vec<Step>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Transaction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step with its compensating rollback.
    #[must_use]
    pub fn step<A, AF, R, RF>(mut self, name: impl Into<String>, action: A, rollback: R) -> Self
    where
        A: FnOnce() -> AF + Send + 'static,
        AF: Future<Output = Result<()>> + Send + 'static,
        R: FnOnce() -> RF + Send + 'static,
        RF: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            action: Box::new(move || Box::pin(action())),
            rollback: Some(Box::new(move || Box::pin(rollback()))),
        });
        self
    }

    /// Append a step that has nothing to undo.
    #[must_use]
    pub fn step_no_rollback<A, AF>(mut self, name: impl Into<String>, action: A) -> Self
    where
        A: FnOnce() -> AF + Send + 'static,
        AF: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            action: Box::new(move || Box::pin(action())),
            rollback: None,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// # Errors
    ///
    /// Returns the error of the first failing step, after rolling back
    pub async fn execute(self) -> Result<()> {
        self.execute_with_report().await.0
    }

    /// Like [`execute`](Self::execute), also returning what the rollback did.
    pub async fn execute_with_report(self) -> (Result<()>, RollbackReport) {
        let Self { name, steps } = self;
        let mut completed: Vec<(String, Option<StepFn>)> = Vec::with_capacity(steps.len());

        for step in steps {
            tracing::debug!(transaction = %name, step = %step.name, "Running step");
            match (step.action)().await {
                Ok(()) => completed.push((step.name, step.rollback)),
                Err(error) => {
                    tracing::warn!(
                        transaction = %name,
                        step = %step.name,
                        error = %error,
                        "Step failed, rolling back {} completed step(s)",
                        completed.len()
                    );
                    let report = rollback(&name, completed, &error).await;
                    return (Err(error), report);
                }
            }
        }

        tracing::debug!(transaction = %name, "Transaction committed");
        (Ok(()), RollbackReport::default())
    }
}

async fn rollback(
    transaction: &str,
    completed: Vec<(String, Option<StepFn>)>,
    original: &Error,
) -> RollbackReport {
    let mut report = RollbackReport::default();

    for (step, undo) in completed.into_iter().rev() {
        let Some(undo) = undo else {
            continue;
        };
        match undo().await {
            Ok(()) => {
                tracing::debug!(transaction, step = %step, "Rolled back step");
                report.rolled_back.push(step);
            }
            Err(error) => {
                tracing::debug!(
                    transaction,
                    step = %step,
                    original_error = %original,
                    rollback_error = %error,
                    "Rollback failed"
                );
                report.failures.push(RollbackFailure { step, error });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::ErrorKind;

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, entry: &str) -> impl FnOnce() -> futures::future::Ready<Result<()>> {
        let log = Arc::clone(log);
        let entry = entry.to_string();
        move || {
            log.lock().map(|mut l| l.push(entry)).ok();
            futures::future::ready(Ok(()))
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_all_steps_run_in_order() -> Result<()> {
        let log = Log::default();
        Transaction::new("t")
            .step("one", record(&log, "do 1"), record(&log, "undo 1"))
            .step("two", record(&log, "do 2"), record(&log, "undo 2"))
            .execute()
            .await?;
        assert_eq!(entries(&log), ["do 1", "do 2"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_rolls_back_completed_steps_only() {
        let log = Log::default();
        let (result, report) = Transaction::new("t")
            .step("one", record(&log, "do 1"), record(&log, "undo 1"))
            .step(
                "two",
                || async { Err(Error::io_error("disk full")) },
                record(&log, "undo 2"),
            )
            .step("three", record(&log, "do 3"), record(&log, "undo 3"))
            .execute_with_report()
            .await;

        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::IoFailed));
        assert_eq!(entries(&log), ["do 1", "undo 1"]);
        assert_eq!(report.rolled_back, ["one"]);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_rollback_runs_in_reverse() {
        let log = Log::default();
        let result = Transaction::new("t")
            .step("one", record(&log, "do 1"), record(&log, "undo 1"))
            .step_no_rollback("two", record(&log, "do 2"))
            .step("three", record(&log, "do 3"), record(&log, "undo 3"))
            .step("four", || async { Err(Error::internal("nope")) }, || async { Ok(()) })
            .execute()
            .await;

        assert!(result.is_err());
        assert_eq!(entries(&log), ["do 1", "do 2", "do 3", "undo 3", "undo 1"]);
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_original_error() {
        let log = Log::default();
        let (result, report) = Transaction::new("t")
            .step("one", record(&log, "do 1"), record(&log, "undo 1"))
            .step(
                "two",
                record(&log, "do 2"),
                || async { Err(Error::io_error("cannot remove")) },
            )
            .step(
                "three",
                || async { Err(Error::WorkspaceExists("PROJ-1".into())) },
                || async { Ok(()) },
            )
            .execute_with_report()
            .await;

        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::WorkspaceExists));
        assert!(!report.is_clean());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, "two");
        assert_eq!(report.rolled_back, ["one"]);
        assert_eq!(entries(&log), ["do 1", "do 2", "undo 1"]);
    }
}
