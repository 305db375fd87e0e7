//! Retry policy for flaky network-bound operations
//!
//! Transient failures (timeouts, refused connections, DNS failures) are
//! retried with exponential backoff and per-attempt jitter. Permanent
//! failures (auth, not-found, malformed input) return on the first attempt.
//!
//! Cancellation is observed before every attempt, while an attempt runs and
//! while a backoff delay is pending. Every call also runs under an overall
//! time budget; callers that pass none get the default for their
//! [`OperationClass`].

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{config::RetryConfig, error::ErrorClass, Error, Result};

/// What kind of work is being retried; selects the default time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    /// clone/fetch/push/pull against a remote
    Network,
    /// local filesystem or git metadata work
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    network_timeout: Duration,
    local_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy from already-validated configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_delay().min(config.max_delay()),
            max_delay: config.max_delay(),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            network_timeout: config.network_timeout(),
            local_timeout: config.local_timeout(),
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay bounds; `initial` is capped at `max`.
    #[must_use]
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial.min(max);
        self.max_delay = max;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Overall budget applied when the caller supplies none.
    pub const fn default_budget(&self, class: OperationClass) -> Duration {
        match class {
            OperationClass::Network => self.network_timeout,
            OperationClass::Local => self.local_timeout,
        }
    }

    /// Unjittered delay before attempt `attempt` (1-based).
    ///
    /// Attempt 1 has no delay; attempt N≥2 waits
    /// `min(max_delay, initial_delay * multiplier^(N-2))`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        self.clamp_secs(secs)
    }

    /// Backoff delay perturbed by up to ±`jitter` of itself, never above `max_delay`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.backoff_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        self.clamp_secs(base.as_secs_f64() * factor)
    }

    fn clamp_secs(&self, secs: f64) -> Duration {
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else if secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts, exceeds its time budget, or is cancelled.
    ///
    /// # Errors
    ///
    /// - the operation's own error when it is permanent
    /// - `RetriesExhausted` wrapping the last transient error
    /// - `OperationCancelled` when `cancel` fires, including mid-backoff
    /// - `OperationTimeout` when the overall budget elapses
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        class: OperationClass,
        budget: Option<Duration>,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let budget = budget.unwrap_or_else(|| self.default_budget(class));
        match tokio::time::timeout(budget, self.run_attempts(operation, cancel, op)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, budget_ms = budget.as_millis(), "Operation timed out");
                Err(Error::timeout(operation, budget))
            }
        }
    }

    /// Run `work` once under the default budget for `class`. For local git
    /// and filesystem steps that are not safe to repeat.
    ///
    /// # Errors
    ///
    /// - the work's own error
    /// - `OperationCancelled` when `cancel` fires
    /// - `OperationTimeout` when the budget elapses
    pub async fn bounded<T, Fut>(
        &self,
        operation: &str,
        class: OperationClass,
        cancel: &CancellationToken,
        work: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let budget = self.default_budget(class);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::cancelled(operation)),
            outcome = tokio::time::timeout(budget, work) => outcome.unwrap_or_else(|_| {
                tracing::warn!(operation, budget_ms = budget.as_millis(), "Operation timed out");
                Err(Error::timeout(operation, budget))
            }),
        }
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(operation));
            }

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::cancelled(operation)),
                outcome = op() => outcome,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            if attempt >= self.max_attempts {
                tracing::warn!(
                    operation,
                    attempts = attempt,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(Error::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            attempt += 1;
            let delay = self.jittered_delay(attempt, &mut rand::thread_rng());
            tracing::info!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis(),
                error = %err,
                "Transient failure, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::cancelled(operation)),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Classify an error from its message.
///
/// Permanent patterns win over transient ones; unknown messages are
/// permanent so that surprises are surfaced instead of retried.
pub fn classify_error_message(error_msg: &str) -> ErrorClass {
    const PERMANENT_PATTERNS: [&str; 14] = [
        "authentication failed",
        "permission denied",
        "access denied",
        "not authorized",
        "403",
        "401",
        "404",
        "not found",
        "does not exist",
        "no such file",
        "malformed",
        "invalid",
        "corrupt",
        "parse error",
    ];

    const TRANSIENT_PATTERNS: [&str; 15] = [
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "connection closed",
        "network is unreachable",
        "network unreachable",
        "could not resolve host",
        "temporary failure in name resolution",
        "name or service not known",
        "temporarily unavailable",
        "deadline exceeded",
        "early eof",
        "the remote end hung up",
        "try again",
    ];

    let lower = error_msg.to_lowercase();

    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Permanent;
    }

    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Transient;
    }

    ErrorClass::Permanent
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{ErrorKind, GitFailure};

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_delays(Duration::from_millis(100), Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_jitter(0.2)
    }

    fn transient() -> Error {
        Error::git("fetch", "api", GitFailure::Network, "operation timed out")
    }

    #[test]
    fn test_backoff_schedule() {
        let p = policy();
        assert_eq!(p.backoff_delay(1), Duration::ZERO);
        assert_eq!(p.backoff_delay(2), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(4), Duration::from_millis(400));
        assert_eq!(p.backoff_delay(10), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 2..12 {
            let base = p.backoff_delay(attempt).as_secs_f64();
            let jittered = p.jittered_delay(attempt, &mut rng);
            assert!(jittered <= p.max_delay());
            assert!(jittered.as_secs_f64() >= base * 0.8 - 1e-9);
            assert!(jittered.as_secs_f64() <= (base * 1.2).min(1.0) + 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_single_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<()> = policy()
            .execute(
                "clone api",
                OperationClass::Network,
                None,
                &CancellationToken::new(),
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::git("clone", "api", GitFailure::Auth, "HTTP 403")) }
                },
            )
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(result.err().and_then(|e| e.git_failure()), Some(GitFailure::Auth));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_exhausts_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let started = tokio::time::Instant::now();
        let result: Result<()> = policy()
            .with_jitter(0.0)
            .execute(
                "fetch api",
                OperationClass::Network,
                None,
                &CancellationToken::new(),
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(transient()) }
                },
            )
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
        match result {
            Err(Error::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() -> Result<()> {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let value = policy()
            .execute(
                "fetch api",
                OperationClass::Network,
                None,
                &CancellationToken::new(),
                || {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(transient())
                        } else {
                            Ok(n)
                        }
                    }
                },
            )
            .await?;
        assert_eq!(value, 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_returns_cancelled() {
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        let policy = policy().with_delays(Duration::from_secs(60), Duration::from_secs(60));

        let handle = tokio::spawn(async move {
            policy
                .execute("fetch api", OperationClass::Network, None, &cancel, || async {
                    Err::<(), _>(transient())
                })
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        trip.cancel();

        let result = handle.await.map_err(|e| Error::internal(e.to_string()));
        assert_eq!(
            result.and_then(|r| r).err().map(|e| e.kind()),
            Some(ErrorKind::OperationCancelled)
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = AtomicU32::new(0);
        let result: Result<()> = policy()
            .execute("fetch", OperationClass::Local, None, &cancel, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert!(matches!(result, Err(Error::OperationCancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exceeded_returns_timeout() {
        let result: Result<()> = policy()
            .execute(
                "clone huge",
                OperationClass::Network,
                Some(Duration::from_secs(2)),
                &CancellationToken::new(),
                || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                },
            )
            .await;
        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(ErrorKind::OperationTimeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_local_work_hits_local_budget() {
        let started = tokio::time::Instant::now();
        let result: Result<()> = RetryPolicy::default()
            .bounded(
                "create worktree api",
                OperationClass::Local,
                &CancellationToken::new(),
                std::future::pending(),
            )
            .await;

        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(ErrorKind::OperationTimeout)
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
    }

    #[tokio::test]
    async fn test_bounded_runs_once_and_honours_cancel() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .bounded("status api", OperationClass::Local, &CancellationToken::new(), async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            })
            .await;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::GitOperationFailed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = policy()
            .bounded("status api", OperationClass::Local, &cancel, std::future::pending())
            .await;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::OperationCancelled));
    }

    #[test]
    fn test_default_budgets() {
        let p = RetryPolicy::default();
        assert_eq!(p.default_budget(OperationClass::Network), Duration::from_secs(300));
        assert_eq!(p.default_budget(OperationClass::Local), Duration::from_secs(30));
    }

    #[test]
    fn test_classify_error_message() {
        assert_eq!(
            classify_error_message("ssh: connect to host: Connection refused"),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error_message("Could not resolve host: github.com"),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error_message("The requested URL returned error: 403"),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_error_message("something weird happened"),
            ErrorClass::Permanent
        );
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_bounded(
            initial_ms in 1u64..5_000,
            extra_ms in 0u64..60_000,
            multiplier in 1.0f64..8.0,
            attempt in 2u32..64,
        ) {
            let max = Duration::from_millis(initial_ms + extra_ms);
            let p = RetryPolicy::default()
                .with_delays(Duration::from_millis(initial_ms), max)
                .with_multiplier(multiplier);
            prop_assert!(p.backoff_delay(attempt) <= p.backoff_delay(attempt + 1));
            prop_assert!(p.backoff_delay(attempt + 1) <= max);
        }
    }
}
