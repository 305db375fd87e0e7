//! Hook execution for lifecycle events
//!
//! - `post_create`: after a workspace and its worktrees exist
//! - `pre_close`: before a workspace is deleted or archived
//!
//! Hooks execute sequentially in the workspace directory using the user's
//! shell, with the workspace described in `CANOPY_WORKSPACE_*` variables.

use std::{
    path::Path,
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{HookSpec, HooksConfig},
    ports::{HookContext, HookExecutor, HookReport, HookResult, HookStage},
    Error, Result,
};

// ═══════════════════════════════════════════════════════════════════════════
// SHELL HOOK EXECUTOR
// ═══════════════════════════════════════════════════════════════════════════

/// Runs hooks through `$SHELL -c`.
#[derive(Debug, Clone)]
pub struct ShellHookExecutor {
    default_timeout: Duration,
    continue_on_error: bool,
}

impl ShellHookExecutor {
    pub const fn new(default_timeout: Duration, continue_on_error: bool) -> Self {
        Self {
            default_timeout,
            continue_on_error,
        }
    }

    pub const fn from_config(config: &HooksConfig) -> Self {
        Self::new(Duration::from_secs(config.timeout_secs), config.continue_on_error)
    }

    fn timeout_for(&self, hook: &HookSpec) -> Duration {
        hook.timeout_secs
            .map_or(self.default_timeout, Duration::from_secs)
    }

    fn tolerates_failure(&self, hook: &HookSpec) -> bool {
        hook.continue_on_error.unwrap_or(self.continue_on_error)
    }

    /// Execute a single hook command.
    async fn execute_hook(
        shell: &str,
        stage: HookStage,
        hook: &HookSpec,
        timeout: Duration,
        ctx: &HookContext,
        cancel: &CancellationToken,
    ) -> Result<HookResult> {
        let started = Instant::now();
        let child = Command::new(shell)
            .arg("-c")
            .arg(&hook.command)
            .current_dir(&ctx.path)
            .envs(hook_env(stage, ctx))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::HookFailed {
                stage: stage.to_string(),
                command: hook.command.clone(),
                exit_code: None,
                stderr: format!("failed to start: {e}"),
            })?;

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(Error::cancelled(format!("{stage} hook '{}'", hook.command)));
            }
            waited = tokio::time::timeout(timeout, child.wait_with_output()) => match waited {
                Ok(output) => output.map_err(|e| Error::io_error(format!("Failed to wait for hook: {e}")))?,
                Err(_) => {
                    return Err(Error::HookTimeout {
                        stage: stage.to_string(),
                        command: hook.command.clone(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();
        let error = (!output.status.success()).then(|| Error::HookFailed {
            stage: stage.to_string(),
            command: hook.command.clone(),
            exit_code,
            stderr: stderr.trim().to_string(),
        });

        Ok(HookResult {
            command: hook.command.clone(),
            exit_code,
            stdout,
            stderr,
            duration: started.elapsed(),
            error,
        })
    }
}

#[async_trait]
impl HookExecutor for ShellHookExecutor {
    async fn run(
        &self,
        stage: HookStage,
        hooks: &[HookSpec],
        ctx: &HookContext,
        cancel: &CancellationToken,
    ) -> Result<HookReport> {
        let mut report = HookReport::default();
        if hooks.is_empty() {
            return Ok(report);
        }

        let shell = get_user_shell()?;
        let total = hooks.len();

        for (index, hook) in hooks.iter().enumerate() {
            tracing::info!(
                stage = %stage,
                hook = index + 1,
                total,
                command = %hook.command,
                "Running hook"
            );

            let timeout = self.timeout_for(hook);
            let result = match Self::execute_hook(&shell, stage, hook, timeout, ctx, cancel).await {
                Ok(result) => result,
                Err(e) if e.kind() == crate::ErrorKind::OperationCancelled => return Err(e),
                Err(e) => HookResult {
                    command: hook.command.clone(),
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: timeout,
                    error: Some(e),
                },
            };

            if let Some(error) = &result.error {
                if !self.tolerates_failure(hook) {
                    return Err(error.clone());
                }
                tracing::warn!(stage = %stage, command = %hook.command, error = %error, "Hook failed, continuing");
            }
            report.results.push(result);
        }

        Ok(report)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

fn hook_env(stage: HookStage, ctx: &HookContext) -> Vec<(&'static str, String)> {
    vec![
        ("CANOPY_HOOK_STAGE", stage.to_string()),
        ("CANOPY_WORKSPACE_ID", ctx.workspace_id.clone()),
        ("CANOPY_WORKSPACE_BRANCH", ctx.branch.clone()),
        ("CANOPY_WORKSPACE_PATH", path_string(&ctx.path)),
        ("CANOPY_WORKSPACE_REPOS", ctx.repos.join(" ")),
    ]
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Get the user's default shell from the SHELL environment variable
///
/// Falls back to `/bin/sh` if SHELL is not set.
///
/// # Errors
///
/// Returns error if the shell path is empty
fn get_user_shell() -> Result<String> {
    std::env::var("SHELL")
        .or_else(|_| Ok("/bin/sh".to_string()))
        .and_then(|shell| {
            if shell.is_empty() {
                Err(Error::invalid_config("SHELL environment variable is empty"))
            } else {
                Ok(shell)
            }
        })
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
