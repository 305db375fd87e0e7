//! Error types for Canopy with categorization:
//!
//! - **Validation errors**: bad input or configuration (exit code 1)
//! - **System errors**: IO, git, hooks, per-repo commands, cancellation (exit code 2)
//! - **Not found**: missing workspaces (exit code 3)
//! - **State errors**: existing/locked workspaces, unclean repositories (exit code 4)
//!
//! Every variant maps onto a stable, machine-readable [`ErrorKind`] so scripts
//! can branch on the failure class without parsing messages.

use serde::Serialize;
use strum::{Display, EnumString, IntoStaticStr};

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable machine-readable error kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    WorkspaceNotFound,
    WorkspaceExists,
    WorkspaceLocked,
    RepoNotClean,
    RepoInUse,
    GitOperationFailed,
    OperationCancelled,
    OperationTimeout,
    HookFailed,
    HookTimeout,
    CommandFailed,
    IoFailed,
    InvalidInput,
    InvalidConfig,
    InternalError,
}

/// Sub-classification of git adapter failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GitFailure {
    /// Authentication or authorization rejected by the remote
    Auth,
    /// Timeout, refused connection, DNS failure and friends
    Network,
    /// Remote repository, ref or path does not exist
    NotFound,
    /// Local filesystem permission problem
    Permission,
    Other,
}

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Error is transient and can be retried.
    Transient,
    /// Error is permanent and should not be retried.
    Permanent,
}

/// Top-level error type for every fallible Canopy operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Workspace '{0}' not found")]
    WorkspaceNotFound(String),

    #[error("Workspace '{0}' already exists")]
    WorkspaceExists(String),

    #[error("Workspace '{id}' is locked by {holder} (since {acquired_at})")]
    WorkspaceLocked {
        id: String,
        holder: String,
        acquired_at: String,
    },

    #[error("Repository '{repo}' is not clean: {reason}")]
    RepoNotClean { repo: String, reason: String },

    #[error("Repository '{repo}' is already part of workspace '{workspace}'")]
    RepoInUse { repo: String, workspace: String },

    #[error("Failed to {operation} '{target}' ({failure}): {message}")]
    GitOperationFailed {
        operation: String,
        target: String,
        failure: GitFailure,
        message: String,
    },

    #[error("Operation '{0}' was cancelled")]
    OperationCancelled(String),

    #[error("Operation '{operation}' timed out after {elapsed_ms}ms")]
    OperationTimeout { operation: String, elapsed_ms: u64 },

    #[error("Hook '{stage}' failed: {command}\nExit code: {exit_code:?}\nStderr: {stderr}")]
    HookFailed {
        stage: String,
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Hook '{stage}' timed out after {timeout_secs}s: {command}")]
    HookTimeout {
        stage: String,
        command: String,
        timeout_secs: u64,
    },

    #[error("Command failed in '{repo}' with exit code {exit_code}: {stderr}")]
    CommandFailed {
        repo: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("IO error: {0}")]
    IoFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// The last error observed by the retry policy once attempts ran out.
    #[error("{operation} failed after {attempts} attempts (retries exhausted): {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        source: Box<Error>,
    },
}

// Convenience constructors
impl Error {
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::IoFailed(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::OperationCancelled(operation.into())
    }

    pub fn git(
        operation: impl Into<String>,
        target: impl Into<String>,
        failure: GitFailure,
        message: impl Into<String>,
    ) -> Self {
        Self::GitOperationFailed {
            operation: operation.into(),
            target: target.into(),
            failure,
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::OperationTimeout {
            operation: operation.into(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Stable machine-readable kind. Retry wrappers report their source's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WorkspaceNotFound(_) => ErrorKind::WorkspaceNotFound,
            Self::WorkspaceExists(_) => ErrorKind::WorkspaceExists,
            Self::WorkspaceLocked { .. } => ErrorKind::WorkspaceLocked,
            Self::RepoNotClean { .. } => ErrorKind::RepoNotClean,
            Self::RepoInUse { .. } => ErrorKind::RepoInUse,
            Self::GitOperationFailed { .. } => ErrorKind::GitOperationFailed,
            Self::OperationCancelled(_) => ErrorKind::OperationCancelled,
            Self::OperationTimeout { .. } => ErrorKind::OperationTimeout,
            Self::HookFailed { .. } => ErrorKind::HookFailed,
            Self::HookTimeout { .. } => ErrorKind::HookTimeout,
            Self::CommandFailed { .. } => ErrorKind::CommandFailed,
            Self::IoFailed(_) => ErrorKind::IoFailed,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Internal(_) => ErrorKind::InternalError,
            Self::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    /// The innermost error, looking through retry wrappers.
    pub fn root(&self) -> &Self {
        match self {
            Self::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Git failure sub-kind, if this is a git error.
    pub fn git_failure(&self) -> Option<GitFailure> {
        match self.root() {
            Self::GitOperationFailed { failure, .. } => Some(*failure),
            _ => None,
        }
    }

    /// Classify the error for the retry policy.
    ///
    /// Network-class git failures are transient; auth, not-found and
    /// malformed-input failures are permanent. IO errors fall back to
    /// message classification.
    pub fn retry_class(&self) -> ErrorClass {
        match self {
            Self::GitOperationFailed {
                failure: GitFailure::Network,
                ..
            } => ErrorClass::Transient,
            Self::GitOperationFailed {
                failure: GitFailure::Other,
                message,
                ..
            }
            | Self::IoFailed(message) => crate::retry::classify_error_message(message),
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.retry_class() == ErrorClass::Transient
    }

    /// Returns the appropriate exit code for this error type.
    ///
    /// - 1: User error (validation, invalid input, bad configuration)
    /// - 2: System error (IO, git, hooks, commands, cancellation)
    /// - 3: Not found
    /// - 4: Invalid state (exists, locked, unclean)
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::InvalidInput | ErrorKind::InvalidConfig => 1,
            ErrorKind::WorkspaceNotFound => 3,
            ErrorKind::WorkspaceExists
            | ErrorKind::WorkspaceLocked
            | ErrorKind::RepoNotClean
            | ErrorKind::RepoInUse => 4,
            ErrorKind::GitOperationFailed
            | ErrorKind::OperationCancelled
            | ErrorKind::OperationTimeout
            | ErrorKind::HookFailed
            | ErrorKind::HookTimeout
            | ErrorKind::CommandFailed
            | ErrorKind::IoFailed
            | ErrorKind::InternalError => 2,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io_error(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("Failed to (de)serialize workspace metadata: {err}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_config(format!("Failed to parse config: {err}"))
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Self::io_error(err.to_string())
    }
}
