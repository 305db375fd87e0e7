//! # Canopy Core
//!
//! Multi-repository workspaces built from git worktrees that share object
//! storage with canonical bare clones.
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()` - returns `Result` instead
//! - No `expect()` - returns `Result` instead
//! - No `panic!()` - returns `Result` instead
//! - No `unsafe` - safe Rust only
//! - No `todo!()` / `unimplemented!()` - complete implementations only
//!
//! ## Error Handling
//!
//! All fallible operations return `Result<T, Error>`. Use:
//! - `?` operator for propagation
//! - `map`, `and_then` combinators for transformation
//! - `match` / `map_or` / `unwrap_or_else` for defaults
//!
//! ## Layout
//!
//! - [`service`]: lifecycle orchestration, the entry point
//! - [`executor`], [`transaction`], [`retry`]: execution machinery
//! - [`lock`], [`metadata_cache`], [`disk_usage`]: shared state
//! - [`ports`]: collaborator traits, implemented by [`git`], [`storage`]
//!   and [`hooks`]

#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]

pub mod config;
pub mod disk_usage;
pub mod domain;
mod error;
pub mod executor;
pub mod git;
pub mod hooks;
pub mod lock;
pub mod metadata_cache;
pub mod ports;
pub mod retry;
pub mod service;
pub mod storage;
pub mod transaction;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::{load_config, Config};
pub use domain::{Repo, Workspace, WorkspaceState};
pub use error::{Error, ErrorClass, ErrorKind, GitFailure, Result};
pub use executor::{RepoExecutor, RepoTaskResult, RunOptions, RunReport};
pub use retry::{OperationClass, RetryPolicy};
pub use service::{
    CloseMode, CloseOptions, CloseOutcome, CreateOutcome, CreateRequest, WorkspaceService,
    WorkspaceStatus, WorkspaceSummary,
};
pub use tokio_util::sync::CancellationToken;
