//! Workspace domain model
//!
//! A workspace is a named set of worktrees, one per repository, all checked
//! out to the same branch. The lifecycle is:
//!
//! ```text
//! Absent ──create──▶ Active ──close(delete)──▶ Absent
//!                      │  ▲
//!          close(archive) restore
//!                      ▼  │
//!                    Archived
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Current on-disk schema version for workspace metadata.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Maximum accepted length of a workspace identifier.
pub const MAX_ID_LEN: usize = 255;

/// A repository reference: name plus clone URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repo {
    pub name: String,
    pub url: String,
}

impl Repo {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Derive a repository name from its URL (`git@host:org/api.git` → `api`).
    pub fn from_url(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let name = url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .map(|last| last.trim_end_matches(".git"))
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::invalid_input(format!("Cannot derive repo name from '{url}'")))?
            .to_string();
        validate_repo_name(&name)?;
        Ok(Self { name, url })
    }
}

/// Persisted workspace metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub branch: String,
    pub repos: Vec<Repo>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Whether another operation currently holds this workspace's lock.
    /// Filled in by read paths, never persisted.
    #[serde(skip)]
    pub locked: bool,
}

const fn default_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

impl Workspace {
    pub fn new(id: impl Into<String>, branch: impl Into<String>, repos: Vec<Repo>) -> Self {
        Self {
            id: id.into(),
            branch: branch.into(),
            repos,
            created_at: Utc::now(),
            closed_at: None,
            version: CURRENT_SCHEMA_VERSION,
            locked: false,
        }
    }

    pub fn state(&self) -> WorkspaceState {
        if self.closed_at.is_some() {
            WorkspaceState::Archived
        } else {
            WorkspaceState::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn repo(&self, name: &str) -> Option<&Repo> {
        self.repos.iter().find(|repo| repo.name == name)
    }

    pub fn has_repo(&self, name: &str) -> bool {
        self.repo(name).is_some()
    }

    /// Copy of this workspace marked as archived now.
    pub fn archived(&self) -> Self {
        Self {
            closed_at: Some(Utc::now()),
            locked: false,
            ..self.clone()
        }
    }

    /// Copy of this workspace with the archive marker cleared.
    pub fn reactivated(&self) -> Self {
        Self {
            closed_at: None,
            locked: false,
            ..self.clone()
        }
    }
}

/// Lifecycle state of a workspace identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Absent,
    Active,
    Archived,
}

impl WorkspaceState {
    pub const ALL: [Self; 3] = [Self::Absent, Self::Active, Self::Archived];

    pub fn can_transition_to(self, next: Self) -> bool {
        self.valid_next_states().contains(&next)
    }

    pub fn valid_next_states(self) -> Vec<Self> {
        match self {
            Self::Absent => vec![Self::Active],
            Self::Active => vec![Self::Absent, Self::Archived],
            Self::Archived => vec![Self::Active, Self::Absent],
        }
    }
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Active => write!(f, "active"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

/// Validate a workspace identifier.
///
/// Identifiers become directory names, so path separators, parent
/// references, leading dots and control characters are rejected.
pub fn validate_workspace_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::invalid_input("workspace id cannot be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(Error::invalid_input(format!(
            "workspace id cannot exceed {MAX_ID_LEN} characters"
        )));
    }
    if id.starts_with('.') {
        return Err(Error::invalid_input(format!(
            "workspace id '{id}' cannot start with '.'"
        )));
    }
    if id.contains(['/', '\\']) || id.chars().any(char::is_control) {
        return Err(Error::invalid_input(format!(
            "workspace id '{id}' contains path separators or control characters"
        )));
    }
    Ok(())
}

/// Longest id used verbatim as a file stem. Leaves room for suffixes such
/// as `.lock.guard` under the usual 255-byte file name limit.
pub const MAX_VERBATIM_STEM: usize = 200;

/// Hex characters of the SHA-256 digest kept in an encoded stem.
const DIGEST_STEM_LEN: usize = 32;

/// Whether `id` can be used verbatim as a file stem.
pub fn is_addressable_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_VERBATIM_STEM
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// File stem used for per-workspace files: the id itself when addressable,
/// otherwise `~<sha256(id)>` truncated to a fixed length. `~` never occurs
/// in an addressable id, so the two forms cannot collide.
pub fn file_stem_for_id(id: &str) -> String {
    use sha2::{Digest, Sha256};

    if is_addressable_id(id) {
        return id.to_string();
    }
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("~{}", &digest[..DIGEST_STEM_LEN])
}

pub fn validate_repo_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', ' ']) {
        return Err(Error::invalid_input(format!("invalid repository name '{name}'")));
    }
    Ok(())
}

/// Validate a branch name with the subset of `git check-ref-format` rules
/// that matter before handing it to git.
pub fn validate_branch(branch: &str) -> Result<()> {
    let invalid = branch.is_empty()
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("@{")
        || branch
            .chars()
            .any(|c| c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'));
    if invalid {
        return Err(Error::invalid_input(format!("invalid branch name '{branch}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_from_url() -> Result<()> {
        assert_eq!(Repo::from_url("git@github.com:org/api.git")?.name, "api");
        assert_eq!(Repo::from_url("https://example.com/org/web/")?.name, "web");
        assert!(Repo::from_url("").is_err());
        Ok(())
    }

    #[test]
    fn test_workspace_state_follows_closed_at() {
        let ws = Workspace::new("PROJ-1", "feature/x", vec![Repo::new("api", "u")]);
        assert_eq!(ws.state(), WorkspaceState::Active);
        let archived = ws.archived();
        assert_eq!(archived.state(), WorkspaceState::Archived);
        assert_eq!(archived.reactivated().state(), WorkspaceState::Active);
    }

    #[test]
    fn test_transitions() {
        assert!(WorkspaceState::Absent.can_transition_to(WorkspaceState::Active));
        assert!(!WorkspaceState::Absent.can_transition_to(WorkspaceState::Archived));
        assert!(WorkspaceState::Archived.can_transition_to(WorkspaceState::Active));
        for state in WorkspaceState::ALL {
            assert!(!state.valid_next_states().is_empty());
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn test_locked_flag_not_persisted() -> Result<()> {
        let mut ws = Workspace::new("PROJ-1", "main", Vec::new());
        ws.locked = true;
        let json = serde_json::to_string(&ws)?;
        assert!(!json.contains("locked"));
        let back: Workspace = serde_json::from_str(&json)?;
        assert!(!back.locked);
        assert_eq!(back.version, CURRENT_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn test_validate_workspace_id() {
        assert!(validate_workspace_id("PROJ-1").is_ok());
        assert!(validate_workspace_id("feat #12").is_ok());
        assert!(validate_workspace_id("").is_err());
        assert!(validate_workspace_id("a/b").is_err());
        assert!(validate_workspace_id("..").is_err());
        assert!(validate_workspace_id(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_file_stem_for_id() {
        assert_eq!(file_stem_for_id("PROJ-1"), "PROJ-1");
        assert!(is_addressable_id("a.b_c-1"));
        assert!(!is_addressable_id("feat #12"));
        assert!(!is_addressable_id(&"a".repeat(MAX_VERBATIM_STEM + 1)));

        let encoded = file_stem_for_id("a b");
        assert!(encoded.starts_with('~'));
        assert_eq!(encoded.len(), 1 + DIGEST_STEM_LEN);
        assert_eq!(encoded, file_stem_for_id("a b"));
        assert_ne!(encoded, file_stem_for_id("a  b"));
    }

    #[test]
    fn test_long_and_spaced_ids_get_bounded_stems() -> Result<()> {
        let id = format!("a b{}", "c".repeat(MAX_ID_LEN - 3));
        validate_workspace_id(&id)?;
        assert!(file_stem_for_id(&id).len() < 64);

        let long = "d".repeat(MAX_ID_LEN);
        validate_workspace_id(&long)?;
        assert!(file_stem_for_id(&long).starts_with('~'));

        // A literal id shaped like an old-style encoding stays verbatim.
        assert_eq!(file_stem_for_id("x-612062"), "x-612062");
        assert_ne!(file_stem_for_id("x-612062"), file_stem_for_id("a b"));
        Ok(())
    }

    #[test]
    fn test_validate_branch() {
        assert!(validate_branch("feature/PROJ-1").is_ok());
        assert!(validate_branch("bad..name").is_err());
        assert!(validate_branch("-rf").is_err());
        assert!(validate_branch("a b").is_err());
        assert!(validate_branch("x.lock").is_err());
    }
}
