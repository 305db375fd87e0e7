//! JSON file storage for workspace metadata
//!
//! ```text
//! <state_dir>/workspaces/<stem>.json   active workspaces
//! <state_dir>/closed/<stem>.json       archived workspaces
//! ```
//!
//! `<stem>` is the id itself when it is a short, safe file name, otherwise
//! `~<digest>`. Active lookups of such encoded ids report
//! [`Lookup::Unaddressable`] and are resolved by scanning.
//!
//! Writes go to a temporary sibling that is synced and renamed into place,
//! so readers never see a partial record.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;

use crate::{
    domain::{file_stem_for_id, is_addressable_id, Workspace, CURRENT_SCHEMA_VERSION},
    ports::{Location, Lookup, WorkspaceStore},
    Error, Result,
};

const ACTIVE_DIR: &str = "workspaces";
const CLOSED_DIR: &str = "closed";
const EXTENSION: &str = "json";

/// [`WorkspaceStore`] keeping one JSON file per workspace.
#[derive(Debug, Clone)]
pub struct FsWorkspaceStore {
    active: PathBuf,
    closed: PathBuf,
}

impl FsWorkspaceStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            active: state_dir.join(ACTIVE_DIR),
            closed: state_dir.join(CLOSED_DIR),
        }
    }

    fn active_path(&self, id: &str) -> PathBuf {
        record_path(&self.active, id)
    }

    fn closed_path(&self, id: &str) -> PathBuf {
        record_path(&self.closed, id)
    }
}

fn record_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.{EXTENSION}", file_stem_for_id(id)))
}

#[async_trait]
impl WorkspaceStore for FsWorkspaceStore {
    async fn create(&self, workspace: &Workspace) -> Result<Location> {
        let path = self.active_path(&workspace.id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(Error::WorkspaceExists(workspace.id.clone()));
        }
        write_record(path, workspace.clone()).await
    }

    async fn save(&self, workspace: &Workspace) -> Result<Location> {
        write_record(self.active_path(&workspace.id), workspace.clone()).await
    }

    async fn load(&self, location: &Location) -> Result<Workspace> {
        read_record(location.as_path().to_path_buf())
            .await?
            .ok_or_else(|| Error::WorkspaceNotFound(location.to_string()))
    }

    async fn load_by_id(&self, id: &str) -> Result<Lookup> {
        if !is_addressable_id(id) {
            return Ok(Lookup::Unaddressable);
        }
        let path = self.active_path(id);
        Ok(match read_record(path.clone()).await? {
            Some(workspace) if workspace.id == id => Lookup::Found(workspace, Location::new(path)),
            Some(workspace) => {
                tracing::warn!(id, found = %workspace.id, "Record id does not match its file name");
                Lookup::Missing
            }
            None => Lookup::Missing,
        })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        remove_record(&self.active_path(id)).await
    }

    async fn list(&self) -> Result<Vec<(Workspace, Location)>> {
        let dir = self.active.clone();
        let records = tokio::task::spawn_blocking(move || scan_dir(&dir))
            .await
            .map_err(|e| Error::internal(format!("Listing task failed: {e}")))??;
        Ok(records
            .into_iter()
            .map(|(workspace, path)| (workspace, Location::new(path)))
            .collect())
    }

    async fn close(&self, workspace: &Workspace) -> Result<Workspace> {
        let archived = workspace.archived();
        write_record(self.closed_path(&workspace.id), archived.clone()).await?;
        remove_record(&self.active_path(&workspace.id)).await?;
        Ok(archived)
    }

    async fn list_closed(&self) -> Result<Vec<Workspace>> {
        let dir = self.closed.clone();
        let records = tokio::task::spawn_blocking(move || scan_dir(&dir))
            .await
            .map_err(|e| Error::internal(format!("Listing task failed: {e}")))??;
        Ok(records.into_iter().map(|(workspace, _)| workspace).collect())
    }

    async fn load_closed(&self, id: &str) -> Result<Option<Workspace>> {
        read_record(self.closed_path(id)).await
    }

    async fn delete_closed(&self, id: &str) -> Result<()> {
        remove_record(&self.closed_path(id)).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FILE OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════

async fn write_record(path: PathBuf, workspace: Workspace) -> Result<Location> {
    tokio::task::spawn_blocking(move || -> Result<Location> {
        write_atomic(&path, &serde_json::to_vec_pretty(&workspace)?)?;
        Ok(Location::new(path))
    })
    .await
    .map_err(|e| Error::internal(format!("Write task failed: {e}")))?
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::internal(format!("'{}' has no parent", path.display())))?;
    fs::create_dir_all(dir)
        .map_err(|e| Error::io_error(format!("Failed to create '{}': {e}", dir.display())))?;

    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let written = fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(body)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));

    written.map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io_error(format!("Failed to write '{}': {e}", path.display()))
    })
}

async fn read_record(path: PathBuf) -> Result<Option<Workspace>> {
    let content = match tokio::fs::read(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::io_error(format!(
                "Failed to read '{}': {e}",
                path.display()
            )))
        }
    };
    parse_record(&path, &content).map(Some)
}

fn parse_record(path: &Path, content: &[u8]) -> Result<Workspace> {
    let workspace: Workspace = serde_json::from_slice(content).map_err(|e| {
        Error::internal(format!("Corrupt workspace record '{}': {e}", path.display()))
    })?;
    if workspace.version > CURRENT_SCHEMA_VERSION {
        return Err(Error::internal(format!(
            "Workspace record '{}' has schema version {}, newer than supported {CURRENT_SCHEMA_VERSION}",
            path.display(),
            workspace.version
        )));
    }
    Ok(workspace)
}

async fn remove_record(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_error(format!(
            "Failed to delete '{}': {e}",
            path.display()
        ))),
    }
}

/// Every parseable record in `dir`; unreadable ones are logged and skipped.
fn scan_dir(dir: &Path) -> Result<Vec<(Workspace, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::io_error(format!(
                "Failed to list '{}': {e}",
                dir.display()
            )))
        }
    };

    let mut records = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_record = path.extension().is_some_and(|ext| ext == EXTENSION)
            && !path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with('.'));
        if !is_record {
            continue;
        }
        match fs::read(&path)
            .map_err(Error::from)
            .and_then(|content| parse_record(&path, &content))
        {
            Ok(workspace) => records.push((workspace, path)),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable workspace record"),
        }
    }

    records.sort_by(|(a, _), (b, _)| a.id.cmp(&b.id));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{domain::Repo, ErrorKind};

    fn workspace(id: &str) -> Workspace {
        Workspace::new(
            id,
            "feature/x",
            vec![
                Repo::new("api", "git@example.com:org/api.git"),
                Repo::new("web", "git@example.com:org/web.git"),
            ],
        )
    }

    #[tokio::test]
    async fn test_create_and_load_by_id() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsWorkspaceStore::new(dir.path());
        let ws = workspace("PROJ-1");

        let location = store.create(&ws).await?;
        assert!(location.as_path().ends_with("workspaces/PROJ-1.json"));
        assert_eq!(store.load(&location).await?, ws);
        assert_eq!(store.load_by_id("PROJ-1").await?, Lookup::Found(ws, location));
        assert_eq!(store.load_by_id("PROJ-2").await?, Lookup::Missing);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_existing() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsWorkspaceStore::new(dir.path());
        store.create(&workspace("PROJ-1")).await?;

        let again = store.create(&workspace("PROJ-1")).await;
        assert_eq!(again.err().map(|e| e.kind()), Some(ErrorKind::WorkspaceExists));
        Ok(())
    }

    #[tokio::test]
    async fn test_unaddressable_id_is_found_by_list() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsWorkspaceStore::new(dir.path());
        let ws = workspace("feat #12");
        let location = store.save(&ws).await?;

        assert!(location.to_string().contains('~'));
        assert_eq!(store.load_by_id("feat #12").await?, Lookup::Unaddressable);
        let listed = store.list().await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0.id, "feat #12");
        Ok(())
    }

    #[tokio::test]
    async fn test_longest_spaced_id_round_trips() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsWorkspaceStore::new(dir.path());
        let id = format!("a b{}", "c".repeat(crate::domain::MAX_ID_LEN - 3));
        crate::domain::validate_workspace_id(&id)?;

        store.create(&workspace(&id)).await?;
        store.create(&workspace("x-612062")).await?;
        let mut ids: Vec<_> = store.list().await?.into_iter().map(|(ws, _)| ws.id).collect();
        ids.sort();
        assert_eq!(ids, [id.clone(), "x-612062".to_string()]);

        let archived = store.close(&workspace(&id)).await?;
        assert_eq!(store.load_closed(&id).await?, Some(archived));
        Ok(())
    }

    #[tokio::test]
    async fn test_close_moves_record_to_archive() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsWorkspaceStore::new(dir.path());
        store.create(&workspace("PROJ-1")).await?;

        let archived = store.close(&workspace("PROJ-1")).await?;
        assert!(archived.closed_at.is_some());
        assert_eq!(store.load_by_id("PROJ-1").await?, Lookup::Missing);
        assert_eq!(store.load_closed("PROJ-1").await?, Some(archived));
        assert_eq!(store.list_closed().await?.len(), 1);

        store.delete_closed("PROJ-1").await?;
        assert!(store.load_closed("PROJ-1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsWorkspaceStore::new(dir.path());
        store.create(&workspace("PROJ-1")).await?;
        store.delete("PROJ-1").await?;
        store.delete("PROJ-1").await?;
        assert!(store.list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_and_temp_files() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsWorkspaceStore::new(dir.path());
        store.create(&workspace("b")).await?;
        store.create(&workspace("a")).await?;
        fs::write(dir.path().join("workspaces/broken.json"), b"{not json")?;
        fs::write(dir.path().join("workspaces/.123.tmp"), b"partial")?;

        let ids: Vec<_> = store.list().await?.into_iter().map(|(ws, _)| ws.id).collect();
        assert_eq!(ids, ["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_newer_schema_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsWorkspaceStore::new(dir.path());
        let mut ws = workspace("PROJ-1");
        ws.version = CURRENT_SCHEMA_VERSION + 1;
        store.save(&ws).await?;

        assert!(store.load_by_id("PROJ-1").await.is_err());
        Ok(())
    }
}
