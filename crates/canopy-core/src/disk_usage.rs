//! TTL-cached disk usage of workspace directories
//!
//! Listing views show size and last-modified time for every workspace, which
//! means a recursive walk per workspace. Results are kept for a TTL so that
//! repeated listings stay cheap. Failed walks are cached too, so an outage
//! does not turn into a walk per call.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use tokio::time::Instant;
use walkdir::WalkDir;

use crate::{Error, Result};

/// Version control metadata directories excluded from the total.
const SKIPPED_DIRS: [&str; 4] = [".git", ".jj", ".hg", ".svn"];

/// Aggregate size of a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub bytes: u64,
    pub latest_modified: Option<SystemTime>,
}

#[derive(Debug, Clone)]
struct UsageEntry {
    usage: DiskUsage,
    scanned_at: Instant,
    error: Option<String>,
}

/// Path → usage cache with a fixed TTL.
#[derive(Debug, Clone)]
pub struct DiskUsageCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<PathBuf, UsageEntry>>>,
}

impl DiskUsageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::default(),
        }
    }

    /// Usage of the tree rooted at `root`, served from cache while fresh.
    ///
    /// # Errors
    ///
    /// Returns `IoFailed` if the walk failed (now or within the TTL)
    pub async fn usage(&self, root: &Path) -> Result<DiskUsage> {
        if let Some(entry) = self.fresh_entry(root) {
            return entry
                .error
                .map_or(Ok(entry.usage), |message| Err(Error::io_error(message)));
        }

        let walk_root = root.to_path_buf();
        let scanned = tokio::task::spawn_blocking(move || scan(&walk_root))
            .await
            .map_err(|e| Error::internal(format!("Disk usage task failed: {e}")))?;

        let entry = match &scanned {
            Ok(usage) => UsageEntry {
                usage: *usage,
                scanned_at: Instant::now(),
                error: None,
            },
            Err(e) => {
                tracing::debug!(path = %root.display(), error = %e, "Disk usage scan failed");
                UsageEntry {
                    usage: DiskUsage::default(),
                    scanned_at: Instant::now(),
                    error: Some(e.to_string()),
                }
            }
        };
        self.entries().insert(root.to_path_buf(), entry);
        scanned
    }

    pub fn invalidate(&self, root: &Path) {
        self.entries().remove(root);
    }

    pub fn invalidate_all(&self) {
        self.entries().clear();
    }

    fn fresh_entry(&self, root: &Path) -> Option<UsageEntry> {
        self.entries()
            .get(root)
            .filter(|entry| entry.scanned_at.elapsed() < self.ttl)
            .cloned()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, UsageEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Walk `root` without following links, summing regular file sizes.
fn scan(root: &Path) -> Result<DiskUsage> {
    let mut usage = DiskUsage::default();

    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| SKIPPED_DIRS.contains(&name)))
    });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        usage.bytes = usage.bytes.saturating_add(metadata.len());
        if let Ok(modified) = metadata.modified() {
            usage.latest_modified = usage.latest_modified.max(Some(modified));
        }
    }

    Ok(usage)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn populate(dir: &TempDir) -> Result<()> {
        fs::write(dir.path().join("a.txt"), b"hello")?;
        fs::create_dir_all(dir.path().join("src"))?;
        fs::write(dir.path().join("src/lib.rs"), b"fn main() {}")?;
        fs::create_dir_all(dir.path().join(".git/objects"))?;
        fs::write(dir.path().join(".git/objects/pack"), vec![0_u8; 4096])?;
        Ok(())
    }

    #[tokio::test]
    async fn test_sums_files_and_skips_vcs_dirs() -> Result<()> {
        let dir = TempDir::new()?;
        populate(&dir)?;

        let cache = DiskUsageCache::new(Duration::from_secs(60));
        let usage = cache.usage(dir.path()).await?;
        assert_eq!(usage.bytes, 5 + 12);
        assert!(usage.latest_modified.is_some());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_not_counted() -> Result<()> {
        let dir = TempDir::new()?;
        let outside = TempDir::new()?;
        fs::write(outside.path().join("big"), vec![0_u8; 10_000])?;
        fs::write(dir.path().join("small"), b"abc")?;
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link"))?;
        std::os::unix::fs::symlink(outside.path().join("big"), dir.path().join("big-link"))?;

        let usage = DiskUsageCache::new(Duration::from_secs(60)).usage(dir.path()).await?;
        assert_eq!(usage.bytes, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_hit_within_ttl_skips_walk() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), b"hello")?;

        let cache = DiskUsageCache::new(Duration::from_secs(60));
        assert_eq!(cache.usage(dir.path()).await?.bytes, 5);

        fs::write(dir.path().join("b.txt"), b"more bytes")?;
        assert_eq!(cache.usage(dir.path()).await?.bytes, 5);

        cache.invalidate(dir.path());
        assert_eq!(cache.usage(dir.path()).await?.bytes, 15);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_entry_is_rescanned() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), b"hello")?;

        let cache = DiskUsageCache::new(Duration::from_millis(20));
        assert_eq!(cache.usage(dir.path()).await?.bytes, 5);
        fs::write(dir.path().join("b.txt"), b"!")?;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.usage(dir.path()).await?.bytes, 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_walk_error_is_cached() -> Result<()> {
        let dir = TempDir::new()?;
        let missing = dir.path().join("gone");

        let cache = DiskUsageCache::new(Duration::from_secs(60));
        assert!(cache.usage(&missing).await.is_err());

        // Directory appears, but the cached failure is served until expiry.
        fs::create_dir_all(&missing)?;
        let cached = cache.usage(&missing).await;
        assert_eq!(cached.err().map(|e| e.kind()), Some(crate::ErrorKind::IoFailed));

        cache.invalidate_all();
        assert_eq!(cache.usage(&missing).await?.bytes, 0);
        Ok(())
    }
}
