//! Advisory per-workspace locking
//!
//! Each workspace id maps to a marker file under the lock directory. The
//! marker is created with `create_new`, so creation is the atomic
//! create-or-fail primitive: whoever creates the file owns the lock.
//!
//! # Design Principles
//!
//! - **Single host**: markers coordinate processes on one machine only
//! - **Stale reclamation**: a marker older than `stale_after` is presumed
//!   abandoned; reclamation happens under an `fs2` exclusive lock on a
//!   sibling guard file so two reclaimers can never both win
//! - **Drop-safe**: the guard deletes its marker on drop, on every exit path
//! - **Owner checked**: release only deletes a marker still carrying our token
//!
//! Guard files are never deleted (deleting them would reopen the race they
//! close).

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{config::LockConfig, domain::file_stem_for_id, Error, Result};

const GUARD_LOCK_ATTEMPTS: usize = 64;

/// Contents of a lock marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Unique token identifying the holder
    pub holder: String,
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn fresh() -> Self {
        Self {
            holder: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            acquired_at: Utc::now(),
        }
    }

    /// Age of the record; records stamped in the future count as brand new.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    fn describe_holder(&self) -> String {
        if self.host.is_empty() {
            format!("pid {}", self.pid)
        } else {
            format!("pid {} on {}", self.pid, self.host)
        }
    }

    fn same_lock(&self, other: &Self) -> bool {
        self.holder == other.holder && self.acquired_at == other.acquired_at
    }
}

/// Locks currently held through this manager: id → holder token.
type HeldTable = Arc<Mutex<HashMap<String, String>>>;

/// Acquires and releases per-workspace advisory locks.
#[derive(Debug, Clone)]
pub struct LockManager {
    lock_dir: PathBuf,
    stale_after: Duration,
    poll_interval: Duration,
    held: HeldTable,
}

enum Attempt {
    Acquired(LockRecord),
    Held(LockRecord),
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>, stale_after: Duration, poll_interval: Duration) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            stale_after,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            held: Arc::default(),
        }
    }

    pub fn from_config(state_dir: &Path, config: &LockConfig) -> Self {
        Self::new(
            state_dir.join("locks"),
            config.stale_after(),
            config.poll_interval(),
        )
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    fn marker_path(&self, id: &str) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", file_stem_for_id(id)))
    }

    fn guard_path(&self, id: &str) -> PathBuf {
        self.lock_dir.join(format!("{}.lock.guard", file_stem_for_id(id)))
    }

    /// Acquire the lock for `id`, waiting up to `timeout` for a live holder.
    ///
    /// # Errors
    ///
    /// - `WorkspaceLocked` if a live holder keeps the lock past `timeout`
    /// - `OperationCancelled` if `cancel` fires while waiting
    /// - `IoFailed` on filesystem errors
    pub async fn acquire(
        &self,
        id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WorkspaceLockGuard> {
        tokio::fs::create_dir_all(&self.lock_dir)
            .await
            .map_err(|e| Error::io_error(format!("Failed to create lock directory: {e}")))?;

        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!("lock {id}")));
            }

            let marker = self.marker_path(id);
            let guard = self.guard_path(id);
            let stale_after = self.stale_after;
            let attempt = tokio::task::spawn_blocking(move || {
                try_acquire_blocking(&marker, &guard, stale_after)
            })
            .await
            .map_err(|e| Error::internal(format!("Lock task failed: {e}")))??;

            let current = match attempt {
                Attempt::Acquired(record) => {
                    tracing::debug!(id, holder = %record.holder, "Acquired workspace lock");
                    self.held_table().insert(id.to_string(), record.holder.clone());
                    return Ok(WorkspaceLockGuard {
                        id: id.to_string(),
                        marker: self.marker_path(id),
                        guard: self.guard_path(id),
                        token: record.holder,
                        held: Arc::clone(&self.held),
                        released: false,
                    });
                }
                Attempt::Held(record) => record,
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(id, holder = %current.holder, "Lock wait timed out");
                return Err(Error::WorkspaceLocked {
                    id: id.to_string(),
                    holder: current.describe_holder(),
                    acquired_at: current.acquired_at.to_rfc3339(),
                });
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::cancelled(format!("lock {id}"))),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Whether a live (non-stale) lock exists for `id`.
    pub async fn is_locked(&self, id: &str) -> bool {
        if self.held_table().contains_key(id) {
            return true;
        }
        self.holder(id)
            .await
            .ok()
            .flatten()
            .is_some_and(|record| record.age() <= self.stale_after)
    }

    /// Current holder record for `id`, stale or not.
    ///
    /// # Errors
    ///
    /// Returns error if the marker exists but cannot be read
    pub async fn holder(&self, id: &str) -> Result<Option<LockRecord>> {
        let marker = self.marker_path(id);
        tokio::task::spawn_blocking(move || read_record(&marker))
            .await
            .map_err(|e| Error::internal(format!("Lock task failed: {e}")))?
    }

    fn held_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lock guard; releases the workspace lock when dropped.
#[derive(Debug)]
pub struct WorkspaceLockGuard {
    id: String,
    marker: PathBuf,
    guard: PathBuf,
    token: String,
    held: HeldTable,
    released: bool,
}

impl WorkspaceLockGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release explicitly, surfacing any error.
    ///
    /// # Errors
    ///
    /// Returns error if the marker cannot be removed
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            if held.get(&self.id) == Some(&self.token) {
                held.remove(&self.id);
            }
        }

        let guard_file = open_guard(&self.guard)?;
        if !try_lock_briefly(&guard_file) {
            // A reclaimer only takes stale markers; ours is left to age out.
            tracing::warn!(id = %self.id, "Lock guard busy; leaving marker for stale reclamation");
            return Ok(());
        }

        let result = match read_record(&self.marker) {
            Ok(Some(record)) if record.holder == self.token => remove_if_exists(&self.marker),
            Ok(Some(record)) => {
                tracing::warn!(
                    id = %self.id,
                    holder = %record.holder,
                    "Lock was reclaimed by another holder; leaving it in place"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        let _ = guard_file.unlock();
        tracing::debug!(id = %self.id, "Released workspace lock");
        result
    }
}

impl Drop for WorkspaceLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!(id = %self.id, "Failed to release workspace lock: {e}");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BLOCKING FILE OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════

fn try_acquire_blocking(marker: &Path, guard: &Path, stale_after: Duration) -> Result<Attempt> {
    let record = LockRecord::fresh();
    if create_marker(marker, &record)? {
        return Ok(Attempt::Acquired(record));
    }

    let Some(existing) = read_record(marker)? else {
        // Holder released between our create and read; try once more.
        return if create_marker(marker, &record)? {
            Ok(Attempt::Acquired(record))
        } else {
            Ok(Attempt::Held(read_record(marker)?.unwrap_or(record)))
        };
    };

    if existing.age() <= stale_after {
        return Ok(Attempt::Held(existing));
    }

    let guard_file = open_guard(guard)?;
    if guard_file.try_lock_exclusive().is_err() {
        // Someone else is reclaiming or releasing right now.
        return Ok(Attempt::Held(existing));
    }

    let outcome = reclaim_locked(marker, &existing, stale_after, record);
    let _ = guard_file.unlock();
    outcome
}

/// Take the guard lock without parking the thread. Guard sections are a
/// read and a remove, so a handful of yields is enough in practice.
fn try_lock_briefly(file: &File) -> bool {
    for _ in 0..GUARD_LOCK_ATTEMPTS {
        if file.try_lock_exclusive().is_ok() {
            return true;
        }
        std::thread::yield_now();
    }
    false
}

/// Reclaim `observed` if it is still the marker on disk and still stale.
/// Caller holds the guard lock.
fn reclaim_locked(
    marker: &Path,
    observed: &LockRecord,
    stale_after: Duration,
    record: LockRecord,
) -> Result<Attempt> {
    match read_record(marker)? {
        Some(current) if current.same_lock(observed) && current.age() > stale_after => {
            tracing::info!(
                holder = %current.holder,
                age_secs = current.age().as_secs(),
                "Reclaiming stale workspace lock"
            );
            remove_if_exists(marker)?;
        }
        Some(current) => return Ok(Attempt::Held(current)),
        None => {}
    }

    if create_marker(marker, &record)? {
        Ok(Attempt::Acquired(record))
    } else {
        Ok(Attempt::Held(read_record(marker)?.unwrap_or(record)))
    }
}

/// Atomically create the marker. `Ok(false)` means it already exists.
fn create_marker(marker: &Path, record: &LockRecord) -> Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(marker) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => {
            return Err(Error::io_error(format!(
                "Failed to create lock file '{}': {e}",
                marker.display()
            )))
        }
    };

    let body = serde_json::to_vec(record)?;
    file.write_all(&body)
        .and_then(|()| file.sync_all())
        .map_err(|e| Error::io_error(format!("Failed to write lock file: {e}")))?;
    Ok(true)
}

/// Read a marker. A marker that exists but cannot be parsed (for instance
/// while its creator is still writing it) is dated by its mtime.
fn read_record(marker: &Path) -> Result<Option<LockRecord>> {
    let content = match fs::read(marker) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::io_error(format!(
                "Failed to read lock file '{}': {e}",
                marker.display()
            )))
        }
    };

    if let Ok(record) = serde_json::from_slice::<LockRecord>(&content) {
        return Ok(Some(record));
    }

    let modified = match fs::metadata(marker).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(_) => SystemTime::now(),
    };
    Ok(Some(LockRecord {
        holder: "unknown".to_string(),
        pid: 0,
        host: String::new(),
        acquired_at: DateTime::<Utc>::from(modified),
    }))
}

fn open_guard(guard: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(guard)
        .map_err(|e| Error::io_error(format!("Failed to open lock guard '{}': {e}", guard.display())))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_error(format!(
            "Failed to remove lock file '{}': {e}",
            path.display()
        ))),
    }
}
