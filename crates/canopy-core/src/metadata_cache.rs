//! TTL read cache in front of the workspace store
//!
//! The store is the source of truth; this cache only saves lookups. Writers
//! call [`WorkspaceCache::invalidate`] before a write is considered done, and
//! a per-id generation counter keeps a lookup that raced an invalidation from
//! putting the old snapshot back. Bulk fills from a listing use a
//! [`FillTicket`] taken before the listing started, and are dropped if any
//! invalidation happened in between.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    domain::Workspace,
    ports::{Location, Lookup, WorkspaceStore},
    Result,
};

#[derive(Debug, Clone)]
struct CacheEntry {
    workspace: Workspace,
    location: Location,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Bumped for an id on every invalidation of that id
    generations: HashMap<String, u64>,
    /// Bumped on `invalidate_all`
    epoch: u64,
    /// Bumped on every invalidation of any id
    invalidations: u64,
}

impl CacheState {
    fn stamp(&self, id: &str) -> (u64, u64) {
        (self.epoch, self.generations.get(id).copied().unwrap_or(0))
    }
}

/// Snapshot of the cache's invalidation count, taken before a bulk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket {
    epoch: u64,
    invalidations: u64,
}

/// Id → workspace snapshot cache.
#[derive(Clone)]
pub struct WorkspaceCache {
    store: Arc<dyn WorkspaceStore>,
    ttl: Duration,
    state: Arc<Mutex<CacheState>>,
}

impl std::fmt::Debug for WorkspaceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.lock_state().entries.len())
            .finish_non_exhaustive()
    }
}

impl WorkspaceCache {
    pub fn new(store: Arc<dyn WorkspaceStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            state: Arc::default(),
        }
    }

    /// Look up an active workspace by id.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails
    pub async fn get(&self, id: &str) -> Result<Option<(Workspace, Location)>> {
        let stamp = {
            let state = self.lock_state();
            if let Some(entry) = state.entries.get(id) {
                if entry.inserted_at.elapsed() < self.ttl {
                    tracing::debug!(id, "Metadata cache hit");
                    return Ok(Some((entry.workspace.clone(), entry.location.clone())));
                }
            }
            state.stamp(id)
        };

        tracing::debug!(id, "Metadata cache miss");
        let found = match self.store.load_by_id(id).await? {
            Lookup::Found(workspace, location) => Some((workspace, location)),
            Lookup::Missing => None,
            Lookup::Unaddressable => self
                .store
                .list()
                .await?
                .into_iter()
                .find(|(workspace, _)| workspace.id == id),
        };

        if let Some((workspace, location)) = &found {
            let mut state = self.lock_state();
            if state.stamp(id) == stamp {
                state.entries.insert(
                    id.to_string(),
                    CacheEntry {
                        workspace: workspace.clone(),
                        location: location.clone(),
                        inserted_at: Instant::now(),
                    },
                );
            } else {
                tracing::debug!(id, "Skipping cache fill raced by invalidation");
            }
        }

        Ok(found)
    }

    /// Ticket for a later [`WorkspaceCache::fill`]; take it before reading
    /// the store.
    pub fn ticket(&self) -> FillTicket {
        let state = self.lock_state();
        FillTicket {
            epoch: state.epoch,
            invalidations: state.invalidations,
        }
    }

    /// Store a snapshot read after `ticket` was taken. Returns `false`, and
    /// stores nothing, if any invalidation happened since.
    pub fn fill(&self, ticket: FillTicket, id: &str, workspace: Workspace, location: Location) -> bool {
        let mut state = self.lock_state();
        if state.epoch != ticket.epoch || state.invalidations != ticket.invalidations {
            tracing::debug!(id, "Skipping cache fill raced by invalidation");
            return false;
        }
        state.entries.insert(
            id.to_string(),
            CacheEntry {
                workspace,
                location,
                inserted_at: Instant::now(),
            },
        );
        true
    }

    pub fn invalidate(&self, id: &str) {
        let mut state = self.lock_state();
        state.entries.remove(id);
        *state.generations.entry(id.to_string()).or_default() += 1;
        state.invalidations += 1;
    }

    pub fn invalidate_all(&self) {
        let mut state = self.lock_state();
        state.entries.clear();
        state.generations.clear();
        state.epoch += 1;
        state.invalidations += 1;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::Repo, testing::MemoryStore};

    fn workspace(id: &str) -> Workspace {
        Workspace::new(id, "main", vec![Repo::new("api", "git@example.com:org/api.git")])
    }

    #[tokio::test]
    async fn test_hit_skips_store() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.create(&workspace("PROJ-1")).await?;
        let cache = WorkspaceCache::new(store.clone(), Duration::from_secs(30));

        assert!(cache.get("PROJ-1").await?.is_some());
        assert!(cache.get("PROJ-1").await?.is_some());
        assert_eq!(store.lookup_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalidate_forces_one_lookup() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let ws = workspace("PROJ-1");
        let location = store.create(&ws).await?;
        let cache = WorkspaceCache::new(store.clone(), Duration::from_secs(30));

        assert!(cache.fill(cache.ticket(), "PROJ-1", ws, location));
        cache.invalidate("PROJ-1");
        assert!(cache.get("PROJ-1").await?.is_some());
        assert_eq!(store.lookup_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_is_not_cached() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let cache = WorkspaceCache::new(store.clone(), Duration::from_secs(30));

        assert!(cache.get("nope").await?.is_none());
        store.create(&workspace("nope")).await?;
        assert!(cache.get("nope").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_unaddressable_falls_back_to_list() -> Result<()> {
        let store = Arc::new(MemoryStore::new().with_unaddressable("feat #12"));
        store.create(&workspace("feat #12")).await?;
        let cache = WorkspaceCache::new(store.clone(), Duration::from_secs(30));

        let found = cache.get("feat #12").await?;
        assert_eq!(found.map(|(ws, _)| ws.id), Some("feat #12".to_string()));
        assert_eq!(store.list_count(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reloads() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.create(&workspace("PROJ-1")).await?;
        let cache = WorkspaceCache::new(store.clone(), Duration::from_secs(30));

        cache.get("PROJ-1").await?;
        tokio::time::advance(Duration::from_secs(31)).await;
        cache.get("PROJ-1").await?;
        assert_eq!(store.lookup_count(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_during_lookup_wins() -> Result<()> {
        let store = Arc::new(MemoryStore::new().with_lookup_delay(Duration::from_millis(50)));
        store.create(&workspace("PROJ-1")).await?;
        let cache = WorkspaceCache::new(store.clone(), Duration::from_secs(30));

        let reader = cache.clone();
        let pending = tokio::spawn(async move { reader.get("PROJ-1").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A write lands while the read is still in flight.
        let mut renamed = workspace("PROJ-1");
        renamed.branch = "feature/new".to_string();
        store.save(&renamed).await?;
        cache.invalidate("PROJ-1");

        let stale = pending.await.map_err(|e| crate::Error::internal(e.to_string()))??;
        assert_eq!(stale.map(|(ws, _)| ws.branch), Some("main".to_string()));

        // The raced read must not have been cached.
        let fresh = cache.get("PROJ-1").await?;
        assert_eq!(fresh.map(|(ws, _)| ws.branch), Some("feature/new".to_string()));
        assert_eq!(store.lookup_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_fill_after_invalidation_is_dropped() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let ws = workspace("PROJ-1");
        let location = store.create(&ws).await?;
        let cache = WorkspaceCache::new(store.clone(), Duration::from_secs(30));

        let ticket = cache.ticket();
        cache.invalidate("PROJ-2");
        assert!(!cache.fill(ticket, "PROJ-1", ws, location));

        assert!(cache.get("PROJ-1").await?.is_some());
        assert_eq!(store.lookup_count(), 1);
        Ok(())
    }
}
