//! In-memory fragment store
//!
//! Entries are indexed three ways: by cache id, by each data id they depend
//! on, and by template. All three tables live under one lock so an
//! invalidation never leaves an index pointing at a removed entry.

use crate::fragment_info::FragmentInfo;
use crate::response::ContentSegment;
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Where a stored fragment was pushed outside the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPlacement {
    pub group: String,
    pub uri: String,
}

/// A committed fragment as held by the store
#[derive(Debug, Clone)]
pub struct CachedFragment {
    pub info: FragmentInfo,
    pub segments: Vec<ContentSegment>,
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    /// Cookies replayed on every hit (empty unless the entry stores cookies)
    pub cookies: Vec<(String, String)>,
    /// Request attributes replayed on every hit (empty unless the entry stores attributes)
    pub attributes: Vec<(String, Value)>,
    pub external: Option<ExternalPlacement>,
}

impl CachedFragment {
    pub fn id(&self) -> &str {
        self.info.id().unwrap_or_default()
    }

    pub fn data_ids(&self) -> &[String] {
        self.info.entry_info().data_ids()
    }

    pub fn templates(&self) -> &[String] {
        self.info.entry_info().templates()
    }

    /// Whether the entry holds only literal output
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, ContentSegment::Static(_)))
    }
}

struct StoreEntry {
    fragment: Arc<CachedFragment>,
    last_accessed: SystemTime,
    access_count: u64,
}

impl StoreEntry {
    fn is_expired_at(&self, now: SystemTime) -> bool {
        let entry = self.fragment.info.entry_info();
        if entry.is_expired_at(now) {
            return true;
        }
        match entry.inactivity() {
            Some(idle) => now
                .duration_since(self.last_accessed)
                .map(|elapsed| elapsed >= idle)
                .unwrap_or(false),
            None => false,
        }
    }

    fn eviction_rank(&self) -> (i32, SystemTime) {
        (self.fragment.info.entry_info().priority(), self.last_accessed)
    }
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, StoreEntry>,
    dependencies: HashMap<String, HashSet<String>>,
    templates: HashMap<String, HashSet<String>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl StoreInner {
    fn remove(&mut self, id: &str) -> Option<Arc<CachedFragment>> {
        let entry = self.entries.remove(id)?;
        for data_id in entry.fragment.data_ids() {
            unlink(&mut self.dependencies, data_id, id);
        }
        for template in entry.fragment.templates() {
            unlink(&mut self.templates, template, id);
        }
        let mut fragment = Arc::unwrap_or_clone(entry.fragment);
        fragment.info.mark_invalidated();
        Some(Arc::new(fragment))
    }

    fn remove_all(&mut self, ids: Vec<String>) -> Vec<Arc<CachedFragment>> {
        ids.into_iter().filter_map(|id| self.remove(&id)).collect()
    }
}

fn unlink(index: &mut HashMap<String, HashSet<String>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub dependency_ids: usize,
    pub templates: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Fragment cache storage
pub struct FragmentStore {
    inner: RwLock<StoreInner>,
    max_entries: usize,
    default_priority: i32,
}

impl FragmentStore {
    /// Create a store holding at most `max_entries` fragments
    ///
    /// `default_priority` applies to entries whose metadata chose none.
    pub fn new(max_entries: usize, default_priority: i32) -> Self {
        info!(
            "Initializing fragment store: max_entries={}, default_priority={}",
            max_entries, default_priority
        );
        FragmentStore {
            inner: RwLock::new(StoreInner::default()),
            max_entries: max_entries.max(1),
            default_priority,
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn default_priority(&self) -> i32 {
        self.default_priority
    }

    /// Look up a live entry, dropping it if it has expired
    pub fn get(&self, id: &str) -> Option<Arc<CachedFragment>> {
        let now = SystemTime::now();
        let mut inner = self.write();

        let Some(expired) = inner.entries.get(id).map(|e| e.is_expired_at(now)) else {
            inner.misses += 1;
            return None;
        };

        if expired {
            debug!("Fragment expired on lookup: {}", id);
            inner.remove(id);
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        let entry = inner.entries.get_mut(id)?;
        entry.last_accessed = now;
        entry.access_count += 1;
        Some(entry.fragment.clone())
    }

    /// Check for a live entry without touching access statistics
    pub fn contains(&self, id: &str) -> bool {
        let now = SystemTime::now();
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
            .map(|e| !e.is_expired_at(now))
            .unwrap_or(false)
    }

    /// Store a committed fragment, replacing any entry with the same id
    ///
    /// Returns the entries evicted to make room.
    pub fn put(&self, mut fragment: CachedFragment) -> Vec<Arc<CachedFragment>> {
        fragment.info.apply_default_priority(self.default_priority);
        let id = fragment.id().to_string();
        let now = SystemTime::now();
        let mut inner = self.write();

        inner.remove(&id);

        let mut evicted = Vec::new();
        while inner.entries.len() >= self.max_entries {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.eviction_rank())
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else { break };
            if let Some(removed) = inner.remove(&victim) {
                debug!("Evicted fragment {}", victim);
                inner.evictions += 1;
                evicted.push(removed);
            }
        }

        let fragment = Arc::new(fragment);
        for data_id in fragment.data_ids() {
            inner
                .dependencies
                .entry(data_id.clone())
                .or_default()
                .insert(id.clone());
        }
        for template in fragment.templates() {
            inner
                .templates
                .entry(template.clone())
                .or_default()
                .insert(id.clone());
        }
        inner.entries.insert(
            id.clone(),
            StoreEntry {
                fragment,
                last_accessed: now,
                access_count: 0,
            },
        );
        debug!("Stored fragment {}", id);
        evicted
    }

    pub fn invalidate_by_id(&self, id: &str) -> Option<Arc<CachedFragment>> {
        let removed = self.write().remove(id);
        if removed.is_some() {
            debug!("Invalidated fragment {}", id);
        }
        removed
    }

    /// Remove every entry depending on `data_id`
    pub fn invalidate_by_dependency(&self, data_id: &str) -> Vec<Arc<CachedFragment>> {
        let mut inner = self.write();
        let ids: Vec<String> = inner
            .dependencies
            .get(data_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let removed = inner.remove_all(ids);
        debug!("Invalidated {} fragments for data id {}", removed.len(), data_id);
        removed
    }

    pub fn invalidate_by_template(&self, template: &str) -> Vec<Arc<CachedFragment>> {
        let mut inner = self.write();
        let ids: Vec<String> = inner
            .templates
            .get(template)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let removed = inner.remove_all(ids);
        debug!("Invalidated {} fragments for template {}", removed.len(), template);
        removed
    }

    pub fn clear(&self) -> Vec<Arc<CachedFragment>> {
        let mut inner = self.write();
        let removed = inner.entries.drain().map(|(_, e)| e.fragment).collect();
        inner.dependencies.clear();
        inner.templates.clear();
        removed
    }

    /// Drop every expired or idle entry
    pub fn purge_expired(&self) -> Vec<Arc<CachedFragment>> {
        let now = SystemTime::now();
        let mut inner = self.write();
        let ids: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();
        let removed = inner.remove_all(ids);
        inner.expirations += removed.len() as u64;
        if !removed.is_empty() {
            debug!("Purged {} expired fragments", removed.len());
        }
        removed
    }

    /// Cache ids of the entries depending on `data_id`
    pub fn ids_for_dependency(&self, data_id: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = inner
            .dependencies
            .get(data_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn ids_for_template(&self, template: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = inner
            .templates
            .get(template)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Number of times the entry was served since it was stored
    pub fn access_count(&self, id: &str) -> Option<u64> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
            .map(|e| e.access_count)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        StoreStats {
            entries: inner.entries.len(),
            dependency_ids: inner.dependencies.len(),
            templates: inner.templates.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }

    /// Purge expired entries every `interval` until the store is dropped
    pub fn spawn_expiry_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<FragmentStore> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Fragment store dropped; expiry task exiting");
                    break;
                };
                store.purge_expired();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment_info::FragmentState;
    use bytes::Bytes;

    fn fragment(id: &str, data_ids: &[&str], template: &str) -> CachedFragment {
        let mut info = FragmentInfo::new(id);
        for data_id in data_ids {
            info.add_data_id(*data_id).unwrap();
        }
        info.add_template(template).unwrap();
        info.commit().unwrap();
        CachedFragment {
            info,
            segments: vec![ContentSegment::Static(Bytes::from(id.to_string()))],
            status: StatusCode::OK,
            headers: Vec::new(),
            cookies: Vec::new(),
            attributes: Vec::new(),
            external: None,
        }
    }

    #[test]
    fn test_put_and_get() {
        let store = FragmentStore::new(10, 1);
        store.put(fragment("a", &[], "/a"));

        let hit = store.get("a").unwrap();
        assert_eq!(hit.id(), "a");
        assert_eq!(hit.info.entry_info().priority(), 1);
        assert!(store.get("b").is_none());
        assert_eq!(store.access_count("a"), Some(1));

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_dependency_fan_out() {
        let store = FragmentStore::new(10, 1);
        store.put(fragment("e1", &["city:paris"], "/weather"));
        store.put(fragment("e2", &["city:paris", "weather:today"], "/weather"));
        store.put(fragment("e3", &["city:oslo"], "/weather"));

        assert_eq!(store.ids_for_dependency("city:paris"), ["e1", "e2"]);

        let removed = store.invalidate_by_dependency("city:paris");
        assert_eq!(removed.len(), 2);
        assert!(!store.contains("e1"));
        assert!(!store.contains("e2"));
        assert!(store.contains("e3"));
        assert!(store.ids_for_dependency("weather:today").is_empty());
        assert_eq!(store.stats().dependency_ids, 1);
    }

    #[test]
    fn test_removed_fragments_are_invalidated() {
        let store = FragmentStore::new(2, 1);
        store.put(fragment("a", &["city:paris"], "/a"));
        store.put(fragment("b", &[], "/b"));
        let held = store.get("b").unwrap();
        assert_eq!(held.info.state(), FragmentState::Committed);

        let removed = store.invalidate_by_dependency("city:paris");
        assert_eq!(removed[0].info.state(), FragmentState::Invalidated);

        store.put(fragment("c", &[], "/c"));
        let evicted = store.put(fragment("d", &[], "/d"));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].info.state(), FragmentState::Invalidated);

        let cleared = store.clear();
        assert!(cleared
            .iter()
            .all(|f| f.info.state() == FragmentState::Invalidated));
        // Readers holding an entry from before keep their committed copy
        assert_eq!(held.info.state(), FragmentState::Committed);
    }

    #[test]
    fn test_replace_reindexes() {
        let store = FragmentStore::new(10, 1);
        store.put(fragment("a", &["old"], "/a"));
        store.put(fragment("a", &["new"], "/a"));

        assert!(store.ids_for_dependency("old").is_empty());
        assert_eq!(store.ids_for_dependency("new"), ["a"]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalidate_by_template() {
        let store = FragmentStore::new(10, 1);
        store.put(fragment("a", &[], "/news"));
        store.put(fragment("b", &[], "/news"));
        store.put(fragment("c", &[], "/sports"));

        assert_eq!(store.invalidate_by_template("/news").len(), 2);
        assert_eq!(store.ids_for_template("/sports"), ["c"]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_evicts_lowest_priority_first() {
        let store = FragmentStore::new(2, 1);
        let mut important = fragment("important", &[], "/a");
        important.info = {
            let mut info = FragmentInfo::new("important");
            info.set_priority(9).unwrap();
            info.commit().unwrap();
            info
        };
        store.put(important);
        store.put(fragment("cheap", &["d"], "/a"));

        let evicted = store.put(fragment("new", &[], "/a"));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id(), "cheap");
        assert!(store.contains("important"));
        assert!(store.ids_for_dependency("d").is_empty());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_expired_entries_are_not_served() {
        let store = FragmentStore::new(10, 1);
        let mut stale = fragment("stale", &["x"], "/a");
        stale.info = {
            let mut info = FragmentInfo::new("stale");
            info.add_data_id("x").unwrap();
            info.set_expiration_time(SystemTime::now() - Duration::from_secs(1))
                .unwrap();
            info.commit().unwrap();
            info
        };
        store.put(stale);
        store.put(fragment("fresh", &[], "/a"));

        assert!(!store.contains("stale"));
        let purged = store.purge_expired();
        assert_eq!(purged.len(), 1);
        assert!(store.ids_for_dependency("x").is_empty());
        assert!(store.get("fresh").is_some());
        assert_eq!(store.stats().expirations, 1);
    }

    #[test]
    fn test_clear() {
        let store = FragmentStore::new(10, 1);
        store.put(fragment("a", &["d"], "/a"));
        store.put(fragment("b", &["d"], "/b"));
        assert_eq!(store.clear().len(), 2);
        assert!(store.is_empty());
        assert_eq!(store.stats().dependency_ids, 0);
        assert_eq!(store.stats().templates, 0);
    }

    #[tokio::test]
    async fn test_expiry_task_purges_in_background() {
        let store = Arc::new(FragmentStore::new(10, 1));
        let mut info = FragmentInfo::new("soon");
        info.set_expiration_time(SystemTime::now() + Duration::from_millis(20))
            .unwrap();
        info.commit().unwrap();
        let mut soon = fragment("soon", &[], "/a");
        soon.info = info;
        store.put(soon);

        let handle = store.spawn_expiry_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.stats().entries, 0);
        handle.abort();
    }
}
