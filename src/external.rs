//! External cache integration
//!
//! Fragments whose metadata names an external cache group are pushed, after
//! they are stored locally, to the adapters registered for that group
//! (typically a reverse proxy or edge cache). Invalidations of stored entries
//! are forwarded to the same groups.
//!
//! Adapter calls never run on the request path: the coordinator queues them on
//! an [`ExternalCacheDispatcher`], whose background task drives the adapters
//! in submission order.

use crate::error::{FragmentError, Result};
use crate::metrics::FragmentMetrics;
use crate::request::CacheRequest;
use crate::response::CacheResponse;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Header carrying the data ids a pushed page depends on
pub const DEPENDENCY_HEADER: &str = "X-Cache-Dependency";

/// Ordered response headers; a name may appear more than once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderTable {
    entries: Vec<(String, String)>,
}

impl HeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// All values of `name`, in insertion order (case-insensitive)
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderTable {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        HeaderTable {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

/// A rendered page handed to an external cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCacheEntry {
    host: String,
    uri: String,
    content: Bytes,
    header_table: HeaderTable,
}

impl ExternalCacheEntry {
    pub fn new(
        host: impl Into<String>,
        uri: impl Into<String>,
        content: Bytes,
        header_table: HeaderTable,
    ) -> Self {
        ExternalCacheEntry {
            host: host.into(),
            uri: uri.into(),
            content,
            header_table,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn header_table(&self) -> &HeaderTable {
        &self.header_table
    }

    /// Data ids recorded in the dependency header
    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.header_table.get_all(DEPENDENCY_HEADER)
    }
}

/// Transport to one external cache
///
/// Adapters move pages and invalidations; deciding what is eligible for an
/// external push is the coordinator's job. The hooks are invoked on every
/// request for a resource bound to the adapter's group, hits included.
#[async_trait]
pub trait ExternalCacheAdapter: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Store pages in the external cache
    async fn write_pages(&self, entries: Vec<ExternalCacheEntry>) -> Result<()>;

    /// Remove pages by URI
    async fn invalidate_pages(&self, uris: Vec<String>) -> Result<()>;

    /// Remove every page depending on one of these data ids
    async fn invalidate_ids(&self, ids: Vec<String>) -> Result<()>;

    /// Remove everything
    async fn clear(&self) -> Result<()>;

    fn pre_invoke(&self, _request: &CacheRequest) {}

    /// Runs after a request completes; not called when rendering fails
    fn post_invoke(&self, _request: &CacheRequest, _response: &CacheResponse) {}
}

/// External cache kept in process memory
///
/// Stands in for an edge cache in tests and single-node deployments. Pages
/// are keyed by URI; `invalidate_ids` matches the dependency header of each
/// page and is serialized against concurrent invalidations.
#[derive(Debug)]
pub struct InMemoryExternalCache {
    name: String,
    pages: RwLock<HashMap<String, ExternalCacheEntry>>,
    invalidated_ids: RwLock<Vec<String>>,
    id_lock: Mutex<()>,
}

impl InMemoryExternalCache {
    pub fn new(name: impl Into<String>) -> Self {
        InMemoryExternalCache {
            name: name.into(),
            pages: RwLock::new(HashMap::new()),
            invalidated_ids: RwLock::new(Vec::new()),
            id_lock: Mutex::new(()),
        }
    }

    pub fn page(&self, uri: &str) -> Option<ExternalCacheEntry> {
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.pages.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every data id invalidated so far, in arrival order
    pub fn invalidated_ids(&self) -> Vec<String> {
        self.invalidated_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ExternalCacheAdapter for InMemoryExternalCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_pages(&self, entries: Vec<ExternalCacheEntry>) -> Result<()> {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        for entry in entries {
            debug!("{}: stored external page {}", self.name, entry.uri());
            pages.insert(entry.uri().to_string(), entry);
        }
        Ok(())
    }

    async fn invalidate_pages(&self, uris: Vec<String>) -> Result<()> {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        for uri in uris {
            if pages.remove(&uri).is_some() {
                debug!("{}: invalidated external page {}", self.name, uri);
            }
        }
        Ok(())
    }

    async fn invalidate_ids(&self, ids: Vec<String>) -> Result<()> {
        let _guard = self.id_lock.lock().await;
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        let before = pages.len();
        pages.retain(|_, entry| !entry.dependency_ids().any(|dep| ids.iter().any(|id| id == dep)));
        debug!(
            "{}: invalidated {} external pages for {} ids",
            self.name,
            before - pages.len(),
            ids.len()
        );
        drop(pages);
        self.invalidated_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(ids);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.pages.write().unwrap_or_else(PoisonError::into_inner).clear();
        info!("{}: cleared external cache", self.name);
        Ok(())
    }
}

/// External cache groups by name
#[derive(Clone, Default)]
pub struct ExternalCacheGroups {
    groups: HashMap<String, Arc<dyn ExternalCacheAdapter>>,
}

impl std::fmt::Debug for ExternalCacheGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalCacheGroups")
            .field("groups", &self.names())
            .finish()
    }
}

impl ExternalCacheGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: impl Into<String>, adapter: Arc<dyn ExternalCacheAdapter>) {
        self.groups.insert(group.into(), adapter);
    }

    pub fn get(&self, group: &str) -> Option<&Arc<dyn ExternalCacheAdapter>> {
        self.groups.get(group)
    }

    pub fn contains(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.groups.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Message for the background external cache task
enum DispatchMessage {
    WritePages {
        group: String,
        entries: Vec<ExternalCacheEntry>,
    },
    InvalidatePages {
        group: String,
        uris: Vec<String>,
    },
    /// Data-id and clear requests go to every group
    InvalidateIds(Vec<String>),
    Clear,
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Queue in front of the external cache adapters
///
/// Messages are handled one at a time, in the order they were submitted.
/// Adapter failures are logged and counted, never reported to the caller.
pub struct ExternalCacheDispatcher {
    groups: ExternalCacheGroups,
    tx: mpsc::UnboundedSender<DispatchMessage>,
}

impl ExternalCacheDispatcher {
    /// Start the background task on the current tokio runtime
    pub fn spawn(groups: ExternalCacheGroups, metrics: Arc<FragmentMetrics>) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            FragmentError::ConfigError(format!(
                "external caches need a tokio runtime to run on: {}",
                e
            ))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task_groups = groups.clone();
        handle.spawn(async move {
            Self::dispatch_task(rx, task_groups, metrics).await;
        });
        info!("External cache dispatcher started for {:?}", groups.names());

        Ok(ExternalCacheDispatcher { groups, tx })
    }

    pub fn groups(&self) -> &ExternalCacheGroups {
        &self.groups
    }

    fn send(&self, msg: DispatchMessage) {
        if self.tx.send(msg).is_err() {
            warn!("External cache dispatcher is gone; dropping request");
        }
    }

    pub fn write_pages(&self, group: impl Into<String>, entries: Vec<ExternalCacheEntry>) {
        self.send(DispatchMessage::WritePages {
            group: group.into(),
            entries,
        });
    }

    pub fn invalidate_pages(&self, group: impl Into<String>, uris: Vec<String>) {
        self.send(DispatchMessage::InvalidatePages {
            group: group.into(),
            uris,
        });
    }

    /// Forward data-id invalidations to every group
    pub fn invalidate_ids(&self, ids: Vec<String>) {
        self.send(DispatchMessage::InvalidateIds(ids));
    }

    /// Clear every group
    pub fn clear(&self) {
        self.send(DispatchMessage::Clear);
    }

    /// Wait until every message submitted before this call was handled
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(DispatchMessage::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn targets<'a>(
        groups: &'a ExternalCacheGroups,
        group: Option<&'a str>,
    ) -> Vec<(&'a str, &'a Arc<dyn ExternalCacheAdapter>)> {
        match group {
            Some(name) => match groups.get(name) {
                Some(adapter) => vec![(name, adapter)],
                None => {
                    warn!("Unknown external cache group '{}'", name);
                    Vec::new()
                }
            },
            None => groups
                .groups
                .iter()
                .map(|(name, adapter)| (name.as_str(), adapter))
                .collect(),
        }
    }

    async fn dispatch_task(
        mut rx: mpsc::UnboundedReceiver<DispatchMessage>,
        groups: ExternalCacheGroups,
        metrics: Arc<FragmentMetrics>,
    ) {
        debug!("External cache dispatch task started");

        while let Some(msg) = rx.recv().await {
            match msg {
                DispatchMessage::WritePages { group, entries } => {
                    let count = entries.len();
                    for (name, adapter) in Self::targets(&groups, Some(&group)) {
                        match adapter.write_pages(entries.clone()).await {
                            Ok(()) => metrics.record_external_push(count),
                            Err(e) => {
                                error!("Failed to push {} pages to '{}': {}", count, name, e);
                                metrics.record_external_failure();
                            }
                        }
                    }
                }
                DispatchMessage::InvalidatePages { group, uris } => {
                    for (name, adapter) in Self::targets(&groups, Some(&group)) {
                        match adapter.invalidate_pages(uris.clone()).await {
                            Ok(()) => metrics.record_external_invalidation(),
                            Err(e) => {
                                error!("Failed to invalidate pages in '{}': {}", name, e);
                                metrics.record_external_failure();
                            }
                        }
                    }
                }
                DispatchMessage::InvalidateIds(ids) => {
                    for (name, adapter) in Self::targets(&groups, None) {
                        match adapter.invalidate_ids(ids.clone()).await {
                            Ok(()) => metrics.record_external_invalidation(),
                            Err(e) => {
                                error!("Failed to invalidate ids in '{}': {}", name, e);
                                metrics.record_external_failure();
                            }
                        }
                    }
                }
                DispatchMessage::Clear => {
                    for (name, adapter) in Self::targets(&groups, None) {
                        match adapter.clear().await {
                            Ok(()) => metrics.record_external_invalidation(),
                            Err(e) => {
                                error!("Failed to clear '{}': {}", name, e);
                                metrics.record_external_failure();
                            }
                        }
                    }
                }
                DispatchMessage::Flush(done) => {
                    let _ = done.send(());
                }
                DispatchMessage::Shutdown => {
                    debug!("External cache dispatch task shutting down");
                    break;
                }
            }
        }
    }
}

impl Drop for ExternalCacheDispatcher {
    fn drop(&mut self) {
        let _ = self.tx.send(DispatchMessage::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn page(uri: &str, deps: &[&str]) -> ExternalCacheEntry {
        let headers: HeaderTable = deps.iter().map(|d| (DEPENDENCY_HEADER, *d)).collect();
        ExternalCacheEntry::new("example.com", uri, Bytes::from(uri.to_string()), headers)
    }

    #[test]
    fn test_header_table_keeps_order_and_duplicates() {
        let mut headers = HeaderTable::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("Content-Type", "text/html");
        headers.append("set-cookie", "b=2");

        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get_all("SET-COOKIE").collect::<Vec<_>>(), ["a=1", "b=2"]);
        assert_eq!(headers.iter().next(), Some(("Set-Cookie", "a=1")));
    }

    #[tokio::test]
    async fn test_in_memory_invalidate_ids_uses_dependency_header() {
        let cache = InMemoryExternalCache::new("edge");
        cache
            .write_pages(vec![
                page("/paris", &["city:paris"]),
                page("/oslo", &["city:oslo"]),
                page("/both", &["city:paris", "city:oslo"]),
            ])
            .await
            .unwrap();

        cache.invalidate_ids(vec!["city:paris".into()]).await.unwrap();

        assert!(cache.page("/paris").is_none());
        assert!(cache.page("/both").is_none());
        assert!(cache.page("/oslo").is_some());
        assert_eq!(cache.invalidated_ids(), ["city:paris"]);
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl ExternalCacheAdapter for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn write_pages(&self, _entries: Vec<ExternalCacheEntry>) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(FragmentError::adapter("failing", "down"))
        }
        async fn invalidate_pages(&self, _uris: Vec<String>) -> Result<()> {
            Ok(())
        }
        async fn invalidate_ids(&self, _ids: Vec<String>) -> Result<()> {
            Ok(())
        }
        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatcher_runs_messages_in_order() {
        let edge = Arc::new(InMemoryExternalCache::new("edge"));
        let mut groups = ExternalCacheGroups::new();
        groups.insert("edge", edge.clone());
        let metrics = Arc::new(FragmentMetrics::new());
        let dispatcher = ExternalCacheDispatcher::spawn(groups, metrics.clone()).unwrap();

        dispatcher.write_pages("edge", vec![page("/a", &[]), page("/b", &[])]);
        dispatcher.invalidate_pages("edge", vec!["/a".into()]);
        dispatcher.flush().await;

        assert!(edge.page("/a").is_none());
        assert!(edge.page("/b").is_some());
        let stats = metrics.get_stats();
        assert_eq!(stats.external_pushes, 2);
        assert_eq!(stats.external_invalidations, 1);

        dispatcher.clear();
        dispatcher.flush().await;
        assert!(edge.is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_counts_failures() {
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        let mut groups = ExternalCacheGroups::new();
        groups.insert("bad", failing.clone());
        let metrics = Arc::new(FragmentMetrics::new());
        let dispatcher = ExternalCacheDispatcher::spawn(groups, metrics.clone()).unwrap();

        dispatcher.write_pages("bad", vec![page("/a", &[])]);
        dispatcher.write_pages("unknown", vec![page("/b", &[])]);
        dispatcher.flush().await;

        assert_eq!(failing.0.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.get_stats().external_failures, 1);
    }

    #[test]
    fn test_dispatcher_requires_runtime() {
        let result = ExternalCacheDispatcher::spawn(
            ExternalCacheGroups::new(),
            Arc::new(FragmentMetrics::new()),
        );
        assert!(matches!(result, Err(FragmentError::ConfigError(_))));
    }
}
