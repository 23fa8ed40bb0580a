//! Request execution through the fragment cache
//!
//! [`CacheCoordinator::execute`] is the single entry point for serving a
//! resource. It looks the resource up by URI, asks its id generator for a
//! cache id, and then either replays the stored fragment or renders it,
//! runs the metadata generator, resolves nested fragments and stores the
//! result. Stored fragments bound to an external cache group are pushed
//! through the [`ExternalCacheDispatcher`].
//!
//! Rendering is a caller-supplied closure. A render that includes another
//! fragment calls [`CacheCoordinator::execute_nested`], so children go
//! through the cache on their own ids and the parent either consumes their
//! output or refers to them by id.

use crate::cache_config::CacheConfig;
use crate::config::{ExternalCacheKind, FragmentCacheConfig};
use crate::error::{FragmentError, Result};
use crate::external::{
    ExternalCacheAdapter, ExternalCacheDispatcher, ExternalCacheEntry, ExternalCacheGroups,
    HeaderTable, InMemoryExternalCache, DEPENDENCY_HEADER,
};
use crate::fragment_info::FragmentInfo;
use crate::generator::{invalidation_ids, GeneratorRegistry, IdGenerator, MetaDataGenerator};
use crate::http_adapter::HttpPurgeAdapter;
use crate::metrics::FragmentMetrics;
use crate::request::CacheRequest;
use crate::response::{CacheResponse, ContentSegment, FragmentRecord, PendingSegment};
use crate::store::{CachedFragment, ExternalPlacement, FragmentStore};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Includes deeper than this are treated as missing on replay
const MAX_INCLUDE_DEPTH: usize = 16;

/// How a request was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No resource is registered for the URI; rendered without caching
    Passthrough,
    /// Invalidation-only resource; rendered and its invalidations fired
    Invalidated,
    /// The id generator returned no id; rendered without caching
    NotCacheable,
    /// Served from the store
    Hit,
    /// Rendered and stored
    Stored,
    /// Rendered but vetoed, nothing stored
    Uncacheable,
}

struct Resource {
    config: Arc<CacheConfig>,
    id_generator: Arc<dyn IdGenerator>,
    metadata_generator: Arc<dyn MetaDataGenerator>,
}

/// Drives generators, the store and the external caches for every request
pub struct CacheCoordinator {
    resources: RwLock<HashMap<String, Arc<Resource>>>,
    registry: GeneratorRegistry,
    store: Arc<FragmentStore>,
    dispatcher: Option<ExternalCacheDispatcher>,
    metrics: Arc<FragmentMetrics>,
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    invalidation_lock: Mutex<()>,
    instance_name: String,
}

impl CacheCoordinator {
    pub fn new(store: Arc<FragmentStore>) -> Self {
        CacheCoordinator {
            resources: RwLock::new(HashMap::new()),
            registry: GeneratorRegistry::new(),
            store,
            dispatcher: None,
            metrics: Arc::new(FragmentMetrics::new()),
            build_locks: Mutex::new(HashMap::new()),
            invalidation_lock: Mutex::new(()),
            instance_name: "default".to_string(),
        }
    }

    /// Use custom generator implementations; call before registering resources
    pub fn with_registry(mut self, registry: GeneratorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<FragmentMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    /// Attach external cache groups; must be called inside a tokio runtime
    pub fn with_external_caches(mut self, groups: ExternalCacheGroups) -> Result<Self> {
        self.dispatcher = Some(ExternalCacheDispatcher::spawn(groups, self.metrics.clone())?);
        Ok(self)
    }

    /// Build a coordinator with its store, external caches and resources
    pub fn from_config(config: &FragmentCacheConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(FragmentStore::new(config.max_entries, config.default_priority));
        let mut coordinator = CacheCoordinator::new(store).with_instance_name(&config.instance_name);

        if !config.external_caches.is_empty() {
            let mut groups = ExternalCacheGroups::new();
            for external in &config.external_caches {
                let adapter: Arc<dyn ExternalCacheAdapter> = match external.kind {
                    ExternalCacheKind::Memory => Arc::new(InMemoryExternalCache::new(&external.name)),
                    ExternalCacheKind::HttpPurge => {
                        let address = external.address.as_deref().ok_or_else(|| {
                            FragmentError::ConfigError(format!(
                                "external cache '{}' needs an address",
                                external.name
                            ))
                        })?;
                        Arc::new(HttpPurgeAdapter::new(
                            &external.name,
                            address,
                            external.max_retries,
                        )?)
                    }
                };
                groups.insert(&external.name, adapter);
            }
            coordinator = coordinator.with_external_caches(groups)?;
        }

        for entry in &config.cache_entries {
            coordinator.register(entry.clone())?;
        }
        Ok(coordinator)
    }

    pub fn store(&self) -> &Arc<FragmentStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<FragmentMetrics> {
        &self.metrics
    }

    pub fn external_caches(&self) -> Option<&ExternalCacheGroups> {
        self.dispatcher.as_ref().map(|d| d.groups())
    }

    /// Make a resource cacheable
    ///
    /// Both generators are created from the registry and initialized with the
    /// policy; if either fails the resource is not registered.
    pub fn register(&self, config: CacheConfig) -> Result<()> {
        config.validate()?;
        let id_generator = self.registry.id_generator_for(&config)?;
        let metadata_generator = self.registry.metadata_generator_for(&config)?;

        if let Some(group) = &config.external_cache {
            if !self.external_caches().is_some_and(|g| g.contains(group)) {
                warn!(
                    "Resource '{}' names external cache '{}' which is not configured; entries stay local",
                    config.name, group
                );
            }
        }

        let resource = Arc::new(Resource {
            config: Arc::new(config),
            id_generator,
            metadata_generator,
        });

        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        for uri in &resource.config.uris {
            if resources.insert(uri.clone(), resource.clone()).is_some() {
                warn!("Resource '{}' replaces the previous owner of {}", resource.config.name, uri);
            }
        }
        info!(
            "Registered cacheable resource '{}' for {:?}",
            resource.config.name, resource.config.uris
        );
        Ok(())
    }

    /// Policy of the resource serving `uri`
    pub fn config_for(&self, uri: &str) -> Option<Arc<CacheConfig>> {
        self.resource_for(uri).map(|r| r.config.clone())
    }

    fn resource_for(&self, uri: &str) -> Option<Arc<Resource>> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }

    fn external_adapter(&self, config: &CacheConfig) -> Option<Arc<dyn ExternalCacheAdapter>> {
        let group = config.external_cache.as_deref()?;
        self.external_caches()?.get(group).cloned()
    }

    /// Serve one request through the cache
    pub fn execute<F>(
        &self,
        request: &mut CacheRequest,
        response: &mut CacheResponse,
        render: F,
    ) -> Result<Outcome>
    where
        F: FnOnce(&mut CacheRequest, &mut CacheResponse) -> Result<()>,
    {
        let start = Instant::now();
        let resource = self.resource_for(request.uri());
        self.metrics.record_request(resource.is_some());

        let outcome = match resource {
            None => {
                debug!("No cacheable resource for {}", request.uri());
                self.render_uncached(request, response, render)?;
                Outcome::Passthrough
            }
            Some(resource) => self.execute_resource(&resource, request, response, render)?,
        };

        self.metrics.record_request_duration(start.elapsed());
        Ok(outcome)
    }

    /// Execute a fragment included by the one currently rendering
    ///
    /// The child sees the parent's request state, writes into its own
    /// response, and is then added to the parent at the current position.
    /// Attributes the child sets stay visible to the parent.
    pub fn execute_nested<F>(
        &self,
        parent_request: &mut CacheRequest,
        parent_response: &mut CacheResponse,
        uri: &str,
        render: F,
    ) -> Result<Outcome>
    where
        F: FnOnce(&mut CacheRequest, &mut CacheResponse) -> Result<()>,
    {
        let mut request = parent_request.nested(uri);
        let mut response = parent_response.nested();
        let outcome = self.execute(&mut request, &mut response, render)?;
        parent_request.absorb_attributes(&request);
        parent_response.include(response);
        Ok(outcome)
    }

    fn execute_resource<F>(
        &self,
        resource: &Resource,
        request: &mut CacheRequest,
        response: &mut CacheResponse,
        render: F,
    ) -> Result<Outcome>
    where
        F: FnOnce(&mut CacheRequest, &mut CacheResponse) -> Result<()>,
    {
        let config = &resource.config;
        let fired = invalidation_ids(config, request);

        if config.invalidate_only {
            self.render_uncached(request, response, render)?;
            self.fire_invalidations(&fired);
            return Ok(Outcome::Invalidated);
        }

        let adapter = self.external_adapter(config);
        if let Some(adapter) = &adapter {
            adapter.pre_invoke(request);
        }

        request.set_generating_id(true);
        let id = resource.id_generator.get_id(request);
        request.set_generating_id(false);

        let outcome = match id {
            None => {
                debug!("No cache id for {}; rendering uncached", request.uri());
                self.metrics.record_not_cacheable();
                self.render_uncached(request, response, render)?;
                self.fire_invalidations(&fired);
                Outcome::NotCacheable
            }
            Some(id) => {
                if self.serve_hit(&id, request, response)? {
                    Outcome::Hit
                } else {
                    self.build(resource, id, &fired, request, response, render)?
                }
            }
        };

        if let Some(adapter) = &adapter {
            adapter.post_invoke(request, response);
        }
        Ok(outcome)
    }

    /// Render without building an entry
    ///
    /// Nested output is flattened; a vetoed child still vetoes any parent
    /// that would consume this output.
    fn render_uncached<F>(
        &self,
        request: &mut CacheRequest,
        response: &mut CacheResponse,
        render: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut CacheRequest, &mut CacheResponse) -> Result<()>,
    {
        let previous = response.take_pending_segments();
        render(request, response)?;

        let mut vetoed = request.is_uncacheable();
        let mut data_ids = Vec::new();
        let mut segments = previous;
        for segment in response.take_pending_segments() {
            let child = match segment {
                PendingSegment::Ready(s) => {
                    segments.push(PendingSegment::Ready(s));
                    continue;
                }
                PendingSegment::Child(child) => child,
            };
            vetoed |= child.vetoed || (child.do_not_consume && !child.cached);
            match child.id {
                Some(id) if child.cached => {
                    segments.push(PendingSegment::Ready(ContentSegment::Include { id }))
                }
                _ => {
                    data_ids.extend(child.data_ids);
                    segments.extend(child.segments.into_iter().map(PendingSegment::Ready));
                }
            }
        }
        response.set_pending_segments(segments);
        response.set_record(FragmentRecord {
            vetoed,
            data_ids,
            ..FragmentRecord::default()
        });
        Ok(())
    }

    /// Replay a stored fragment; false when there is nothing usable to replay
    fn serve_hit(
        &self,
        id: &str,
        request: &mut CacheRequest,
        response: &mut CacheResponse,
    ) -> Result<bool> {
        let Some(fragment) = self.store.get(id) else {
            return Ok(false);
        };

        let checkpoint = response.clone();
        let before = response.body_len();
        if !self.replay(&fragment, request, response, 0)? {
            debug!("Included fragment of {} is gone; rebuilding", id);
            *response = checkpoint;
            return Ok(false);
        }

        response.set_status(fragment.status);
        for (name, value) in &fragment.headers {
            response.add_header(name.clone(), value.clone());
        }
        response.set_record(FragmentRecord {
            id: Some(id.to_string()),
            cached: true,
            vetoed: false,
            data_ids: fragment.data_ids().to_vec(),
        });

        self.metrics.record_cache_hit();
        self.metrics
            .record_bytes_from_cache((response.body_len() - before) as u64);
        debug!("Cache hit for {}", id);
        Ok(true)
    }

    fn replay(
        &self,
        fragment: &CachedFragment,
        request: &mut CacheRequest,
        response: &mut CacheResponse,
        depth: usize,
    ) -> Result<bool> {
        for segment in &fragment.segments {
            match segment {
                ContentSegment::Static(bytes) => response.write(bytes),
                ContentSegment::Dynamic(provider) => {
                    response.add_dynamic_content_provider(provider.clone())?
                }
                ContentSegment::Include { id } => {
                    if depth >= MAX_INCLUDE_DEPTH {
                        warn!("Include chain too deep at {}", id);
                        return Ok(false);
                    }
                    let Some(child) = self.store.get(id) else {
                        return Ok(false);
                    };
                    let mut child_response = response.nested();
                    if !self.replay(&child, request, &mut child_response, depth + 1)? {
                        return Ok(false);
                    }
                    child_response.set_record(FragmentRecord {
                        id: Some(id.clone()),
                        cached: true,
                        vetoed: false,
                        data_ids: child.data_ids().to_vec(),
                    });
                    response.include(child_response);
                }
            }
        }

        for (name, value) in &fragment.cookies {
            response.add_cookie(name.clone(), value.clone());
        }
        for (name, value) in &fragment.attributes {
            request.set_attribute(name.clone(), value.clone());
        }
        Ok(true)
    }

    fn build_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.build_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    fn release_build_lock(&self, id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.build_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the table and this caller hold it: nobody is waiting.
        if Arc::strong_count(lock) <= 2 {
            locks.remove(id);
        }
    }

    /// Render and store a fragment; one build per id at a time
    fn build<F>(
        &self,
        resource: &Resource,
        id: String,
        fired: &[String],
        request: &mut CacheRequest,
        response: &mut CacheResponse,
        render: F,
    ) -> Result<Outcome>
    where
        F: FnOnce(&mut CacheRequest, &mut CacheResponse) -> Result<()>,
    {
        let lock = self.build_lock(&id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.serve_hit(&id, request, response)? {
                Ok(Outcome::Hit)
            } else {
                self.build_locked(resource, id.clone(), fired, request, response, render)
            }
        };
        self.release_build_lock(&id, &lock);
        result
    }

    /// Invalidations in `fired` run after render and before the store, so
    /// the new entry is never removed by its own request.
    fn build_locked<F>(
        &self,
        resource: &Resource,
        id: String,
        fired: &[String],
        request: &mut CacheRequest,
        response: &mut CacheResponse,
        render: F,
    ) -> Result<Outcome>
    where
        F: FnOnce(&mut CacheRequest, &mut CacheResponse) -> Result<()>,
    {
        self.metrics.record_cache_miss();
        debug!("Cache miss for {}; building", id);

        let mut info = FragmentInfo::new(id.clone());
        info.set_instance_name(self.instance_name.clone())?;
        info.add_template(request.uri())?;
        request.begin_fragment(info);
        request.get_attribute_table();

        let previous = response.take_pending_segments();
        let before = response.body_len();
        let render_start = Instant::now();
        let rendered = render(request, response)
            .and_then(|()| resource.metadata_generator.set_metadata(request, response));
        self.metrics.record_render_duration(render_start.elapsed());
        self.metrics
            .record_bytes_rendered(response.body_len().saturating_sub(before) as u64);

        let info = request.take_fragment_info();
        rendered?;
        let mut info = info.ok_or_else(|| {
            FragmentError::InternalError(format!("fragment info of {} disappeared during render", id))
        })?;

        let (segments, mut vetoed) = resolve_children(&mut info, response.take_pending_segments())?;
        vetoed |= request.is_uncacheable();
        self.fire_invalidations(fired);

        let mut pending = previous;
        pending.extend(segments.iter().cloned().map(PendingSegment::Ready));
        response.set_pending_segments(pending);

        if vetoed {
            debug!("Fragment {} is uncacheable; discarding", id);
            self.metrics.record_fragment_vetoed();
            response.set_record(FragmentRecord {
                id: Some(id),
                cached: false,
                vetoed: true,
                data_ids: Vec::new(),
            });
            return Ok(Outcome::Uncacheable);
        }

        info.commit()?;
        let data_ids = info.entry_info().data_ids().to_vec();

        let mut fragment = CachedFragment {
            cookies: if info.store_cookies() {
                response.cookies().to_vec()
            } else {
                Vec::new()
            },
            attributes: if info.store_attributes() {
                request.attributes_changed_since_snapshot()
            } else {
                Vec::new()
            },
            info,
            segments,
            status: response.status(),
            headers: response.headers().to_vec(),
            external: None,
        };

        let push = self.external_push(&fragment, request);
        if let Some((entry, placement)) = &push {
            debug!("Pushing {} to external cache '{}'", entry.uri(), placement.group);
            fragment.external = Some(placement.clone());
        }

        let evicted = self.store.put(fragment);
        self.metrics.record_fragment_stored();
        if !evicted.is_empty() {
            self.metrics.record_evicted(evicted.len());
            self.forward_removed(&evicted);
        }

        if let (Some(dispatcher), Some((entry, placement))) = (&self.dispatcher, push) {
            dispatcher.write_pages(placement.group, vec![entry]);
        }

        response.set_record(FragmentRecord {
            id: Some(id),
            cached: true,
            vetoed: false,
            data_ids,
        });
        Ok(Outcome::Stored)
    }

    /// External copy of a fragment, when it may leave the process
    ///
    /// Only complete top-level pages with an explicitly set, known group and
    /// no dynamic or included parts qualify.
    fn external_push(
        &self,
        fragment: &CachedFragment,
        request: &CacheRequest,
    ) -> Option<(ExternalCacheEntry, ExternalPlacement)> {
        if !request.is_top_level() || !fragment.info.was_external_cache_group_id_set() {
            return None;
        }
        let group = fragment.info.external_cache_group_id()?;
        if !self.external_caches()?.contains(group) {
            warn!("Fragment {} names unknown external cache '{}'", fragment.id(), group);
            return None;
        }
        if !fragment.is_static() {
            debug!("Fragment {} has dynamic parts; not pushed", fragment.id());
            return None;
        }

        let mut content = BytesMut::new();
        for segment in &fragment.segments {
            if let ContentSegment::Static(bytes) = segment {
                content.extend_from_slice(bytes);
            }
        }

        let mut headers: HeaderTable = fragment.headers.iter().cloned().collect();
        for data_id in fragment.data_ids() {
            headers.append(DEPENDENCY_HEADER, data_id.clone());
        }

        let target = request.request_target();
        let entry = ExternalCacheEntry::new(request.host(), target.as_str(), content.freeze(), headers);
        let placement = ExternalPlacement {
            group: group.to_string(),
            uri: target,
        };
        Some((entry, placement))
    }

    fn fire_invalidations(&self, ids: &[String]) {
        if !ids.is_empty() {
            self.invalidate_by_dependencies(ids);
        }
    }

    /// Forward removals of pushed entries to their external groups
    fn forward_removed(&self, removed: &[Arc<CachedFragment>]) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let mut by_group: HashMap<&str, Vec<String>> = HashMap::new();
        for fragment in removed {
            if let Some(placement) = &fragment.external {
                by_group
                    .entry(placement.group.as_str())
                    .or_default()
                    .push(placement.uri.clone());
            }
        }
        for (group, uris) in by_group {
            dispatcher.invalidate_pages(group, uris);
        }
    }

    pub fn invalidate_by_id(&self, id: &str) -> usize {
        match self.store.invalidate_by_id(id) {
            Some(removed) => {
                info!("Invalidated fragment {}", id);
                self.metrics.record_invalidated(1);
                self.forward_removed(&[removed]);
                1
            }
            None => 0,
        }
    }

    /// Remove every entry depending on `data_id`, here and in every external group
    pub fn invalidate_by_dependency(&self, data_id: &str) -> usize {
        self.invalidate_by_dependencies(&[data_id.to_string()])
    }

    /// Invalidate several data ids as one operation
    ///
    /// Concurrent calls are serialized so external caches see invalidations
    /// in the same order as the local store.
    pub fn invalidate_by_dependencies(&self, data_ids: &[String]) -> usize {
        let _guard = self
            .invalidation_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut removed = Vec::new();
        for data_id in data_ids {
            removed.extend(self.store.invalidate_by_dependency(data_id));
        }
        info!(
            "Invalidated {} fragments for data ids {:?}",
            removed.len(),
            data_ids
        );
        self.metrics.record_invalidated(removed.len());
        self.forward_removed(&removed);
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.invalidate_ids(data_ids.to_vec());
        }
        removed.len()
    }

    /// Remove every entry built from `template` (the resource URI)
    pub fn invalidate_by_template(&self, template: &str) -> usize {
        let removed = self.store.invalidate_by_template(template);
        info!("Invalidated {} fragments for template {}", removed.len(), template);
        self.metrics.record_invalidated(removed.len());
        self.forward_removed(&removed);
        removed.len()
    }

    pub fn clear(&self) -> usize {
        let removed = self.store.clear();
        info!("Cleared {} fragments", removed.len());
        self.metrics.record_invalidated(removed.len());
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.clear();
        }
        removed.len()
    }

    /// Drop expired entries and their external copies
    pub fn purge_expired(&self) -> usize {
        let removed = self.store.purge_expired();
        if !removed.is_empty() {
            self.forward_removed(&removed);
        }
        removed.len()
    }

    /// Wait for queued external cache work
    pub async fn flush_external(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.flush().await;
        }
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until the coordinator is dropped
    pub fn spawn_expiry_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator: Weak<CacheCoordinator> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                let purged = coordinator.purge_expired();
                if purged > 0 {
                    debug!("Expiry sweep removed {} fragments", purged);
                }
            }
        })
    }
}

/// Turn the pending output of a fragment into storable segments
///
/// Returns the segments and whether a child prevents caching the parent.
fn resolve_children(
    info: &mut FragmentInfo,
    pending: Vec<PendingSegment>,
) -> Result<(Vec<ContentSegment>, bool)> {
    let consume = info.consume_subfragments();
    let mut segments = Vec::new();
    let mut vetoed = false;

    for segment in pending {
        let child = match segment {
            PendingSegment::Ready(s) => {
                segments.push(s);
                continue;
            }
            PendingSegment::Child(child) => child,
        };

        if child.vetoed {
            vetoed = true;
            segments.extend(child.segments);
            continue;
        }

        let inline = if consume {
            !child.do_not_consume
        } else {
            !child.cached && !child.do_not_consume
        };

        if inline {
            for data_id in &child.data_ids {
                info.add_data_id(data_id.clone())?;
            }
            segments.extend(child.segments);
        } else if let (true, Some(id)) = (child.cached, child.id) {
            segments.push(ContentSegment::Include { id });
        } else {
            // Not consumable and not cached: nothing to refer to on a hit.
            vetoed = true;
            segments.extend(child.segments);
        }
    }

    Ok((segments, vetoed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_config::{ConfigElement, ElementType};
    use crate::dynamic_content::DynamicContentProvider;
    use http::Method;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> CacheCoordinator {
        CacheCoordinator::new(Arc::new(FragmentStore::new(100, 1)))
    }

    fn weather() -> CacheConfig {
        CacheConfig::new("weather", ["/weather"]).with_element(
            ConfigElement::new(ElementType::RequestParameter, "city")
                .required(true)
                .with_data_id("city"),
        )
    }

    fn get(uri: &str, city: &str) -> CacheRequest {
        CacheRequest::new(Method::GET, uri).with_parameter("city", city)
    }

    #[test]
    fn test_miss_then_hit() {
        let coord = coordinator();
        coord.register(weather()).unwrap();
        let renders = AtomicUsize::new(0);
        let render = |_: &mut CacheRequest, resp: &mut CacheResponse| -> Result<()> {
            renders.fetch_add(1, Ordering::SeqCst);
            resp.write("sunny");
            Ok(())
        };

        let mut resp = CacheResponse::new();
        let outcome = coord.execute(&mut get("/weather", "paris"), &mut resp, render).unwrap();
        assert_eq!(outcome, Outcome::Stored);

        let mut resp = CacheResponse::new();
        let outcome = coord.execute(&mut get("/weather", "paris"), &mut resp, render).unwrap();
        assert_eq!(outcome, Outcome::Hit);
        assert_eq!(resp.body(), "sunny");
        assert_eq!(renders.load(Ordering::SeqCst), 1);

        let stats = coord.metrics().get_stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
    }

    #[test]
    fn test_unknown_uri_passes_through() {
        let coord = coordinator();
        let mut resp = CacheResponse::new();
        let outcome = coord
            .execute(&mut get("/other", "x"), &mut resp, |_, r| {
                r.write("plain");
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Passthrough);
        assert_eq!(resp.body(), "plain");
        assert!(coord.store().is_empty());
    }

    #[test]
    fn test_register_unknown_generator_fails() {
        let coord = coordinator();
        let mut config = weather();
        config.metadata_generator = "missing".into();
        assert!(coord.register(config).is_err());
        assert!(coord.config_for("/weather").is_none());
    }

    #[test]
    fn test_dynamic_content_reruns_on_hit() {
        struct Clock(AtomicUsize);
        impl DynamicContentProvider for Clock {
            fn provide_bytes(&self, out: &mut dyn io::Write) -> io::Result<()> {
                let n = self.0.fetch_add(1, Ordering::SeqCst);
                write!(out, "{}", n)
            }
        }

        let coord = coordinator();
        coord.register(weather()).unwrap();
        let clock = Arc::new(Clock(AtomicUsize::new(0)));

        let mut resp = CacheResponse::new();
        let provider = clock.clone();
        coord
            .execute(&mut get("/weather", "paris"), &mut resp, move |_, r| {
                r.write("t=");
                r.add_dynamic_content_provider(provider)
            })
            .unwrap();
        assert_eq!(resp.body(), "t=0");

        let mut resp = CacheResponse::new();
        let outcome = coord
            .execute(&mut get("/weather", "paris"), &mut resp, |_, _| {
                panic!("hit must not render")
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Hit);
        assert_eq!(resp.body(), "t=1");
    }

    #[test]
    fn test_stored_attributes_and_cookies_replayed() {
        let coord = coordinator();
        let mut config = weather();
        config.store_attributes = true;
        config.store_cookies = true;
        coord.register(config).unwrap();

        let mut resp = CacheResponse::new();
        coord
            .execute(&mut get("/weather", "paris"), &mut resp, |req, r| {
                req.set_attribute("forecast", "rain");
                r.add_cookie("seen", "1");
                r.write("x");
                Ok(())
            })
            .unwrap();

        let mut req = get("/weather", "paris");
        let mut resp = CacheResponse::new();
        coord.execute(&mut req, &mut resp, |_, _| Ok(())).unwrap();
        assert_eq!(req.attribute("forecast"), Some(&serde_json::json!("rain")));
        assert_eq!(resp.cookies(), [("seen".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_invalidate_only_resource_fires_ids() {
        let coord = coordinator();
        coord.register(weather()).unwrap();
        coord
            .register(
                CacheConfig {
                    invalidate_only: true,
                    ..CacheConfig::new("update", ["/update"]).with_element(
                        ConfigElement::new(ElementType::RequestParameter, "city")
                            .with_invalidate("city"),
                    )
                },
            )
            .unwrap();

        coord
            .execute(&mut get("/weather", "paris"), &mut CacheResponse::new(), |_, r| {
                r.write("old");
                Ok(())
            })
            .unwrap();
        assert_eq!(coord.store().len(), 1);

        let outcome = coord
            .execute(&mut get("/update", "paris"), &mut CacheResponse::new(), |_, _| Ok(()))
            .unwrap();
        assert_eq!(outcome, Outcome::Invalidated);
        assert!(coord.store().is_empty());
    }

    #[test]
    fn test_render_error_leaves_nothing_behind() {
        let coord = coordinator();
        coord.register(weather()).unwrap();
        let mut req = get("/weather", "paris");
        let err = coord
            .execute(&mut req, &mut CacheResponse::new(), |_, _| {
                Err(FragmentError::InternalError("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, FragmentError::InternalError(_)));
        assert!(req.fragment_info().is_none());
        assert!(coord.store().is_empty());
    }

    #[test]
    fn test_nested_child_included_by_id() {
        let coord = coordinator();
        coord.register(weather()).unwrap();
        coord
            .register(CacheConfig::new("header", ["/header"]).with_element(
                ConfigElement::new(ElementType::RequestParameter, "city").with_data_id("city"),
            ))
            .unwrap();

        let mut resp = CacheResponse::new();
        coord
            .execute(&mut get("/weather", "paris"), &mut resp, |req, r| {
                r.write("[");
                coord.execute_nested(req, r, "/header", |_, c| {
                    c.write("head");
                    Ok(())
                })?;
                r.write("]");
                Ok(())
            })
            .unwrap();
        assert_eq!(resp.body(), "[head]");
        assert_eq!(coord.store().len(), 2);

        // The parent refers to the child, so dropping the child forces a rebuild.
        coord.invalidate_by_id("/header:city=paris:requestType=GET");
        let rebuilt = AtomicUsize::new(0);
        let outcome = coord
            .execute(&mut get("/weather", "paris"), &mut CacheResponse::new(), |req, r| {
                rebuilt.fetch_add(1, Ordering::SeqCst);
                coord.execute_nested(req, r, "/header", |_, c| {
                    c.write("head");
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Stored);
        assert_eq!(rebuilt.load(Ordering::SeqCst), 1);
    }
}
