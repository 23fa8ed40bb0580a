//! Fragment Cache
//!
//! An output cache for rendered fragments: whole pages or the pieces they are
//! assembled from. Every cacheable resource carries a [`CacheConfig`] policy that
//! says how to derive a cache id from the request, how long entries live and which
//! data ids they depend on.
//!
//! # Overview
//!
//! A request flows through [`CacheCoordinator::execute`]:
//!
//! 1. The resource is looked up by URI. Unknown URIs render without caching.
//! 2. The resource's [`IdGenerator`] computes a cache id from parameters,
//!    attributes, session values and cookies. No id means the request is not
//!    cacheable.
//! 3. On a hit the stored segments are replayed, dynamic parts re-run and stored
//!    attributes and cookies restored.
//! 4. On a miss a [`FragmentInfo`] is opened, the render callback runs, the
//!    [`MetaDataGenerator`] fills in expiry, priority and data ids, nested
//!    fragments are consumed or referenced, and the entry is committed to the
//!    [`FragmentStore`].
//! 5. Complete pages bound to an external cache group are pushed through an
//!    [`ExternalCacheAdapter`].
//!
//! Invalidation by data id, template or cache id removes entries locally and
//! forwards the removal to every external group that holds a copy.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use fragment_cache::{
//!     CacheConfig, CacheCoordinator, CacheRequest, CacheResponse, ConfigElement, ElementType,
//!     FragmentStore, Outcome,
//! };
//! use http::Method;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = CacheCoordinator::new(Arc::new(FragmentStore::new(1000, 1)));
//! coordinator.register(
//!     CacheConfig::new("weather", ["/weather"]).with_element(
//!         ConfigElement::new(ElementType::RequestParameter, "city")
//!             .required(true)
//!             .with_data_id("city"),
//!     ),
//! )?;
//!
//! let mut request = CacheRequest::new(Method::GET, "/weather").with_parameter("city", "paris");
//! let mut response = CacheResponse::new();
//! let outcome = coordinator.execute(&mut request, &mut response, |_, out| {
//!     out.write("sunny");
//!     Ok(())
//! })?;
//! assert_eq!(outcome, Outcome::Stored);
//!
//! // Everything built for Paris goes away
//! coordinator.invalidate_by_dependency("city:paris");
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! An engine is usually built from YAML with [`CacheCoordinator::from_config`]:
//!
//! ```yaml
//! max_entries: 10000
//! cache_entries:
//!   - name: weather
//!     uris: ["/weather"]
//!     timeout: 300
//!     external_cache: edge
//!     elements:
//!       - type: request_parameter
//!         id: city
//!         required: true
//!         data_id: city
//! external_caches:
//!   - name: edge
//!     kind: http_purge
//!     address: "http://127.0.0.1:6081"
//! endpoint:
//!   enabled: true
//!   address: "127.0.0.1:9090"
//! ```
//!
//! See [`FragmentCacheConfig`] for every option.

pub mod cache_config;
pub mod config;
pub mod coordinator;
pub mod dynamic_content;
pub mod entry_info;
pub mod error;
pub mod external;
pub mod fragment_info;
pub mod generator;
pub mod http_adapter;
pub mod invalidation_handler;
pub mod invalidation_metrics;
pub mod metrics;
pub mod metrics_endpoint;
pub mod request;
pub mod response;
pub mod store;

// Re-export commonly used types
pub use cache_config::{CacheConfig, ConfigElement, ElementType, SharingPolicy};
pub use config::{EndpointConfig, ExternalCacheConfig, ExternalCacheKind, FragmentCacheConfig};
pub use coordinator::{CacheCoordinator, Outcome};
pub use dynamic_content::DynamicContentProvider;
pub use entry_info::EntryInfo;
pub use error::{FragmentError, Result};
pub use external::{
    ExternalCacheAdapter, ExternalCacheDispatcher, ExternalCacheEntry, ExternalCacheGroups,
    HeaderTable, InMemoryExternalCache, DEPENDENCY_HEADER,
};
pub use fragment_info::{FragmentInfo, FragmentState};
pub use generator::{
    DefaultIdGenerator, DefaultMetaDataGenerator, GeneratorRegistry, IdGenerator,
    MetaDataGenerator,
};
pub use http_adapter::{HttpPurgeAdapter, RetryPolicy};
pub use invalidation_handler::{InvalidationHandler, InvalidationResponse};
pub use invalidation_metrics::InvalidationMetrics;
pub use metrics::{FragmentMetrics, MetricsSnapshot};
pub use metrics_endpoint::MetricsEndpoint;
pub use request::{AttributeTable, CacheRequest};
pub use response::{CacheResponse, ContentSegment, OutputMode};
pub use store::{CachedFragment, FragmentStore, StoreStats};
