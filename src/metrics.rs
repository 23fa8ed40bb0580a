//! Metrics collection for the fragment cache
//!
//! Thread-safe counters updated by the coordinator, the store and the external
//! cache dispatcher. All operations are lock-free atomics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector for the fragment cache
#[derive(Debug, Default)]
pub struct FragmentMetrics {
    // Request statistics
    total_requests: AtomicU64,
    passthrough_requests: AtomicU64,
    not_cacheable_requests: AtomicU64,

    // Cache statistics
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fragments_stored: AtomicU64,
    fragments_vetoed: AtomicU64,
    entries_invalidated: AtomicU64,
    entries_evicted: AtomicU64,

    // External cache statistics
    external_pushes: AtomicU64,
    external_invalidations: AtomicU64,
    external_failures: AtomicU64,

    // Byte statistics
    bytes_from_cache: AtomicU64,
    bytes_rendered: AtomicU64,

    // Latency statistics (stored as microseconds)
    total_request_duration_us: AtomicU64,
    total_render_duration_us: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub passthrough_requests: u64,
    pub not_cacheable_requests: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fragments_stored: u64,
    pub fragments_vetoed: u64,
    pub entries_invalidated: u64,
    pub entries_evicted: u64,

    pub external_pushes: u64,
    pub external_invalidations: u64,
    pub external_failures: u64,

    pub bytes_from_cache: u64,
    pub bytes_rendered: u64,

    pub total_request_duration_us: u64,
    pub total_render_duration_us: u64,
}

impl FragmentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request reaching the coordinator
    ///
    /// `cacheable` is false when the URI maps to no registered resource.
    pub fn record_request(&self, cacheable: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !cacheable {
            self.passthrough_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a request whose id generator returned no id
    pub fn record_not_cacheable(&self) {
        self.not_cacheable_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fragment_stored(&self) {
        self.fragments_stored.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fragment that was built but discarded as uncacheable
    pub fn record_fragment_vetoed(&self) {
        self.fragments_vetoed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidated(&self, count: usize) {
        self.entries_invalidated
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: usize) {
        self.entries_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record pages written to an external cache
    pub fn record_external_push(&self, pages: usize) {
        self.external_pushes.fetch_add(pages as u64, Ordering::Relaxed);
    }

    pub fn record_external_invalidation(&self) {
        self.external_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_external_failure(&self) {
        self.external_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_from_cache(&self, bytes: u64) {
        self.bytes_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_rendered(&self, bytes: u64) {
        self.bytes_rendered.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_request_duration(&self, duration: Duration) {
        self.total_request_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_render_duration(&self, duration: Duration) {
        self.total_render_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded one by one, so a snapshot taken under load may not
    /// be perfectly consistent across fields.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            passthrough_requests: self.passthrough_requests.load(Ordering::Relaxed),
            not_cacheable_requests: self.not_cacheable_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            fragments_stored: self.fragments_stored.load(Ordering::Relaxed),
            fragments_vetoed: self.fragments_vetoed.load(Ordering::Relaxed),
            entries_invalidated: self.entries_invalidated.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
            external_pushes: self.external_pushes.load(Ordering::Relaxed),
            external_invalidations: self.external_invalidations.load(Ordering::Relaxed),
            external_failures: self.external_failures.load(Ordering::Relaxed),
            bytes_from_cache: self.bytes_from_cache.load(Ordering::Relaxed),
            bytes_rendered: self.bytes_rendered.load(Ordering::Relaxed),
            total_request_duration_us: self.total_request_duration_us.load(Ordering::Relaxed),
            total_render_duration_us: self.total_render_duration_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.passthrough_requests,
            &self.not_cacheable_requests,
            &self.cache_hits,
            &self.cache_misses,
            &self.fragments_stored,
            &self.fragments_vetoed,
            &self.entries_invalidated,
            &self.entries_evicted,
            &self.external_pushes,
            &self.external_invalidations,
            &self.external_failures,
            &self.bytes_from_cache,
            &self.bytes_rendered,
            &self.total_request_duration_us,
            &self.total_render_duration_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl MetricsSnapshot {
    /// Cache hit rate as a percentage (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }

    /// Average request duration in milliseconds
    pub fn avg_request_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_request_duration_us as f64 / self.total_requests as f64) / 1000.0
        }
    }

    /// Average render duration of cache misses in milliseconds
    pub fn avg_render_duration_ms(&self) -> f64 {
        if self.cache_misses == 0 {
            0.0
        } else {
            (self.total_render_duration_us as f64 / self.cache_misses as f64) / 1000.0
        }
    }

    /// Share of external cache calls that failed, as a percentage
    pub fn external_failure_rate(&self) -> f64 {
        let total = self.external_pushes + self.external_invalidations + self.external_failures;
        if total == 0 {
            0.0
        } else {
            (self.external_failures as f64 / total as f64) * 100.0
        }
    }
}
