//! HTTP endpoint for metrics, health and invalidation
//!
//! Serves:
//! - `GET /metrics` counters in Prometheus text format
//! - `GET /health` liveness probe
//! - `GET /stats` metrics and store statistics as JSON
//! - `PURGE <path>` invalidation (see [`InvalidationHandler`])

use crate::coordinator::CacheCoordinator;
use crate::invalidation_handler::InvalidationHandler;
use crate::metrics::MetricsSnapshot;
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

struct EndpointState {
    coordinator: Arc<CacheCoordinator>,
    invalidation: Option<InvalidationHandler>,
    registry: Option<Registry>,
}

/// Metrics and invalidation server
pub struct MetricsEndpoint {
    state: Arc<EndpointState>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    pub fn new(coordinator: Arc<CacheCoordinator>, addr: SocketAddr) -> Self {
        Self {
            state: Arc::new(EndpointState {
                coordinator,
                invalidation: None,
                registry: None,
            }),
            addr,
        }
    }

    fn state_mut(&mut self) -> Option<&mut EndpointState> {
        Arc::get_mut(&mut self.state)
    }

    /// Accept `PURGE` requests through this handler
    pub fn with_invalidation(mut self, handler: InvalidationHandler) -> Self {
        if let Some(state) = self.state_mut() {
            state.invalidation = Some(handler);
        }
        self
    }

    /// Append the metrics of a prometheus registry to `/metrics`
    pub fn with_registry(mut self, registry: Registry) -> Self {
        if let Some(state) = self.state_mut() {
            state.registry = Some(registry);
        }
        self
    }

    /// Bind the configured address and serve until the process exits
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = listener.local_addr()?;
        info!("Fragment cache endpoint listening on http://{}", addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { handle_request(req, state).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<EndpointState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method().as_str() == "PURGE" {
        return Ok(match &state.invalidation {
            Some(handler) => match handler.handle_invalidation(req).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Invalidation request failed: {}", e);
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string())
                }
            },
            None => text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "text/plain",
                "Invalidation is disabled",
            ),
        });
    }

    if req.method() != Method::GET {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "405 Method Not Allowed",
        ));
    }

    Ok(match req.uri().path() {
        "/metrics" => metrics_response(&state),
        "/health" => text_response(StatusCode::OK, "application/json", r#"{"status":"healthy"}"#),
        "/stats" => stats_response(&state),
        "/" => text_response(
            StatusCode::OK,
            "text/plain; charset=utf-8",
            "fragment cache endpoint: /metrics /health /stats, PURGE <path> to invalidate\n",
        ),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "404 Not Found"),
    })
}

fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn metrics_response(state: &EndpointState) -> Response<Full<Bytes>> {
    let snapshot = state.coordinator.metrics().get_stats();
    let mut body = format_prometheus_metrics(&snapshot, state.coordinator.store().len());

    if let Some(registry) = &state.registry {
        let mut buffer = Vec::new();
        match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
            Ok(()) => body.push_str(&String::from_utf8_lossy(&buffer)),
            Err(e) => warn!("Failed to encode prometheus registry: {}", e),
        }
    }

    text_response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body)
}

fn stats_response(state: &EndpointState) -> Response<Full<Bytes>> {
    let body = json!({
        "metrics": state.coordinator.metrics().get_stats(),
        "store": state.coordinator.store().stats(),
    });
    text_response(StatusCode::OK, "application/json", body.to_string())
}

fn push_metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP fragment_cache_{} {}", name, help);
    let _ = writeln!(out, "# TYPE fragment_cache_{} {}", name, kind);
    let _ = writeln!(out, "fragment_cache_{} {}", name, value);
    out.push('\n');
}

/// Format counters in Prometheus exposition format
fn format_prometheus_metrics(snapshot: &MetricsSnapshot, entries: usize) -> String {
    let mut out = String::new();

    push_metric(&mut out, "requests_total", "counter", "Total number of requests executed", snapshot.total_requests);
    push_metric(&mut out, "passthrough_requests_total", "counter", "Requests for URIs without a cacheable resource", snapshot.passthrough_requests);
    push_metric(&mut out, "not_cacheable_requests_total", "counter", "Requests for which no cache id was generated", snapshot.not_cacheable_requests);
    push_metric(&mut out, "hits_total", "counter", "Number of cache hits", snapshot.cache_hits);
    push_metric(&mut out, "misses_total", "counter", "Number of cache misses", snapshot.cache_misses);
    push_metric(&mut out, "hit_rate", "gauge", "Cache hit rate percentage", format!("{:.2}", snapshot.cache_hit_rate()));
    push_metric(&mut out, "fragments_stored_total", "counter", "Fragments rendered and stored", snapshot.fragments_stored);
    push_metric(&mut out, "fragments_vetoed_total", "counter", "Fragments rendered but discarded as uncacheable", snapshot.fragments_vetoed);
    push_metric(&mut out, "entries_invalidated_total", "counter", "Entries removed by invalidation", snapshot.entries_invalidated);
    push_metric(&mut out, "entries_evicted_total", "counter", "Entries evicted to make room", snapshot.entries_evicted);
    push_metric(&mut out, "entries", "gauge", "Entries currently stored", entries);
    push_metric(&mut out, "external_pushes_total", "counter", "Pages written to external caches", snapshot.external_pushes);
    push_metric(&mut out, "external_invalidations_total", "counter", "Invalidations sent to external caches", snapshot.external_invalidations);
    push_metric(&mut out, "external_failures_total", "counter", "Failed external cache calls", snapshot.external_failures);
    push_metric(&mut out, "bytes_from_cache_total", "counter", "Bytes served from stored fragments", snapshot.bytes_from_cache);
    push_metric(&mut out, "bytes_rendered_total", "counter", "Bytes produced by rendering", snapshot.bytes_rendered);
    push_metric(&mut out, "request_duration_ms_avg", "gauge", "Average request duration in milliseconds", format!("{:.2}", snapshot.avg_request_duration_ms()));
    push_metric(&mut out, "render_duration_ms_avg", "gauge", "Average render duration of misses in milliseconds", format!("{:.2}", snapshot.avg_render_duration_ms()));

    out
}
