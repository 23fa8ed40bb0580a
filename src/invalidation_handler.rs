//! HTTP PURGE handler for fragment invalidation
//!
//! Lets a back end or an edge tier invalidate cached fragments:
//! - `PURGE /path` removes every fragment built for that resource URI
//! - `PURGE /` with `X-Invalidate-Ids: city:paris, weather:today` removes by data id
//! - `PURGE /` with `X-Cache-Id: <id>` removes a single entry
//! - `PURGE /*` with `X-Purge-All: true` clears the cache
//!
//! Removals are forwarded to the external caches the entries were pushed to.

use crate::coordinator::CacheCoordinator;
use crate::error::{FragmentError, Result};
use crate::invalidation_metrics::InvalidationMetrics;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Invalidation endpoint handler
pub struct InvalidationHandler {
    coordinator: Arc<CacheCoordinator>,
    auth_token: Option<String>,
    metrics: Option<Arc<InvalidationMetrics>>,
}

/// Invalidation response body
#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidationResponse {
    pub success: bool,
    pub invalidated_count: usize,
    pub target: Option<String>,
    pub message: String,
}

enum Target {
    All,
    Ids(Vec<String>),
    CacheId(String),
    Template(String),
}

impl Target {
    fn mode(&self) -> &'static str {
        match self {
            Target::All => "all",
            Target::Ids(_) => "ids",
            Target::CacheId(_) => "id",
            Target::Template(_) => "template",
        }
    }
}

fn header<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|h| h.to_str().ok())
}

impl InvalidationHandler {
    pub fn new(coordinator: Arc<CacheCoordinator>) -> Self {
        Self {
            coordinator,
            auth_token: None,
            metrics: None,
        }
    }

    /// Require `Authorization: Bearer <token>` or `X-Purge-Token: <token>`
    pub fn with_auth(coordinator: Arc<CacheCoordinator>, auth_token: String) -> Self {
        Self {
            coordinator,
            auth_token: Some(auth_token),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<InvalidationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle an HTTP PURGE request
    pub async fn handle_invalidation<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>> {
        let start_time = Instant::now();

        if req.method().as_str() != "PURGE" {
            return self.error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Only PURGE method is allowed",
            );
        }

        if let Err(reason) = self.check_auth(&req) {
            if let Some(metrics) = &self.metrics {
                metrics.record_auth_failure(reason);
            }
            return self.error_response(
                StatusCode::UNAUTHORIZED,
                "Invalid or missing authentication token",
            );
        }

        let target = match Self::parse_target(&req) {
            Ok(target) => target,
            Err(e) => return self.error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        let mode = target.mode();
        if let Some(metrics) = &self.metrics {
            metrics.record_request(mode);
        }

        let (count, label) = match &target {
            Target::All => (self.coordinator.clear(), None),
            Target::Ids(ids) => (
                self.coordinator.invalidate_by_dependencies(ids),
                Some(ids.join(", ")),
            ),
            Target::CacheId(id) => (self.coordinator.invalidate_by_id(id), Some(id.clone())),
            Target::Template(path) => (
                self.coordinator.invalidate_by_template(path),
                Some(path.clone()),
            ),
        };
        info!("Invalidation ({}) removed {} fragments", mode, count);

        if let Some(metrics) = &self.metrics {
            metrics.record_result(mode, true);
            metrics.record_fragments(mode, count);
            metrics.record_duration(mode, start_time.elapsed().as_secs_f64());
        }

        let message = match &label {
            None => format!("Cleared {} fragments", count),
            Some(_) if count == 0 => "No cached fragments matched".to_string(),
            Some(label) => format!("Invalidated {} fragments for {}", count, label),
        };
        self.json_response(
            StatusCode::OK,
            &InvalidationResponse {
                success: true,
                invalidated_count: count,
                target: label,
                message,
            },
        )
    }

    fn parse_target<B>(req: &Request<B>) -> Result<Target> {
        let purge_all = header(req, "x-purge-all")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if purge_all {
            return Ok(Target::All);
        }

        if let Some(ids) = header(req, "x-invalidate-ids") {
            let ids: Vec<String> = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
            if ids.is_empty() {
                return Err(FragmentError::ParseError(
                    "X-Invalidate-Ids lists no ids".to_string(),
                ));
            }
            return Ok(Target::Ids(ids));
        }

        if let Some(id) = header(req, "x-cache-id") {
            return Ok(Target::CacheId(id.to_string()));
        }

        match req.uri().path() {
            "/" | "/*" => Err(FragmentError::ParseError(
                "Nothing to invalidate: give a resource path, X-Invalidate-Ids or X-Purge-All"
                    .to_string(),
            )),
            path => Ok(Target::Template(path.to_string())),
        }
    }

    fn check_auth<B>(&self, req: &Request<B>) -> std::result::Result<(), &'static str> {
        let Some(expected) = &self.auth_token else {
            return Ok(());
        };

        let bearer = header(req, "authorization")
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth));
        let tokens: Vec<&str> = [bearer, header(req, "x-purge-token")]
            .into_iter()
            .flatten()
            .collect();

        if tokens.is_empty() {
            warn!("Invalidation request without token rejected");
            Err("missing_token")
        } else if tokens.iter().any(|t| *t == expected.as_str()) {
            Ok(())
        } else {
            warn!("Invalidation request with invalid token rejected");
            Err("invalid_token")
        }
    }

    fn json_response(
        &self,
        status: StatusCode,
        body: &InvalidationResponse,
    ) -> Result<Response<Full<Bytes>>> {
        let json = serde_json::to_string(body).map_err(|e| {
            FragmentError::InternalError(format!("Failed to serialize response: {}", e))
        })?;

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .header("cache-control", "no-cache, no-store, must-revalidate")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| FragmentError::InternalError(format!("Failed to build response: {}", e)))
    }

    fn error_response(&self, status: StatusCode, message: &str) -> Result<Response<Full<Bytes>>> {
        self.json_response(
            status,
            &InvalidationResponse {
                success: false,
                invalidated_count: 0,
                target: None,
                message: message.to_string(),
            },
        )
    }
}
