//! External cache adapter for HTTP reverse proxies
//!
//! Talks to a caching proxy that accepts pushed pages and PURGE requests:
//!
//! - `PUT /uri` stores a page (headers from the page's header table, plus
//!   `X-Forwarded-Host` and an `ETag` computed from the content)
//! - `PURGE /uri` removes one page
//! - `PURGE /` with `X-Invalidate-Ids: a, b` removes pages by data id
//! - `PURGE /*` with `X-Purge-All: true` removes everything
//!
//! Transport errors and 5xx replies are retried with exponential backoff.

use crate::error::{FragmentError, Result};
use crate::external::{ExternalCacheAdapter, ExternalCacheEntry};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Retry policy for failed external cache calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Backoff durations in milliseconds for each retry attempt
    pub backoff_ms: Vec<u64>,
}

impl RetryPolicy {
    /// Exponential backoff starting at 100ms: 100, 200, 400, ...
    pub fn new(max_retries: usize) -> Self {
        Self::with_base(max_retries, 100)
    }

    pub fn with_base(max_retries: usize, base_ms: u64) -> Self {
        let backoff_ms = (0..max_retries)
            .map(|i| base_ms.saturating_mul(2u64.saturating_pow(i as u32)))
            .collect();
        RetryPolicy {
            max_retries,
            backoff_ms,
        }
    }

    pub fn should_retry(&self, attempt: usize, error: &FragmentError) -> bool {
        attempt < self.max_retries && error.should_retry()
    }

    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt)
            .copied()
            .unwrap_or_else(|| *self.backoff_ms.last().unwrap_or(&1000));
        Duration::from_millis(ms)
    }
}

/// Weak validator for pushed content
pub fn content_etag(content: &[u8]) -> String {
    format!("\"{:016x}\"", xxh3_64(content))
}

/// Adapter pushing fragments to a caching reverse proxy
#[derive(Debug, Clone)]
pub struct HttpPurgeAdapter {
    name: String,
    base_url: String,
    client: Client,
    purge: Method,
    retry_policy: RetryPolicy,
}

impl HttpPurgeAdapter {
    /// Create an adapter for the proxy at `base_url` (e.g. `http://127.0.0.1:8080`)
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, max_retries: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| FragmentError::HttpError(format!("Failed to create HTTP client: {}", e)))?;
        let purge = Method::from_bytes(b"PURGE")
            .map_err(|e| FragmentError::InternalError(format!("Invalid PURGE method: {}", e)))?;

        Ok(HttpPurgeAdapter {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            purge,
            retry_policy: RetryPolicy::new(max_retries),
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    fn url(&self, uri: &str) -> String {
        if uri.starts_with('/') {
            format!("{}{}", self.base_url, uri)
        } else {
            format!("{}/{}", self.base_url, uri)
        }
    }

    /// Send one request, mapping transport and status failures
    async fn send_once(&self, request: RequestBuilder) -> Result<()> {
        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                FragmentError::ParseError(format!("Invalid request: {}", e))
            } else {
                FragmentError::HttpError(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status();
        // A purge of something the proxy never had is not a failure.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(FragmentError::from_http_status(
            status.as_u16(),
            format!("{} rejected the request", self.name),
        ))
    }

    async fn send_with_retry<F>(&self, what: &str, build: F) -> Result<()>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            match self.send_once(build()).await {
                Ok(()) => {
                    debug!("{}: {} succeeded", self.name, what);
                    return Ok(());
                }
                Err(e) => {
                    if !self.retry_policy.should_retry(attempt, &e) {
                        return Err(e);
                    }
                    let backoff = self.retry_policy.backoff_duration(attempt);
                    warn!(
                        "{}: {} failed (attempt {}), retrying after {:?}: {}",
                        self.name,
                        what,
                        attempt + 1,
                        backoff,
                        e
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl ExternalCacheAdapter for HttpPurgeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_pages(&self, entries: Vec<ExternalCacheEntry>) -> Result<()> {
        for entry in entries {
            let url = self.url(entry.uri());
            let etag = content_etag(entry.content());
            self.send_with_retry(&format!("push {}", entry.uri()), || {
                let mut request = self
                    .client
                    .put(&url)
                    .header("X-Forwarded-Host", entry.host())
                    .header("ETag", etag.as_str());
                for (name, value) in entry.header_table().iter() {
                    request = request.header(name, value);
                }
                request.body(entry.content().clone())
            })
            .await?;
        }
        Ok(())
    }

    async fn invalidate_pages(&self, uris: Vec<String>) -> Result<()> {
        for uri in uris {
            let url = self.url(&uri);
            self.send_with_retry(&format!("purge {}", uri), || {
                self.client.request(self.purge.clone(), &url)
            })
            .await?;
        }
        Ok(())
    }

    async fn invalidate_ids(&self, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let url = self.url("/");
        let header = ids.join(", ");
        self.send_with_retry("invalidate ids", || {
            self.client
                .request(self.purge.clone(), &url)
                .header("X-Invalidate-Ids", header.as_str())
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        let url = self.url("/*");
        self.send_with_retry("purge all", || {
            self.client
                .request(self.purge.clone(), &url)
                .header("X-Purge-All", "true")
        })
        .await
    }
}
