//! Configuration management for the fragment cache

use crate::cache_config::CacheConfig;
use crate::error::{FragmentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Configuration for the fragment cache engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentCacheConfig {
    /// Cache instance name stamped on every entry (default: "default")
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Maximum number of stored fragments (default: 10000)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Priority of entries whose metadata sets none (default: 1)
    #[serde(default = "default_priority")]
    pub default_priority: i32,

    /// Seconds between background sweeps of expired entries (default: 60)
    #[serde(default = "default_expiry_interval")]
    pub expiry_interval_secs: u64,

    /// Cacheable resources
    #[serde(default)]
    pub cache_entries: Vec<CacheConfig>,

    /// External cache groups fragments can be pushed to
    #[serde(default)]
    pub external_caches: Vec<ExternalCacheConfig>,

    /// Invalidation / metrics endpoint configuration (optional)
    #[serde(default)]
    pub endpoint: Option<EndpointConfig>,
}

/// Transport backing an external cache group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalCacheKind {
    /// In-process page table
    Memory,
    /// Caching reverse proxy accepting PUT and PURGE
    HttpPurge,
}

/// One external cache group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalCacheConfig {
    pub name: String,

    pub kind: ExternalCacheKind,

    /// Base URL of the proxy (required for `http_purge`)
    #[serde(default)]
    pub address: Option<String>,

    /// Retries of failed transport calls (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

/// Configuration for the HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    /// Whether to start the endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind to (default: "127.0.0.1:9090")
    #[serde(default = "default_endpoint_address")]
    pub address: String,

    /// Token required on invalidation requests (optional)
    /// If not set, invalidation requests are not authenticated
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Whether to record Prometheus metrics for invalidations (default: true)
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            enabled: false,
            address: default_endpoint_address(),
            auth_token: None,
            enable_metrics: true,
        }
    }
}

fn default_instance_name() -> String {
    "default".to_string()
}

fn default_max_entries() -> usize {
    10_000
}

fn default_priority() -> i32 {
    1
}

fn default_expiry_interval() -> u64 {
    60
}

fn default_max_retries() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_endpoint_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for FragmentCacheConfig {
    fn default() -> Self {
        FragmentCacheConfig {
            instance_name: default_instance_name(),
            max_entries: default_max_entries(),
            default_priority: default_priority(),
            expiry_interval_secs: default_expiry_interval(),
            cache_entries: Vec::new(),
            external_caches: Vec::new(),
            endpoint: None,
        }
    }
}

impl FragmentCacheConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(FragmentCacheConfig)` if loading and validation succeed
    /// * `Err(FragmentError)` if the file cannot be read or the config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            FragmentError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: FragmentCacheConfig = serde_yaml::from_str(content).map_err(|e| {
            FragmentError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - max_entries and expiry_interval_secs must be > 0
    /// - every cache entry must be valid on its own
    /// - a URI may belong to one cache entry only
    /// - external cache names must be unique; `http_purge` needs an http(s) address
    /// - cache entries may only name declared external caches
    /// - an enabled endpoint needs a valid socket address
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(FragmentError::ConfigError(
                "max_entries must be greater than 0".to_string(),
            ));
        }

        if self.expiry_interval_secs == 0 {
            return Err(FragmentError::ConfigError(
                "expiry_interval_secs must be greater than 0".to_string(),
            ));
        }

        let mut groups = HashSet::new();
        for external in &self.external_caches {
            if external.name.trim().is_empty() {
                return Err(FragmentError::ConfigError(
                    "external cache name must not be empty".to_string(),
                ));
            }
            if !groups.insert(external.name.as_str()) {
                return Err(FragmentError::ConfigError(format!(
                    "external cache '{}' is declared twice",
                    external.name
                )));
            }
            if external.kind == ExternalCacheKind::HttpPurge {
                match external.address.as_deref() {
                    Some(addr) if addr.starts_with("http://") || addr.starts_with("https://") => {}
                    Some(addr) => {
                        return Err(FragmentError::ConfigError(format!(
                            "external cache '{}' has invalid address '{}'",
                            external.name, addr
                        )))
                    }
                    None => {
                        return Err(FragmentError::ConfigError(format!(
                            "external cache '{}' of kind http_purge needs an address",
                            external.name
                        )))
                    }
                }
            }
        }

        let mut uris = HashSet::new();
        for entry in &self.cache_entries {
            entry.validate()?;
            for uri in &entry.uris {
                if !uris.insert(uri.as_str()) {
                    return Err(FragmentError::ConfigError(format!(
                        "uri '{}' is claimed by more than one cache entry",
                        uri
                    )));
                }
            }
            if let Some(group) = &entry.external_cache {
                if !groups.contains(group.as_str()) {
                    return Err(FragmentError::ConfigError(format!(
                        "cache entry '{}' names unknown external cache '{}'",
                        entry.name, group
                    )));
                }
            }
        }

        if let Some(endpoint) = &self.endpoint {
            if endpoint.enabled {
                endpoint.address.parse::<SocketAddr>().map_err(|e| {
                    FragmentError::ConfigError(format!(
                        "Invalid endpoint address '{}': {}",
                        endpoint.address, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}
