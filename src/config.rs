/// Configuration management for the gateway core
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use crate::routes::PathPattern;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Shared counter and cache store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Built-in API key authorization
    #[serde(default)]
    pub auth: AuthConfig,
    /// Load balancing settings shared by all routes
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,
    /// Metrics and monitoring configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Route snapshot
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listening address
    pub http_addr: SocketAddr,
    /// Largest accepted request body in bytes
    #[serde(default = "default_max_request_body")]
    pub max_request_body: usize,
    /// Grace period for in-flight requests on shutdown
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

/// Backing implementation for rate-limit counters and cached responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local concurrent tables
    #[default]
    Memory,
    /// Remote Redis instance shared by every gateway process
    Redis,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Connection URL when `backend` is `redis`
    pub redis_url: Option<String>,
    /// Upper bound for a single store round-trip
    #[serde(with = "humantime_serde", default = "default_store_timeout")]
    pub operation_timeout: Duration,
    /// Capacity of the in-memory response cache
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
    /// Largest response body that will be cached
    #[serde(default = "default_max_cached_body")]
    pub max_cached_body: usize,
    /// How often expired in-memory windows are purged
    #[serde(with = "humantime_serde", default = "default_purge_interval")]
    pub purge_interval: Duration,
}

/// API key authorization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// API key header name
    #[serde(default = "default_api_key_header")]
    pub header: String,
    /// Reject requests that carry no API key
    #[serde(default)]
    pub required: bool,
    /// Known API keys
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

/// A single API key and what it grants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    /// User the key belongs to
    pub user_id: Option<String>,
    /// Scopes granted to the key
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Load balancing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    /// Consecutive failures before a backend is treated as unreachable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

/// Load balancing algorithms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    /// Round-robin algorithm
    #[default]
    RoundRobin,
    /// Least connections algorithm
    LeastConnections,
    /// IP hash algorithm
    IpHash,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Unique route name
    pub name: String,
    /// Path pattern: literal segments with an optional trailing `*`
    pub path: String,
    /// HTTP method to match; absent, `ANY` or `*` matches every method
    #[serde(default)]
    pub method: Option<String>,
    /// Ordered backend target URLs
    pub backends: Vec<String>,
    /// Backend selection strategy
    #[serde(default)]
    pub algorithm: LoadBalancingAlgorithm,
    /// Per-caller quota
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Response cache policy
    #[serde(default)]
    pub cache: Option<RouteCacheConfig>,
    /// Body transformation rules
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    /// End-to-end request deadline
    #[serde(with = "humantime_serde", default = "default_route_timeout")]
    pub timeout: Duration,
    /// Scopes the caller must hold
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Fixed-window quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window; zero blocks the route
    pub requests: u64,
    /// Window length, whole seconds
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }
}

/// Route-specific cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCacheConfig {
    /// Enable caching for this route
    pub enabled: bool,
    /// Time to live for stored responses
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub ttl: Duration,
    /// Request headers that take part in the cache key
    #[serde(default)]
    pub vary_headers: Vec<String>,
}

/// Request/response body transformation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub request: Option<TransformRules>,
    #[serde(default)]
    pub response: Option<TransformRules>,
}

/// Field-level JSON body rules. Paths may be dotted to reach nested objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformRules {
    /// Old field path to new field path
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    /// Field paths to delete
    #[serde(default)]
    pub remove: Vec<String>,
    /// Field paths to set
    #[serde(default)]
    pub add: BTreeMap<String, serde_json::Value>,
    /// Per-field replacement of specific values
    #[serde(default)]
    pub value_map: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl TransformRules {
    pub fn is_empty(&self) -> bool {
        self.rename.is_empty()
            && self.remove.is_empty()
            && self.add.is_empty()
            && self.value_map.is_empty()
    }
}

/// Metrics and monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus: bool,
    /// Prometheus metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    /// Metrics server address
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config file: {}", path))?
        } else if path.ends_with(".toml") {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config file: {}", path))?
        } else if path.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config file: {}", path))?
        } else {
            return Err(anyhow!(
                "Unsupported config file format. Supported formats: .yaml, .yml, .toml, .json"
            ));
        };

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(anyhow!("store.redis_url is required when store.backend is redis"));
        }
        if self.store.operation_timeout.is_zero() {
            return Err(anyhow!("store.operation_timeout must be greater than zero"));
        }
        if self.store.purge_interval.is_zero() {
            return Err(anyhow!("store.purge_interval must be greater than zero"));
        }

        validate_routes(&self.routes)
    }
}

/// Validate a route snapshot on its own, as done on reload
pub fn validate_routes(routes: &[RouteConfig]) -> Result<()> {
    let mut names = HashSet::with_capacity(routes.len());

    for route in routes {
        if route.name.is_empty() {
            return Err(anyhow!("Route with path '{}' has an empty name", route.path));
        }
        if !names.insert(route.name.as_str()) {
            return Err(anyhow!("Duplicate route name: {}", route.name));
        }

        PathPattern::parse(&route.path)
            .with_context(|| format!("Route '{}' has an invalid path pattern", route.name))?;

        if let Some(method) = &route.method {
            if !is_any_method(method) {
                http::Method::from_bytes(method.as_bytes()).map_err(|_| {
                    anyhow!("Route '{}' has an invalid method '{}'", route.name, method)
                })?;
            }
        }

        if route.backends.is_empty() {
            return Err(anyhow!(
                "Route '{}' must have at least one backend target",
                route.name
            ));
        }
        for target in &route.backends {
            let parsed = url::Url::parse(target).with_context(|| {
                format!("Route '{}' has an invalid backend URL '{}'", route.name, target)
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(anyhow!(
                    "Route '{}' backend '{}' must use http or https",
                    route.name,
                    target
                ));
            }
        }

        if route.timeout.is_zero() {
            return Err(anyhow!("Route '{}' timeout must be greater than zero", route.name));
        }

        if let Some(rate_limit) = &route.rate_limit {
            if rate_limit.window.as_secs() == 0 {
                return Err(anyhow!(
                    "Route '{}' rate limit window must be at least one second",
                    route.name
                ));
            }
        }

        if let Some(cache) = &route.cache {
            if cache.enabled && cache.ttl.is_zero() {
                return Err(anyhow!("Route '{}' cache ttl must be greater than zero", route.name));
            }
        }
    }

    Ok(())
}

/// `ANY` and `*` stand for every method
pub fn is_any_method(method: &str) -> bool {
    method == "*" || method.eq_ignore_ascii_case("any")
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_request_body() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_store_timeout() -> Duration {
    Duration::from_millis(50)
}

fn default_max_cache_entries() -> usize {
    10000
}

fn default_max_cached_body() -> usize {
    1024 * 1024 // 1MB
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_route_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: None,
            operation_timeout: default_store_timeout(),
            max_cache_entries: default_max_cache_entries(),
            max_cached_body: default_max_cached_body(),
            purge_interval: default_purge_interval(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: default_api_key_header(),
            required: false,
            api_keys: Vec::new(),
        }
    }
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus: true,
            metrics_path: default_metrics_path(),
            metrics_addr: None,
        }
    }
}
