//! Configuration data structures for Ladle.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! intentionally serde-friendly and include defaults so that minimal configs remain concise.
//! The builder and enums here are considered part of the public API for embedding.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

fn default_client_key_header() -> String {
    "x-client-id".to_string()
}

fn default_weight() -> u32 {
    1
}

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    /// Header consulted first when deriving the per-client rate-limit key.
    /// Falls back to X-Forwarded-For / X-Real-IP / source address.
    #[serde(default = "default_client_key_header")]
    pub client_key_header: String,
    pub routes: Vec<RouteDefinition>,
    pub services: HashMap<String, ServiceConfig>,
    /// Named filters referenced by routes via `RouteDefinition::filters`.
    #[serde(default)]
    pub filters: HashMap<String, FilterConfig>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder.
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Breaker settings for a service (per-service override or defaults).
    pub fn breaker_for(&self, service: &str) -> BreakerConfig {
        self.services
            .get(service)
            .and_then(|s| s.breaker.clone())
            .unwrap_or_default()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            client_key_header: default_client_key_header(),
            routes: Vec::new(),
            services: HashMap::new(),
            filters: HashMap::new(),
            dispatch: DispatchConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

/// One entry of the route table.
///
/// Pattern syntax: `/`-separated segments where `*` matches exactly one
/// segment and a trailing `**` matches any remainder. Static segments always
/// beat wildcards at the same position.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteDefinition {
    pub id: String,
    pub pattern: String,
    /// Logical service name; must exist in `GatewayConfig::services`.
    pub service: String,
    /// Optional method allow-list ("GET", "POST", ...). Absent means all.
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    /// Ordered names of filters applied to this route.
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Upstream call timeout, e.g. "10s". Falls back to the dispatch default.
    #[serde(default)]
    pub timeout: Option<String>,
}

impl RouteDefinition {
    /// Parsed per-route timeout, if configured.
    pub fn timeout_duration(&self) -> Result<Option<Duration>, String> {
        self.timeout
            .as_deref()
            .map(|t| {
                humantime::parse_duration(t)
                    .map_err(|e| format!("invalid timeout '{t}' for route '{}': {e}", self.id))
            })
            .transpose()
    }
}

/// A logical upstream service with its instance pool.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub instances: Vec<InstanceConfig>,
    /// Per-service breaker thresholds (defaults apply when absent).
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
    /// Health probe path override for this service's instances.
    #[serde(default)]
    pub health_path: Option<String>,
}

/// One upstream instance address.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceConfig {
    pub url: String,
    /// Relative selection weight; instances with weight > 1 receive a
    /// proportionally larger share of round-robin picks.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Per-route token-bucket rate limit.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum burst size (bucket capacity).
    pub capacity: u32,
    /// Continuous refill rate in tokens per second. Zero means the bucket
    /// never refills within the process lifetime.
    pub refill_per_sec: f64,
}

fn default_window_size() -> usize {
    20
}

fn default_failure_ratio() -> f64 {
    0.5
}

fn default_min_samples() -> usize {
    10
}

fn default_cooldown() -> String {
    "30s".to_string()
}

/// Circuit breaker thresholds for one service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Number of most recent call outcomes considered.
    pub window_size: usize,
    /// Failure ratio above which the breaker opens.
    pub failure_ratio: f64,
    /// Minimum recorded outcomes before the ratio is evaluated.
    pub min_samples: usize,
    /// Time spent open before a half-open probe is allowed, e.g. "30s".
    pub cooldown: String,
}

impl BreakerConfig {
    pub fn cooldown_duration(&self) -> Result<Duration, String> {
        humantime::parse_duration(&self.cooldown)
            .map_err(|e| format!("invalid breaker cooldown '{}': {e}", self.cooldown))
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            failure_ratio: default_failure_ratio(),
            min_samples: default_min_samples(),
            cooldown: default_cooldown(),
        }
    }
}

fn default_dispatch_timeout() -> String {
    "10s".to_string()
}

fn default_idle_window() -> String {
    "10m".to_string()
}

fn default_sweep_interval() -> String {
    "60s".to_string()
}

/// Dispatch-wide tunables.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upstream call timeout used when a route sets none.
    pub default_timeout: String,
    /// Rate-limit buckets unseen for this long are evicted by the sweep.
    pub rate_limit_idle_window: String,
    /// Interval between bucket sweeps.
    pub rate_limit_sweep_interval: String,
}

impl DispatchConfig {
    pub fn default_timeout_duration(&self) -> Result<Duration, String> {
        humantime::parse_duration(&self.default_timeout)
            .map_err(|e| format!("invalid default_timeout '{}': {e}", self.default_timeout))
    }

    pub fn idle_window_duration(&self) -> Result<Duration, String> {
        humantime::parse_duration(&self.rate_limit_idle_window).map_err(|e| {
            format!(
                "invalid rate_limit_idle_window '{}': {e}",
                self.rate_limit_idle_window
            )
        })
    }

    pub fn sweep_interval_duration(&self) -> Result<Duration, String> {
        humantime::parse_duration(&self.rate_limit_sweep_interval).map_err(|e| {
            format!(
                "invalid rate_limit_sweep_interval '{}': {e}",
                self.rate_limit_sweep_interval
            )
        })
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_dispatch_timeout(),
            rate_limit_idle_window: default_idle_window(),
            rate_limit_sweep_interval: default_sweep_interval(),
        }
    }
}

/// Header mutations applied by a filter.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct HeaderActions {
    #[serde(default)]
    pub add: HashMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// A named, reusable request/response mutation referenced by routes.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FilterConfig {
    pub request_headers: HeaderActions,
    pub response_headers: HeaderActions,
    /// Path prefix removed before the request is forwarded upstream.
    pub strip_prefix: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub path: String,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 2,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Builder for GatewayConfig to allow for cleaner configuration creation.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    listen_addr: Option<String>,
    client_key_header: Option<String>,
    routes: Vec<RouteDefinition>,
    services: HashMap<String, ServiceConfig>,
    filters: HashMap<String, FilterConfig>,
    dispatch: Option<DispatchConfig>,
    health_check: Option<HealthCheckConfig>,
}

impl GatewayConfigBuilder {
    /// Set the listen address.
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Set the client-key header name.
    pub fn client_key_header(mut self, header: impl Into<String>) -> Self {
        self.client_key_header = Some(header.into());
        self
    }

    /// Append a route definition.
    pub fn route(mut self, route: RouteDefinition) -> Self {
        self.routes.push(route);
        self
    }

    /// Register a service with its instance pool.
    pub fn service(mut self, name: impl Into<String>, config: ServiceConfig) -> Self {
        self.services.insert(name.into(), config);
        self
    }

    /// Register a named filter.
    pub fn filter(mut self, name: impl Into<String>, config: FilterConfig) -> Self {
        self.filters.insert(name.into(), config);
        self
    }

    /// Set dispatch-wide tunables.
    pub fn dispatch(mut self, config: DispatchConfig) -> Self {
        self.dispatch = Some(config);
        self
    }

    /// Set health check configuration.
    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    /// Build the final GatewayConfig.
    pub fn build(self) -> Result<GatewayConfig, String> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| "listen_addr is required".to_string())?;

        if self.routes.is_empty() {
            return Err("at least one route must be configured".to_string());
        }

        Ok(GatewayConfig {
            listen_addr,
            client_key_header: self
                .client_key_header
                .unwrap_or_else(default_client_key_header),
            routes: self.routes,
            services: self.services,
            filters: self.filters,
            dispatch: self.dispatch.unwrap_or_default(),
            health_check: self.health_check.unwrap_or_default(),
        })
    }
}
