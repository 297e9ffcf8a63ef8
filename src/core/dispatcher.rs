//! Dispatch pipeline orchestration.
//!
//! The `GatewayDispatcher` coordinates the router, rate limiter, circuit
//! breakers and upstream registry. It owns no per-request state of its own;
//! each component guards its own keyed state, so unrelated traffic never
//! serializes. The pipeline for every request is:
//!
//! route match -> rate limit -> breaker acquire -> instance pick ->
//! forward (bounded timeout) -> record outcome
//!
//! Exactly one breaker window entry and at most one rate-limit token are
//! consumed per dispatch; the idempotent retry path records only the final
//! outcome of the dispatch.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use axum::body::Body as AxumBody;
use eyre::{Result, eyre};
use http::{HeaderMap, HeaderValue, Method, Uri, header};
use hyper::{Request, Response};

use crate::{
    config::models::GatewayConfig,
    core::{
        breaker::{BreakerMap, BreakerPermit, BreakerSettings, Outcome},
        error::{DispatchError, DispatchResult},
        rate_limit::RateLimiterMap,
        registry::{RegistryError, UpstreamRegistry},
        router::{Route, RouteTable, RouterHandle},
    },
    ports::http_client::HttpClient,
};

/// Settings resolved out of the raw config once per (re)load so the hot
/// path never parses duration strings.
struct RuntimeSettings {
    client_key_header: String,
    breaker_by_service: HashMap<String, BreakerSettings>,
    default_breaker: BreakerSettings,
    idle_window: Duration,
    sweep_interval: Duration,
}

impl RuntimeSettings {
    fn resolve(config: &GatewayConfig) -> Result<Self> {
        let mut breaker_by_service = HashMap::new();
        for (name, service) in &config.services {
            if let Some(breaker_config) = &service.breaker {
                let settings = BreakerSettings::resolve(breaker_config)
                    .map_err(|e| eyre!("service '{name}': {e}"))?;
                breaker_by_service.insert(name.clone(), settings);
            }
        }

        Ok(Self {
            client_key_header: config.client_key_header.clone(),
            breaker_by_service,
            default_breaker: BreakerSettings::default(),
            idle_window: config.dispatch.idle_window_duration().map_err(|e| eyre!(e))?,
            sweep_interval: config
                .dispatch
                .sweep_interval_duration()
                .map_err(|e| eyre!(e))?,
        })
    }

    fn breaker_for(&self, service: &str) -> &BreakerSettings {
        self.breaker_by_service
            .get(service)
            .unwrap_or(&self.default_breaker)
    }
}

/// Central orchestrator for routing, admission control and upstream
/// forwarding. An instance is cheap to share (components are internally
/// reference counted) and long-lived: breaker and bucket state survive
/// configuration reloads.
pub struct GatewayDispatcher {
    router: RouterHandle,
    rate_limiters: RateLimiterMap,
    breakers: BreakerMap,
    registry: Arc<UpstreamRegistry>,
    settings: ArcSwap<RuntimeSettings>,
    http_client: Arc<dyn HttpClient>,
}

impl GatewayDispatcher {
    /// Build a dispatcher from a validated configuration.
    pub async fn new(config: &GatewayConfig, http_client: Arc<dyn HttpClient>) -> Result<Self> {
        let table = RouteTable::build(config)?;
        let settings = RuntimeSettings::resolve(config)?;
        let registry = Arc::new(UpstreamRegistry::new());
        registry.apply(config).await;

        Ok(Self {
            router: RouterHandle::new(table),
            rate_limiters: RateLimiterMap::new(),
            breakers: BreakerMap::new(),
            registry,
            settings: ArcSwap::from_pointee(settings),
            http_client,
        })
    }

    /// Apply a new validated configuration.
    ///
    /// The route table is swapped atomically; the registry preserves health
    /// for unchanged instances; breaker windows and rate-limit buckets keep
    /// their state and only pick up the new thresholds.
    pub async fn reload(&self, config: &GatewayConfig) -> Result<()> {
        let table = RouteTable::build(config)?;
        let settings = RuntimeSettings::resolve(config)?;
        self.registry.apply(config).await;
        self.settings.store(Arc::new(settings));
        self.router.swap(table);
        Ok(())
    }

    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    /// Current route table snapshot (status endpoint / logging).
    pub fn route_table(&self) -> Arc<RouteTable> {
        self.router.snapshot()
    }

    /// Breaker states per service (status endpoint).
    pub fn breaker_snapshot(&self) -> Vec<(String, &'static str)> {
        self.breakers.snapshot()
    }

    /// Number of live rate-limit buckets (status endpoint).
    pub fn bucket_count(&self) -> usize {
        self.rate_limiters.len()
    }

    /// Bucket sweep cadence from the current configuration.
    pub fn sweep_interval(&self) -> Duration {
        self.settings.load().sweep_interval
    }

    /// Evict idle rate-limit buckets; run periodically by the sweep task.
    pub async fn sweep_rate_limiters(&self) -> usize {
        let idle_window = self.settings.load().idle_window;
        let evicted = self.rate_limiters.sweep(Instant::now(), idle_window).await;
        if evicted > 0 {
            tracing::debug!(evicted, "swept idle rate-limit buckets");
        }
        evicted
    }

    /// Run one request through the full pipeline.
    pub async fn dispatch(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> DispatchResult<Response<AxumBody>> {
        let settings = self.settings.load();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        // 1. Route match.
        let route = self.router.matches(&path, &method)?;

        // 2. Admission control; denied requests are terminal.
        if let Some(policy) = &route.rate_limit {
            let client_key =
                extract_client_key(req.headers(), client_addr, &settings.client_key_header);
            let bucket_key = RateLimiterMap::bucket_key(&client_key, &route.id);
            if !self
                .rate_limiters
                .allow(&bucket_key, policy, Instant::now())
                .await
            {
                tracing::debug!(route = %route.id, client = %client_key, "rate limited");
                crate::metrics::increment_rate_limited(&route.id);
                return Err(DispatchError::RateLimited {
                    route_id: route.id.clone(),
                });
            }
        }

        // 3. Circuit breaker; open circuits fail fast with no upstream contact.
        let breaker_settings = settings.breaker_for(&route.service).clone();
        let permit = self
            .breakers
            .try_acquire(&route.service, &breaker_settings, Instant::now())
            .await?;

        // 4. Instance selection. Failing here drops the permit without an
        // outcome; a dropped half-open probe is reissued after a cooldown.
        let instance = self
            .registry
            .pick(&route.service)
            .map_err(map_registry_error)?;

        // 5-7. Forward, record the final outcome, relay the response.
        self.forward(
            req,
            &route,
            instance.url(),
            client_addr,
            permit,
            &breaker_settings,
        )
        .await
    }

    /// Forward the request to the chosen instance, retrying once against a
    /// different instance for idempotent methods on transport errors.
    async fn forward(
        &self,
        req: Request<AxumBody>,
        route: &Arc<Route>,
        instance_url: &str,
        client_addr: Option<SocketAddr>,
        permit: BreakerPermit,
        breaker_settings: &BreakerSettings,
    ) -> DispatchResult<Response<AxumBody>> {
        let service = route.service.as_str();
        let (mut parts, body) = req.into_parts();

        // Request filters, in route order.
        for filter in &route.filters {
            filter.apply_request(&mut parts.headers);
        }
        let mut forward_path = parts.uri.path().to_string();
        for filter in &route.filters {
            if let Some(rewritten) = filter.rewrite_path(&forward_path) {
                forward_path = rewritten;
            }
        }
        let query = parts
            .uri
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();

        append_forwarding_headers(&mut parts.headers, &parts.uri, client_addr);

        // GET/HEAD carry no body, so a retry can rebuild the request from
        // the mutated parts alone.
        let idempotent = parts.method == Method::GET || parts.method == Method::HEAD;
        let retry_template =
            idempotent.then(|| (parts.method.clone(), parts.headers.clone()));

        let upstream_uri =
            build_upstream_uri(instance_url, &forward_path, &query, service)?;
        parts.uri = upstream_uri;
        let upstream_req = Request::from_parts(parts, body);

        let started = Instant::now();
        let timer = crate::metrics::UpstreamTimer::new(service);
        let attempt = tokio::time::timeout(
            route.timeout,
            self.http_client.send_request(upstream_req),
        )
        .await;
        drop(timer);

        match attempt {
            // Timed out: the in-flight call is abandoned, counted as a
            // failure, and never retried.
            Err(_) => {
                self.record(service, permit, Outcome::Failure, breaker_settings)
                    .await;
                crate::metrics::increment_upstream_request(service, "timeout");
                tracing::warn!(
                    service,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "upstream call timed out"
                );
                Err(DispatchError::UpstreamTimeout {
                    service: service.to_string(),
                    timeout: route.timeout,
                })
            }
            Ok(Ok(response)) => {
                self.finish(route, service, permit, breaker_settings, response)
                    .await
            }
            Ok(Err(transport_error)) => {
                tracing::warn!(service, url = instance_url, error = %transport_error, "upstream transport error");
                crate::metrics::increment_upstream_request(service, "transport_error");

                let Some((method, headers)) = retry_template else {
                    self.record(service, permit, Outcome::Failure, breaker_settings)
                        .await;
                    return Err(DispatchError::UpstreamTransport {
                        service: service.to_string(),
                        source: transport_error,
                    });
                };

                // Exactly one retry, and only against a different instance.
                let alternate = self
                    .registry
                    .pick_excluding(service, Some(instance_url))
                    .ok()
                    .filter(|alt| alt.url() != instance_url);

                let Some(alternate) = alternate else {
                    self.record(service, permit, Outcome::Failure, breaker_settings)
                        .await;
                    return Err(DispatchError::UpstreamTransport {
                        service: service.to_string(),
                        source: transport_error,
                    });
                };

                tracing::debug!(service, retry_url = alternate.url(), "retrying idempotent request");
                self.retry(
                    route,
                    service,
                    method,
                    headers,
                    &forward_path,
                    &query,
                    alternate.url(),
                    permit,
                    breaker_settings,
                )
                .await
            }
        }
    }

    /// Second (and final) attempt for an idempotent request.
    #[allow(clippy::too_many_arguments)]
    async fn retry(
        &self,
        route: &Arc<Route>,
        service: &str,
        method: Method,
        headers: HeaderMap,
        forward_path: &str,
        query: &str,
        instance_url: &str,
        permit: BreakerPermit,
        breaker_settings: &BreakerSettings,
    ) -> DispatchResult<Response<AxumBody>> {
        let uri = build_upstream_uri(instance_url, forward_path, query, service)?;
        let mut retry_req = Request::builder()
            .method(method)
            .uri(uri)
            .body(AxumBody::empty())
            .map_err(|e| DispatchError::UpstreamTransport {
                service: service.to_string(),
                source: crate::ports::http_client::HttpClientError::InvalidRequest(e.to_string()),
            })?;
        *retry_req.headers_mut() = headers;

        let timer = crate::metrics::UpstreamTimer::new(service);
        let attempt =
            tokio::time::timeout(route.timeout, self.http_client.send_request(retry_req)).await;
        drop(timer);

        match attempt {
            Err(_) => {
                self.record(service, permit, Outcome::Failure, breaker_settings)
                    .await;
                crate::metrics::increment_upstream_request(service, "timeout");
                Err(DispatchError::UpstreamTimeout {
                    service: service.to_string(),
                    timeout: route.timeout,
                })
            }
            Ok(Ok(response)) => {
                self.finish(route, service, permit, breaker_settings, response)
                    .await
            }
            Ok(Err(transport_error)) => {
                tracing::warn!(service, url = instance_url, error = %transport_error, "retry failed");
                crate::metrics::increment_upstream_request(service, "transport_error");
                self.record(service, permit, Outcome::Failure, breaker_settings)
                    .await;
                Err(DispatchError::UpstreamTransport {
                    service: service.to_string(),
                    source: transport_error,
                })
            }
        }
    }

    /// Record the outcome for a relayed response and apply response filters.
    /// 5xx responses count against the breaker but are still relayed verbatim.
    async fn finish(
        &self,
        route: &Arc<Route>,
        service: &str,
        permit: BreakerPermit,
        breaker_settings: &BreakerSettings,
        mut response: Response<AxumBody>,
    ) -> DispatchResult<Response<AxumBody>> {
        let outcome = if response.status().is_server_error() {
            Outcome::Failure
        } else {
            Outcome::Success
        };
        self.record(service, permit, outcome, breaker_settings).await;
        crate::metrics::increment_upstream_request(service, response.status().as_str());

        for filter in &route.filters {
            filter.apply_response(response.headers_mut());
        }
        Ok(response)
    }

    async fn record(
        &self,
        service: &str,
        permit: BreakerPermit,
        outcome: Outcome,
        breaker_settings: &BreakerSettings,
    ) {
        self.breakers
            .record(service, permit, outcome, breaker_settings, Instant::now())
            .await;
    }
}

fn map_registry_error(error: RegistryError) -> DispatchError {
    match error {
        RegistryError::NoHealthyInstance(service) => {
            DispatchError::NoHealthyInstance { service }
        }
        RegistryError::UnknownService(service) => {
            // Startup validation ties every route to a registered service;
            // reaching this means table and registry diverged mid-reload.
            tracing::error!(service, "route resolved to an unregistered service");
            DispatchError::UnknownService { service }
        }
    }
}

fn build_upstream_uri(
    instance_url: &str,
    path: &str,
    query: &str,
    service: &str,
) -> DispatchResult<Uri> {
    format!("{instance_url}{path}{query}")
        .parse::<Uri>()
        .map_err(|e| DispatchError::UpstreamTransport {
            service: service.to_string(),
            source: crate::ports::http_client::HttpClientError::InvalidRequest(e.to_string()),
        })
}

/// Derive the per-client rate-limit key: configured header first, then the
/// usual proxy headers, then the socket address.
pub fn extract_client_key(
    headers: &HeaderMap,
    client_addr: Option<SocketAddr>,
    client_key_header: &str,
) -> String {
    if let Some(value) = headers.get(client_key_header).and_then(|v| v.to_str().ok()) {
        return value.to_string();
    }

    if let Some(forwarded_for) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first_hop) = forwarded_for.split(',').next() {
            let first_hop = first_hop.trim();
            if !first_hop.is_empty() {
                return first_hop.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.to_string();
    }

    client_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn append_forwarding_headers(
    headers: &mut HeaderMap,
    original_uri: &Uri,
    client_addr: Option<SocketAddr>,
) {
    if let Some(addr) = client_addr {
        let client_ip = addr.ip().to_string();
        let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {client_ip}"),
            None => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert("x-forwarded-for", value);
        }
    }

    if let Ok(proto) = HeaderValue::from_str("http") {
        headers.insert("x-forwarded-proto", proto);
    }
    if let Some(host) = original_uri.host() {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("x-forwarded-host", value);
        }
    } else if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert("x-forwarded-host", host);
    }
}
