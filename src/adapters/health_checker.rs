use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use eyre::Result;
use tokio::time::sleep;

use crate::{
    config::models::HealthCheckConfig,
    core::registry::{HealthState, UpstreamInstance, UpstreamRegistry},
    ports::http_client::HttpClient,
};

/// Background prober that keeps registry health state current.
///
/// Every instance is probed each cycle, including unhealthy and draining
/// ones; consecutive-success and consecutive-failure thresholds decide when
/// an instance flips state. Draining instances are observed but never
/// flipped back to healthy.
pub struct HealthChecker {
    registry: Arc<UpstreamRegistry>,
    http_client: Arc<dyn HttpClient>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        http_client: Arc<dyn HttpClient>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            registry,
            http_client,
            config,
        }
    }

    /// Run the health checker loop
    pub async fn run(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("Health checking is disabled");
            return Ok(());
        }

        let interval = Duration::from_secs(self.config.interval_secs);

        tracing::info!(
            "Starting health checker with interval: {}s, timeout: {}s, default path: {}",
            self.config.interval_secs,
            self.config.timeout_secs,
            self.config.path
        );

        loop {
            // Sleep at the beginning to allow the server to start up
            sleep(interval).await;

            self.run_cycle().await;
        }
    }

    /// Probe every registered instance once.
    pub async fn run_cycle(&self) {
        let instances = self.registry.all_instances();
        tracing::debug!(count = instances.len(), "running health checks");

        for instance in instances {
            let probe_path = self
                .registry
                .health_path_for(instance.service(), &self.config.path);
            let probe_url = format!("{}{probe_path}", instance.url());

            match self
                .http_client
                .health_check(&probe_url, self.config.timeout_secs)
                .await
            {
                Ok(true) => self.handle_probe_success(&instance),
                Ok(false) => {
                    self.handle_probe_failure(&instance, "instance reported unhealthy");
                }
                Err(err) => {
                    self.handle_probe_failure(&instance, &format!("probe error: {err}"));
                }
            }
        }
    }

    /// Handle successful health probe
    fn handle_probe_success(&self, instance: &UpstreamInstance) {
        let successes = instance.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        instance.consecutive_failures.store(0, Ordering::Release);

        tracing::debug!(
            url = instance.url(),
            successes,
            "health probe succeeded"
        );

        if successes >= self.config.healthy_threshold
            && instance.health() == HealthState::Unhealthy
        {
            tracing::info!(
                service = instance.service(),
                url = instance.url(),
                successes,
                "instance is now HEALTHY"
            );
            instance.mark_healthy();
        }
    }

    /// Handle failed health probe
    fn handle_probe_failure(&self, instance: &UpstreamInstance, reason: &str) {
        let failures = instance.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        instance.consecutive_successes.store(0, Ordering::Release);

        tracing::info!(
            url = instance.url(),
            reason,
            failures,
            threshold = self.config.unhealthy_threshold,
            "health probe failed"
        );

        if failures >= self.config.unhealthy_threshold
            && instance.health() == HealthState::Healthy
        {
            tracing::warn!(
                service = instance.service(),
                url = instance.url(),
                failures,
                reason,
                "instance is now UNHEALTHY"
            );
            instance.mark_unhealthy();
        }
    }

    /// (healthy, total) summary across registered instances.
    pub fn health_summary(&self) -> (usize, usize) {
        self.registry.instance_counts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::models::{GatewayConfig, InstanceConfig, RouteDefinition, ServiceConfig},
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    // Mock HTTP client for testing
    struct MockHttpClient {
        should_succeed: bool,
    }

    impl MockHttpClient {
        fn new(should_succeed: bool) -> Self {
            Self { should_succeed }
        }
    }

    use axum::body::Body as AxumBody;
    #[async_trait::async_trait]
    impl HttpClient for MockHttpClient {
        async fn send_request(
            &self,
            _req: hyper::Request<AxumBody>,
        ) -> HttpClientResult<hyper::Response<AxumBody>> {
            Err(HttpClientError::ConnectionError(
                "not used in tests".to_string(),
            ))
        }

        async fn health_check(
            &self,
            _url: &str,
            _timeout_secs: u64,
        ) -> HttpClientResult<bool> {
            Ok(self.should_succeed)
        }
    }

    fn test_health_config() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_secs: 30,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            timeout_secs: 5,
        }
    }

    async fn test_registry() -> Arc<UpstreamRegistry> {
        let config = GatewayConfig::builder()
            .listen_addr("127.0.0.1:8080")
            .route(RouteDefinition {
                id: "recipes".to_string(),
                pattern: "/api/v1/recipes/**".to_string(),
                service: "recipe-service".to_string(),
                methods: None,
                filters: Vec::new(),
                rate_limit: None,
                timeout: None,
            })
            .service(
                "recipe-service",
                ServiceConfig {
                    instances: vec![InstanceConfig {
                        url: "http://recipes-1:8080".to_string(),
                        weight: 1,
                    }],
                    breaker: None,
                    health_path: None,
                },
            )
            .build()
            .expect("config builds");

        let registry = Arc::new(UpstreamRegistry::new());
        registry.apply(&config).await;
        registry
    }

    fn checker_with(
        registry: Arc<UpstreamRegistry>,
        should_succeed: bool,
    ) -> HealthChecker {
        HealthChecker::new(
            registry,
            Arc::new(MockHttpClient::new(should_succeed)),
            test_health_config(),
        )
    }

    #[tokio::test]
    async fn test_probe_success_recovers_after_threshold() {
        let registry = test_registry().await;
        let checker = checker_with(registry.clone(), true);
        let instance = registry.resolve("recipe-service").unwrap()[0].clone();

        instance.mark_unhealthy();
        assert_eq!(instance.health(), HealthState::Unhealthy);

        // First success is below the healthy threshold of 2.
        checker.handle_probe_success(&instance);
        assert_eq!(instance.health(), HealthState::Unhealthy);

        checker.handle_probe_success(&instance);
        assert_eq!(instance.health(), HealthState::Healthy);
        assert_eq!(instance.consecutive_failures.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_demotes_after_threshold() {
        let registry = test_registry().await;
        let checker = checker_with(registry.clone(), false);
        let instance = registry.resolve("recipe-service").unwrap()[0].clone();

        checker.handle_probe_failure(&instance, "probe error");
        checker.handle_probe_failure(&instance, "probe error");
        assert_eq!(instance.health(), HealthState::Healthy);

        // Third failure crosses the unhealthy threshold of 3.
        checker.handle_probe_failure(&instance, "probe error");
        assert_eq!(instance.health(), HealthState::Unhealthy);
        assert_eq!(instance.consecutive_successes.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_draining_instance_stays_draining_under_success() {
        let registry = test_registry().await;
        let checker = checker_with(registry.clone(), true);
        let instance = registry.resolve("recipe-service").unwrap()[0].clone();

        instance.set_draining();
        for _ in 0..5 {
            checker.handle_probe_success(&instance);
        }
        assert_eq!(instance.health(), HealthState::Draining);
    }

    #[tokio::test]
    async fn test_run_cycle_probes_all_instances() {
        let registry = test_registry().await;
        let checker = checker_with(registry.clone(), false);

        for _ in 0..3 {
            checker.run_cycle().await;
        }

        let (healthy, total) = checker.health_summary();
        assert_eq!(total, 1);
        assert_eq!(healthy, 0);
    }
}
