//! Upstream instance registry.
//!
//! Tracks the live instance pool for every logical service plus each
//! instance's health state. Selection is round-robin over the healthy
//! subset, weight-aware when weights are configured. Unhealthy and draining
//! instances stay registered so the health checker can bring them back (or
//! an operator can finish draining them), they are just never selected.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering},
    },
};

use scc::HashMap;
use serde::Serialize;
use thiserror::Error;

use crate::config::models::GatewayConfig;

const HEALTH_HEALTHY: u8 = 0;
const HEALTH_UNHEALTHY: u8 = 1;
const HEALTH_DRAINING: u8 = 2;

/// Health state of one upstream instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    /// Taken out of rotation by an operator; probes keep running but never
    /// flip a draining instance back to healthy.
    Draining,
}

impl HealthState {
    fn from_u8(value: u8) -> Self {
        match value {
            HEALTH_UNHEALTHY => HealthState::Unhealthy,
            HEALTH_DRAINING => HealthState::Draining,
            _ => HealthState::Healthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HealthState::Healthy => HEALTH_HEALTHY,
            HealthState::Unhealthy => HEALTH_UNHEALTHY,
            HealthState::Draining => HEALTH_DRAINING,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
            HealthState::Draining => write!(f, "draining"),
        }
    }
}

/// Errors from instance resolution.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    /// The logical service name is not registered at all.
    #[error("service '{0}' is not registered")]
    UnknownService(String),

    /// The service exists but no instance is currently selectable.
    #[error("no healthy instance for service '{0}'")]
    NoHealthyInstance(String),
}

/// One registered upstream instance with its runtime health state.
#[derive(Debug)]
pub struct UpstreamInstance {
    service: String,
    url: String,
    weight: u32,
    health: AtomicU8,
    pub consecutive_successes: AtomicU32,
    pub consecutive_failures: AtomicU32,
}

impl UpstreamInstance {
    pub fn new(service: &str, url: &str, weight: u32) -> Self {
        Self {
            service: service.to_string(),
            url: url.to_string(),
            weight,
            health: AtomicU8::new(HEALTH_HEALTHY),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    fn is_selectable(&self) -> bool {
        self.health.load(Ordering::Acquire) == HEALTH_HEALTHY
    }

    /// Flip the instance to healthy and reset the failure streak.
    /// A draining instance never becomes healthy again through this path.
    pub fn mark_healthy(&self) {
        if self.health() == HealthState::Draining {
            return;
        }
        self.health.store(HEALTH_HEALTHY, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        crate::metrics::set_instance_health(&self.url, true);
    }

    /// Flip the instance to unhealthy and reset the success streak.
    pub fn mark_unhealthy(&self) {
        if self.health() == HealthState::Draining {
            return;
        }
        self.health.store(HEALTH_UNHEALTHY, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        crate::metrics::set_instance_health(&self.url, false);
    }

    /// Take the instance out of rotation.
    pub fn set_draining(&self) {
        self.health.store(HEALTH_DRAINING, Ordering::Release);
        crate::metrics::set_instance_health(&self.url, false);
    }

    fn restore(&self, health: HealthState, successes: u32, failures: u32) {
        self.health.store(health.as_u8(), Ordering::Release);
        self.consecutive_successes.store(successes, Ordering::Release);
        self.consecutive_failures.store(failures, Ordering::Release);
    }
}

struct ServiceEntry {
    instances: Vec<Arc<UpstreamInstance>>,
    cursor: AtomicUsize,
    health_path: Option<String>,
}

/// Registry of all upstream services and their instances.
///
/// The service map uses per-entry synchronization; picks for unrelated
/// services never contend. Instance health lives in atomics so the health
/// checker and concurrent picks do not block each other.
pub struct UpstreamRegistry {
    services: HashMap<String, ServiceEntry>,
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Replace the registered services with the configured set.
    ///
    /// Health state and probe counters carry over for instances whose URL is
    /// unchanged; everything else starts healthy. Services absent from the
    /// new configuration are removed.
    pub async fn apply(&self, config: &GatewayConfig) {
        let mut previous: std::collections::HashMap<(String, String), (HealthState, u32, u32)> =
            std::collections::HashMap::new();
        self.services.scan(|name, entry| {
            for instance in &entry.instances {
                previous.insert(
                    (name.clone(), instance.url().to_string()),
                    (
                        instance.health(),
                        instance.consecutive_successes.load(Ordering::Acquire),
                        instance.consecutive_failures.load(Ordering::Acquire),
                    ),
                );
            }
        });

        for (name, service_config) in &config.services {
            let instances: Vec<Arc<UpstreamInstance>> = service_config
                .instances
                .iter()
                .map(|instance_config| {
                    let instance = Arc::new(UpstreamInstance::new(
                        name,
                        &instance_config.url,
                        instance_config.weight,
                    ));
                    if let Some((health, successes, failures)) =
                        previous.get(&(name.clone(), instance_config.url.clone()))
                    {
                        instance.restore(*health, *successes, *failures);
                    }
                    instance
                })
                .collect();

            let entry = ServiceEntry {
                instances,
                cursor: AtomicUsize::new(0),
                health_path: service_config.health_path.clone(),
            };

            match self.services.entry_async(name.clone()).await {
                scc::hash_map::Entry::Occupied(mut occupied) => {
                    *occupied.get_mut() = entry;
                }
                scc::hash_map::Entry::Vacant(vacant) => {
                    vacant.insert_entry(entry);
                }
            }
        }

        let known: std::collections::HashSet<&String> = config.services.keys().collect();
        self.services
            .retain_async(|name, _| known.contains(name))
            .await;
    }

    /// All instances of a service, regardless of health.
    pub fn resolve(&self, service: &str) -> Result<Vec<Arc<UpstreamInstance>>, RegistryError> {
        self.services
            .read(service, |_, entry| entry.instances.clone())
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))
    }

    /// Pick one healthy instance by (weighted) round-robin.
    pub fn pick(&self, service: &str) -> Result<Arc<UpstreamInstance>, RegistryError> {
        self.pick_excluding(service, None)
    }

    /// Pick one healthy instance, skipping `exclude_url` if another healthy
    /// instance exists. Used by the idempotent retry path, which must not
    /// retry against the instance that just failed.
    pub fn pick_excluding(
        &self,
        service: &str,
        exclude_url: Option<&str>,
    ) -> Result<Arc<UpstreamInstance>, RegistryError> {
        let picked = self
            .services
            .read(service, |_, entry| {
                let mut selectable: Vec<&Arc<UpstreamInstance>> = entry
                    .instances
                    .iter()
                    .filter(|i| i.is_selectable())
                    .collect();

                if selectable.len() > 1 {
                    if let Some(excluded) = exclude_url {
                        selectable.retain(|i| i.url() != excluded);
                    }
                }

                if selectable.is_empty() {
                    return None;
                }

                let ticket = entry.cursor.fetch_add(1, Ordering::Relaxed);
                let total_weight: usize =
                    selectable.iter().map(|i| i.weight() as usize).sum();

                if total_weight == selectable.len() {
                    // All weights are 1: plain round-robin.
                    return Some(selectable[ticket % selectable.len()].clone());
                }

                // Weighted round-robin: walk cumulative weights.
                let mut slot = ticket % total_weight;
                for instance in &selectable {
                    let weight = instance.weight() as usize;
                    if slot < weight {
                        return Some((*instance).clone());
                    }
                    slot -= weight;
                }
                selectable.first().map(|i| (*i).clone())
            })
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))?;

        picked.ok_or_else(|| RegistryError::NoHealthyInstance(service.to_string()))
    }

    /// Move an instance into the draining state. Returns false when the
    /// service or URL is unknown.
    pub fn set_draining(&self, service: &str, url: &str) -> bool {
        self.services
            .read(service, |_, entry| {
                match entry.instances.iter().find(|i| i.url() == url) {
                    Some(instance) => {
                        instance.set_draining();
                        tracing::info!(service, url, "instance set to draining");
                        true
                    }
                    None => false,
                }
            })
            .unwrap_or(false)
    }

    /// Health probe path for a service (override or the global default).
    pub fn health_path_for(&self, service: &str, default_path: &str) -> String {
        self.services
            .read(service, |_, entry| entry.health_path.clone())
            .flatten()
            .unwrap_or_else(|| default_path.to_string())
    }

    /// Snapshot of every registered instance (health checker, status endpoint).
    pub fn all_instances(&self) -> Vec<Arc<UpstreamInstance>> {
        let mut instances = Vec::new();
        self.services.scan(|_, entry| {
            instances.extend(entry.instances.iter().cloned());
        });
        instances
    }

    /// Number of registered services.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// (healthy, total) instance counts across all services.
    pub fn instance_counts(&self) -> (usize, usize) {
        let mut healthy = 0;
        let mut total = 0;
        self.services.scan(|_, entry| {
            for instance in &entry.instances {
                total += 1;
                if instance.is_selectable() {
                    healthy += 1;
                }
            }
        });
        (healthy, total)
    }
}

impl Default for UpstreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
