use std::{collections::HashSet, net::SocketAddr};

use eyre::Result;
use url::Url;

use crate::config::models::{
    BreakerConfig, GatewayConfig, HealthCheckConfig, RouteDefinition, ServiceConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator.
///
/// Validation failures are fatal at startup; at reload time the caller keeps
/// the previous good configuration instead.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        } else {
            for route in &config.routes {
                if let Err(mut route_errors) = Self::validate_route(route, config) {
                    errors.append(&mut route_errors);
                }
            }
            errors.extend(Self::check_route_conflicts(&config.routes));
        }

        if config.services.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services".to_string(),
            });
        } else {
            for (name, service) in &config.services {
                if let Err(mut service_errors) = Self::validate_service(name, service) {
                    errors.append(&mut service_errors);
                }
            }
        }

        if let Err(mut dispatch_errors) = Self::validate_dispatch(config) {
            errors.append(&mut dispatch_errors);
        }

        if let Err(mut health_errors) = Self::validate_health_check(&config.health_check) {
            errors.append(&mut health_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_route(
        route: &RouteDefinition,
        config: &GatewayConfig,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if route.id.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route id for pattern '{}'", route.pattern),
            });
        }

        if let Err(message) = Self::validate_pattern(&route.pattern) {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{}' pattern", route.id),
                message,
            });
        }

        if !config.services.contains_key(&route.service) {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{}' service", route.id),
                message: format!("unknown service '{}'", route.service),
            });
        }

        for filter_name in &route.filters {
            if !config.filters.contains_key(filter_name) {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{}' filters", route.id),
                    message: format!("unknown filter '{filter_name}'"),
                });
            }
        }

        if let Some(methods) = &route.methods {
            for method in methods {
                if method.parse::<http::Method>().is_err() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("route '{}' methods", route.id),
                        message: format!("invalid HTTP method '{method}'"),
                    });
                }
            }
        }

        if let Some(limit) = &route.rate_limit {
            if limit.capacity == 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{}' rate_limit.capacity", route.id),
                    message: "capacity must be greater than 0".to_string(),
                });
            }
            if limit.refill_per_sec < 0.0 || !limit.refill_per_sec.is_finite() {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{}' rate_limit.refill_per_sec", route.id),
                    message: "refill_per_sec must be a finite non-negative number".to_string(),
                });
            }
        }

        if let Err(message) = route.timeout_duration() {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{}' timeout", route.id),
                message,
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Check pattern syntax: absolute path, `*` only as a full segment,
    /// `**` only as the final segment.
    fn validate_pattern(pattern: &str) -> Result<(), String> {
        if !pattern.starts_with('/') {
            return Err("patterns must start with '/'".to_string());
        }

        let segments: Vec<&str> = pattern[1..].split('/').collect();
        for (i, segment) in segments.iter().enumerate() {
            let is_last = i == segments.len() - 1;
            match *segment {
                "**" if !is_last => {
                    return Err("'**' is only allowed as the final segment".to_string());
                }
                "**" | "*" => {}
                s if s.contains('*') => {
                    return Err(format!(
                        "segment '{s}' mixes literals and wildcards; use '*' or '**' alone"
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_service(name: &str, service: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if service.instances.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{name}' instances"),
                message: "services must have at least one instance".to_string(),
            });
        }

        for (i, instance) in service.instances.iter().enumerate() {
            match Url::parse(&instance.url) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                Ok(url) => errors.push(ValidationError::InvalidField {
                    field: format!("service '{name}' instance {}", i + 1),
                    message: format!("unsupported scheme '{}'", url.scheme()),
                }),
                Err(e) => errors.push(ValidationError::InvalidField {
                    field: format!("service '{name}' instance {}", i + 1),
                    message: format!("invalid URL '{}': {e}", instance.url),
                }),
            }

            if instance.weight == 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("service '{name}' instance {}", i + 1),
                    message: "weight must be at least 1".to_string(),
                });
            }
        }

        if let Some(breaker) = &service.breaker {
            errors.extend(Self::validate_breaker(name, breaker));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_breaker(service: &str, breaker: &BreakerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if breaker.window_size == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{service}' breaker.window_size"),
                message: "window_size must be at least 1".to_string(),
            });
        }
        if breaker.min_samples == 0 || breaker.min_samples > breaker.window_size {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{service}' breaker.min_samples"),
                message: "min_samples must be between 1 and window_size".to_string(),
            });
        }
        if !(breaker.failure_ratio > 0.0 && breaker.failure_ratio <= 1.0) {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{service}' breaker.failure_ratio"),
                message: "failure_ratio must be in (0, 1]".to_string(),
            });
        }
        if let Err(message) = breaker.cooldown_duration() {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{service}' breaker.cooldown"),
                message,
            });
        }

        errors
    }

    fn validate_dispatch(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        for (field, result) in [
            (
                "dispatch.default_timeout",
                config.dispatch.default_timeout_duration(),
            ),
            (
                "dispatch.rate_limit_idle_window",
                config.dispatch.idle_window_duration(),
            ),
            (
                "dispatch.rate_limit_sweep_interval",
                config.dispatch.sweep_interval_duration(),
            ),
        ] {
            if let Err(message) = result {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message,
                });
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_health_check(config: &HealthCheckConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if config.enabled {
            if config.interval_secs == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "health_check.interval_secs".to_string(),
                    message: "interval must be at least 1 second".to_string(),
                });
            }
            if config.unhealthy_threshold == 0 || config.healthy_threshold == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "health_check thresholds".to_string(),
                    message: "thresholds must be at least 1".to_string(),
                });
            }
            if !config.path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: "health_check.path".to_string(),
                    message: "probe path must start with '/'".to_string(),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Duplicate ids or duplicate patterns make the table ambiguous.
    /// Structural conflicts between distinct patterns are caught when the
    /// matcher is compiled.
    fn check_route_conflicts(routes: &[RouteDefinition]) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen_ids = HashSet::new();
        let mut seen_patterns = HashSet::new();

        for route in routes {
            if !seen_ids.insert(route.id.as_str()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("duplicate route id '{}'", route.id),
                });
            }
            if !seen_patterns.insert(route.pattern.as_str()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("duplicate route pattern '{}'", route.pattern),
                });
            }
        }

        errors
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| format!("  {}. {e}", i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{InstanceConfig, RateLimitConfig};

    fn valid_config() -> GatewayConfig {
        GatewayConfig::builder()
            .listen_addr("127.0.0.1:8080")
            .route(RouteDefinition {
                id: "recipes".to_string(),
                pattern: "/api/v1/recipes/**".to_string(),
                service: "recipe-service".to_string(),
                methods: Some(vec!["GET".to_string(), "POST".to_string()]),
                filters: Vec::new(),
                rate_limit: Some(RateLimitConfig {
                    capacity: 200,
                    refill_per_sec: 100.0,
                }),
                timeout: Some("10s".to_string()),
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
            .expect("valid config")
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(GatewayConfigValidator::validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_bad_listen_addr() {
        let mut config = valid_config();
        config.listen_addr = "not-an-address".to_string();
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_unknown_service_rejected() {
        let mut config = valid_config();
        config.routes[0].service = "nonexistent".to_string();
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_unknown_filter_rejected() {
        let mut config = valid_config();
        config.routes[0].filters = vec!["no-such-filter".to_string()];
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_interior_catch_all_rejected() {
        let mut config = valid_config();
        config.routes[0].pattern = "/api/**/recipes".to_string();
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_mixed_wildcard_segment_rejected() {
        let mut config = valid_config();
        config.routes[0].pattern = "/api/v*/recipes".to_string();
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_route_ids_rejected() {
        let mut config = valid_config();
        let mut dup = config.routes[0].clone();
        dup.pattern = "/api/v2/recipes/**".to_string();
        config.routes.push(dup);
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = valid_config();
        config.routes[0].rate_limit = Some(RateLimitConfig {
            capacity: 0,
            refill_per_sec: 1.0,
        });
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_bad_instance_url_rejected() {
        let mut config = valid_config();
        config
            .services
            .get_mut("recipe-service")
            .unwrap()
            .instances[0]
            .url = "ftp://recipes-1:8080".to_string();
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_breaker_bounds() {
        let mut config = valid_config();
        config.services.get_mut("recipe-service").unwrap().breaker = Some(BreakerConfig {
            window_size: 5,
            failure_ratio: 0.5,
            min_samples: 10, // larger than window
            cooldown: "30s".to_string(),
        });
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }
}
