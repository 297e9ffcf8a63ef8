// Route precedence and hot-swap behavior through the public API.
use std::sync::Arc;

use http::Method;
use ladle::{
    config::models::{GatewayConfig, InstanceConfig, RouteDefinition, ServiceConfig},
    core::{RouteTable, RouterHandle},
};

fn route(id: &str, pattern: &str, service: &str) -> RouteDefinition {
    RouteDefinition {
        id: id.to_string(),
        pattern: pattern.to_string(),
        service: service.to_string(),
        methods: None,
        filters: Vec::new(),
        rate_limit: None,
        timeout: None,
    }
}

fn service(url: &str) -> ServiceConfig {
    ServiceConfig {
        instances: vec![InstanceConfig {
            url: url.to_string(),
            weight: 1,
        }],
        breaker: None,
        health_path: None,
    }
}

fn config_with_routes(routes: Vec<RouteDefinition>) -> GatewayConfig {
    let mut builder = GatewayConfig::builder().listen_addr("127.0.0.1:8080");
    for r in routes {
        builder = builder.route(r);
    }
    builder
        .service("user-service", service("http://users-1:8080"))
        .service("recipe-service", service("http://recipes-1:8080"))
        .build()
        .expect("config builds")
}

#[test]
fn static_route_wins_over_overlapping_catch_all() {
    let table = RouteTable::build(&config_with_routes(vec![
        route("users-all", "/api/v1/users/**", "user-service"),
        route("users-profile", "/api/v1/users/profile", "user-service"),
    ]))
    .expect("table builds");

    // The exact static pattern takes the request, not the wildcard.
    let matched = table
        .matches("/api/v1/users/profile", &Method::GET)
        .expect("matches");
    assert_eq!(matched.id, "users-profile");

    // Everything else under the prefix falls through to the catch-all.
    for path in [
        "/api/v1/users",
        "/api/v1/users/42",
        "/api/v1/users/42/preferences/diet",
    ] {
        let matched = table.matches(path, &Method::GET).expect("matches");
        assert_eq!(matched.id, "users-all", "path {path}");
    }
}

#[test]
fn single_segment_wildcard_loses_to_static_segment() {
    let table = RouteTable::build(&config_with_routes(vec![
        route("versioned", "/api/*/recipes/**", "recipe-service"),
        route("v1-pinned", "/api/v1/recipes/**", "recipe-service"),
    ]))
    .expect("table builds");

    assert_eq!(
        table
            .matches("/api/v1/recipes/42", &Method::GET)
            .unwrap()
            .id,
        "v1-pinned"
    );
    assert_eq!(
        table
            .matches("/api/v2/recipes/42", &Method::GET)
            .unwrap()
            .id,
        "versioned"
    );
}

#[test]
fn router_handle_swaps_tables_atomically() {
    let handle = Arc::new(RouterHandle::new(
        RouteTable::build(&config_with_routes(vec![route(
            "recipes",
            "/api/v1/recipes/**",
            "recipe-service",
        )]))
        .expect("table builds"),
    ));

    // Old table keeps serving until the swap lands.
    let snapshot = handle.snapshot();
    handle.swap(
        RouteTable::build(&config_with_routes(vec![route(
            "users",
            "/api/v1/users/**",
            "user-service",
        )]))
        .expect("table builds"),
    );

    // The pre-swap snapshot still matches the old pattern.
    assert!(snapshot.matches("/api/v1/recipes/1", &Method::GET).is_ok());

    // New lookups see only the new table.
    assert!(handle.matches("/api/v1/recipes/1", &Method::GET).is_err());
    assert!(handle.matches("/api/v1/users/1", &Method::GET).is_ok());
}

#[test]
fn conflicting_route_table_is_rejected_at_build() {
    let result = RouteTable::build(&config_with_routes(vec![
        route("a", "/api/v1/recipes/**", "recipe-service"),
        route("b", "/api/v1/recipes/**", "recipe-service"),
    ]));
    assert!(result.is_err());
}
