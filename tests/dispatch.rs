// End-to-end dispatch pipeline tests against a scripted upstream.
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body;
use http::{Method, StatusCode};
use hyper::{Request, Response};
use ladle::{
    GatewayDispatcher,
    config::models::{
        BreakerConfig, GatewayConfig, InstanceConfig, RateLimitConfig, RouteDefinition,
        ServiceConfig,
    },
    core::DispatchError,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

#[derive(Clone, Copy)]
enum Script {
    Respond(u16),
    TransportError,
}

/// Scripted upstream: per-instance behavior, call log for assertions.
struct ScriptedUpstream {
    default_script: Script,
    per_instance: Mutex<std::collections::HashMap<String, Script>>,
    calls: AtomicUsize,
    called_urls: Mutex<Vec<String>>,
}

impl ScriptedUpstream {
    fn new(default_script: Script) -> Arc<Self> {
        Arc::new(Self {
            default_script,
            per_instance: Mutex::new(std::collections::HashMap::new()),
            calls: AtomicUsize::new(0),
            called_urls: Mutex::new(Vec::new()),
        })
    }

    fn script_instance(&self, origin: &str, script: Script) {
        self.per_instance
            .lock()
            .unwrap()
            .insert(origin.to_string(), script);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn called_urls(&self) -> Vec<String> {
        self.called_urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedUpstream {
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let origin = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri().authority().map(|a| a.as_str()).unwrap_or("")
        );
        self.called_urls.lock().unwrap().push(origin.clone());

        let script = self
            .per_instance
            .lock()
            .unwrap()
            .get(&origin)
            .copied()
            .unwrap_or(self.default_script);

        match script {
            Script::Respond(status) => Ok(Response::builder()
                .status(StatusCode::from_u16(status).unwrap())
                .body(Body::from("scripted"))
                .unwrap()),
            Script::TransportError => Err(HttpClientError::ConnectionError(format!(
                "connection refused: {origin}"
            ))),
        }
    }

    async fn health_check(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
        Ok(true)
    }
}

fn recipes_config(rate_limit: Option<RateLimitConfig>, breaker: Option<BreakerConfig>) -> GatewayConfig {
    GatewayConfig::builder()
        .listen_addr("127.0.0.1:8080")
        .route(RouteDefinition {
            id: "recipes".to_string(),
            pattern: "/api/v1/recipes/**".to_string(),
            service: "recipe-service".to_string(),
            methods: None,
            filters: Vec::new(),
            rate_limit,
            timeout: Some("1s".to_string()),
        })
        .service(
            "recipe-service",
            ServiceConfig {
                instances: vec![
                    InstanceConfig {
                        url: "http://recipes-1:8080".to_string(),
                        weight: 1,
                    },
                    InstanceConfig {
                        url: "http://recipes-2:8080".to_string(),
                        weight: 1,
                    },
                ],
                breaker,
                health_path: None,
            },
        )
        .build()
        .expect("config builds")
}

fn get(path: &str, client_id: &'static str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .header("x-client-id", client_id)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn third_request_in_window_is_rate_limited() {
    // Capacity 2, no refill: two requests pass, the third from the same
    // client is rejected before any upstream work happens.
    let upstream = ScriptedUpstream::new(Script::Respond(200));
    let dispatcher = GatewayDispatcher::new(
        &recipes_config(
            Some(RateLimitConfig {
                capacity: 2,
                refill_per_sec: 0.0,
            }),
            None,
        ),
        upstream.clone(),
    )
    .await
    .expect("dispatcher builds");

    for i in 0..2 {
        let response = dispatcher
            .dispatch(get("/api/v1/recipes/42", "meal-planner"), None)
            .await
            .unwrap_or_else(|e| panic!("request {i} should pass: {e}"));
        assert_eq!(response.status(), StatusCode::OK);
    }

    let err = dispatcher
        .dispatch(get("/api/v1/recipes/42", "meal-planner"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::RateLimited { .. }));
    assert_eq!(upstream.calls(), 2);

    // A different client still gets through.
    assert!(
        dispatcher
            .dispatch(get("/api/v1/recipes/42", "other-app"), None)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn breaker_trips_then_recovers_through_single_probe() {
    let upstream = ScriptedUpstream::new(Script::Respond(500));
    let dispatcher = GatewayDispatcher::new(
        &recipes_config(
            None,
            Some(BreakerConfig {
                window_size: 10,
                failure_ratio: 0.5,
                min_samples: 4,
                cooldown: "300ms".to_string(),
            }),
        ),
        upstream.clone(),
    )
    .await
    .expect("dispatcher builds");

    // Four 500s fill the window past the threshold.
    for _ in 0..4 {
        let response = dispatcher
            .dispatch(get("/api/v1/recipes/1", "app"), None)
            .await
            .expect("5xx responses are relayed");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    // Open: fail fast with no upstream contact.
    let calls_when_open = upstream.calls();
    let err = dispatcher
        .dispatch(get("/api/v1/recipes/1", "app"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::CircuitOpen { .. }));
    assert_eq!(upstream.calls(), calls_when_open);

    // Upstream recovers; after the cooldown one probe goes through and
    // closes the circuit again.
    upstream.script_instance("http://recipes-1:8080", Script::Respond(200));
    upstream.script_instance("http://recipes-2:8080", Script::Respond(200));
    tokio::time::sleep(Duration::from_millis(350)).await;

    let response = dispatcher
        .dispatch(get("/api/v1/recipes/1", "app"), None)
        .await
        .expect("probe passes");
    assert_eq!(response.status(), StatusCode::OK);

    // Closed again: subsequent requests flow normally.
    let response = dispatcher
        .dispatch(get("/api/v1/recipes/1", "app"), None)
        .await
        .expect("circuit closed");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn idempotent_transport_failure_retries_exactly_once_elsewhere() {
    let upstream = ScriptedUpstream::new(Script::Respond(200));
    upstream.script_instance("http://recipes-1:8080", Script::TransportError);
    let dispatcher = GatewayDispatcher::new(&recipes_config(None, None), upstream.clone())
        .await
        .expect("dispatcher builds");

    let response = dispatcher
        .dispatch(get("/api/v1/recipes/7", "app"), None)
        .await
        .expect("retry should succeed");
    assert_eq!(response.status(), StatusCode::OK);

    let urls = upstream.called_urls();
    assert_eq!(urls.len(), 2, "one attempt plus exactly one retry");
    assert_eq!(urls[0], "http://recipes-1:8080");
    assert_eq!(urls[1], "http://recipes-2:8080");
}

#[tokio::test]
async fn both_instances_failing_is_terminal_after_one_retry() {
    let upstream = ScriptedUpstream::new(Script::TransportError);
    let dispatcher = GatewayDispatcher::new(&recipes_config(None, None), upstream.clone())
        .await
        .expect("dispatcher builds");

    let err = dispatcher
        .dispatch(get("/api/v1/recipes/7", "app"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UpstreamTransport { .. }));
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn non_idempotent_transport_failure_has_no_retry() {
    let upstream = ScriptedUpstream::new(Script::TransportError);
    let dispatcher = GatewayDispatcher::new(&recipes_config(None, None), upstream.clone())
        .await
        .expect("dispatcher builds");

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/recipes")
        .body(Body::from(r#"{"title":"Shakshuka"}"#))
        .unwrap();

    let err = dispatcher.dispatch(req, None).await.unwrap_err();
    assert!(matches!(err, DispatchError::UpstreamTransport { .. }));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn exhausted_pool_is_no_healthy_instance() {
    let upstream = ScriptedUpstream::new(Script::Respond(200));
    let dispatcher = GatewayDispatcher::new(&recipes_config(None, None), upstream.clone())
        .await
        .expect("dispatcher builds");

    for instance in dispatcher.registry().resolve("recipe-service").unwrap() {
        instance.mark_unhealthy();
    }

    let err = dispatcher
        .dispatch(get("/api/v1/recipes/1", "app"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoHealthyInstance { .. }));
    assert_eq!(upstream.calls(), 0);
}
