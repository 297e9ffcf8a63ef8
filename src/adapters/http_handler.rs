use std::{net::SocketAddr, sync::Arc};

use arc_swap::ArcSwap;
use axum::{
    body::Body as AxumBody,
    http::{Method, StatusCode, header},
};
use eyre::{Result, WrapErr};
use hyper::{Request, Response};

use crate::{
    config::models::GatewayConfig,
    core::GatewayDispatcher,
    utils::ConnectionTracker,
};

/// Path prefix for the gateway's own operational endpoints. Everything else
/// goes through the dispatch pipeline.
const OPS_PREFIX: &str = "/__ladle";

/// HTTP handler for the Ladle gateway.
///
/// Thin adapter between Axum and the dispatcher: it serves the operational
/// endpoints, maps dispatch errors to boundary status codes, and records
/// request metrics.
pub struct HttpHandler {
    dispatcher: Arc<GatewayDispatcher>,
    connection_tracker: Arc<ConnectionTracker>,
    config: Arc<ArcSwap<GatewayConfig>>,
}

impl HttpHandler {
    pub fn new(
        dispatcher: Arc<GatewayDispatcher>,
        connection_tracker: Arc<ConnectionTracker>,
        config: Arc<ArcSwap<GatewayConfig>>,
    ) -> Self {
        Self {
            dispatcher,
            connection_tracker,
            config,
        }
    }

    /// Main request handler that routes requests appropriately
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>, eyre::Error> {
        let path = req.uri().path().to_string();

        if let Some(ops_path) = path.strip_prefix(OPS_PREFIX) {
            return match (req.method(), ops_path) {
                (&Method::GET, "/health") => self.handle_health().await,
                (&Method::GET, "/status") => self.handle_status().await,
                (&Method::GET, "/metrics") => self.handle_metrics().await,
                (&Method::POST, "/drain") => self.handle_drain(&req).await,
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(AxumBody::from("Unknown operational endpoint"))
                    .wrap_err("Failed to build 404 response"),
            };
        }

        self.handle_dispatch(req, client_addr).await
    }

    /// Run one request through the dispatch pipeline with bookkeeping.
    async fn handle_dispatch(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>, eyre::Error> {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let request_id = uuid::Uuid::new_v4().to_string();

        let span = crate::tracing_setup::create_request_span(&method, &path, &request_id);
        let _enter = span.enter();

        let connection_info =
            client_addr.map(|addr| self.connection_tracker.register_connection(addr));
        if let Some(ref conn_info) = connection_info {
            conn_info.increment_requests();
        }
        crate::metrics::set_active_connections(self.connection_tracker.active_connection_count());
        crate::metrics::set_active_requests(self.connection_tracker.total_active_requests());

        let timer = crate::metrics::RequestTimer::new(&path, &method);
        let result = self.dispatcher.dispatch(req, client_addr).await;
        drop(timer);

        if let Some(conn_info) = connection_info {
            conn_info.decrement_requests();
            self.connection_tracker.unregister_connection(conn_info.id);
        }

        let mut response = match result {
            Ok(response) => response,
            Err(error) => {
                let status = error.status_code();
                tracing::Span::current().record("http.status_code", status.as_u16());
                tracing::debug!(kind = error.kind(), %error, "dispatch rejected");

                Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                    .body(AxumBody::from(error.to_string()))
                    .wrap_err("Failed to build error response")?
            }
        };

        tracing::Span::current().record("http.status_code", response.status().as_u16());
        crate::metrics::increment_request_total(&path, &method, response.status().as_u16());

        if let Ok(id_value) = header::HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", id_value);
        }
        Ok(response)
    }

    /// Gateway liveness plus upstream pool summary.
    async fn handle_health(&self) -> Result<Response<AxumBody>, eyre::Error> {
        let (healthy, total) = self.dispatcher.registry().instance_counts();

        let status = if healthy > 0 {
            StatusCode::OK
        } else if total > 0 {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::NOT_FOUND
        };

        let health_data = serde_json::json!({
            "status": if status == StatusCode::OK { "healthy" } else { "unhealthy" },
            "instances": {
                "healthy": healthy,
                "total": total
            },
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        let response = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(health_data.to_string()))
            .wrap_err("Failed to build health check response")?;

        Ok(response)
    }

    /// Full gateway status: routes, breakers, instances, connections.
    async fn handle_status(&self) -> Result<Response<AxumBody>, eyre::Error> {
        let stats = self.connection_tracker.get_stats();
        let config = self.config.load_full();
        let table = self.dispatcher.route_table();
        let (healthy, total) = self.dispatcher.registry().instance_counts();

        let routes: Vec<serde_json::Value> = table
            .routes()
            .iter()
            .map(|route| {
                serde_json::json!({
                    "id": route.id,
                    "pattern": route.pattern,
                    "service": route.service,
                    "timeout_ms": route.timeout.as_millis() as u64,
                })
            })
            .collect();

        let breakers: Vec<serde_json::Value> = self
            .dispatcher
            .breaker_snapshot()
            .into_iter()
            .map(|(service, state)| serde_json::json!({ "service": service, "state": state }))
            .collect();

        let instances: Vec<serde_json::Value> = self
            .dispatcher
            .registry()
            .all_instances()
            .iter()
            .map(|instance| {
                serde_json::json!({
                    "service": instance.service(),
                    "url": instance.url(),
                    "weight": instance.weight(),
                    "health": instance.health(),
                })
            })
            .collect();

        let status_data = serde_json::json!({
            "service": "Ladle API Gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "listen_addr": &config.listen_addr,
            "routes": routes,
            "breakers": breakers,
            "instances": {
                "healthy": healthy,
                "total": total,
                "detail": instances
            },
            "rate_limit_buckets": self.dispatcher.bucket_count(),
            "connections": {
                "total": stats.total_connections,
                "active": stats.active_connections,
                "idle": stats.idle_connections,
                "active_requests": stats.total_active_requests,
            },
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(status_data.to_string()))
            .wrap_err("Failed to build status response")?;

        Ok(response)
    }

    /// Gauge snapshot for ad-hoc scraping.
    async fn handle_metrics(&self) -> Result<Response<AxumBody>, eyre::Error> {
        let metrics_data = serde_json::json!({
            "gauges": crate::metrics::get_current_metrics(),
            "connections": {
                "active": self.connection_tracker.active_connection_count(),
                "active_requests": self.connection_tracker.total_active_requests()
            },
            "rate_limit_buckets": self.dispatcher.bucket_count(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(metrics_data.to_string()))
            .wrap_err("Failed to build metrics response")?;

        Ok(response)
    }

    /// Take one instance out of rotation: POST /__ladle/drain?service=..&url=..
    async fn handle_drain(
        &self,
        req: &Request<AxumBody>,
    ) -> Result<Response<AxumBody>, eyre::Error> {
        let query = req.uri().query().unwrap_or_default();
        let mut service = None;
        let mut url = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "service" => service = Some(value.into_owned()),
                "url" => url = Some(value.into_owned()),
                _ => {}
            }
        }

        let (Some(service), Some(url)) = (service, url) else {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(AxumBody::from(
                    "drain requires 'service' and 'url' query parameters",
                ))
                .wrap_err("Failed to build drain error response");
        };

        if self.dispatcher.registry().set_draining(&service, &url) {
            Response::builder()
                .status(StatusCode::OK)
                .body(AxumBody::from(format!("draining {url} ({service})")))
                .wrap_err("Failed to build drain response")
        } else {
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(AxumBody::from(format!(
                    "no instance '{url}' registered for service '{service}'"
                )))
                .wrap_err("Failed to build drain response")
        }
    }
}

impl Clone for HttpHandler {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            connection_tracker: self.connection_tracker.clone(),
            config: self.config.clone(),
        }
    }
}
