//! Ladle - the API gateway and resilience layer for the Cookly platform.
//!
//! Ladle sits in front of the platform's microservices (users, recipes,
//! inventory, meal plans) and owns the request path: route matching,
//! per-client rate limiting, circuit breaking and load-balanced upstream
//! dispatch. It follows a **hexagonal architecture**: business logic lives in
//! `core`, interfaces in `ports`, and I/O in `adapters`.
//!
//! # Features
//! - Pattern-based routing (`*` single segment, trailing `**` catch-all) with
//!   static-beats-wildcard precedence
//! - Per-client token-bucket rate limiting with lazy buckets and idle sweep
//! - Per-service circuit breakers (sliding window, half-open single probe)
//! - Round-robin / weighted round-robin upstream selection with health state
//! - Bounded per-route upstream timeouts; one idempotent retry on transport
//!   errors
//! - Active health checking and an operator drain endpoint
//! - Live configuration hot-reload with atomic route-table swap
//! - Metrics (via the `metrics` facade) & structured tracing via `tracing`
//! - Graceful shutdown & connection draining
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use ladle::{GatewayDispatcher, HttpClientAdapter, config::GatewayConfig};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config: GatewayConfig = ladle::config::loader::load_config("ladle.yaml").await?;
//! let http_client = Arc::new(HttpClientAdapter::new()?);
//! let dispatcher = Arc::new(GatewayDispatcher::new(&config, http_client).await?);
//! // Wire the dispatcher into the provided HttpHandler adapter (see binary crate)
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! The dispatch pipeline returns a typed [`core::DispatchError`]; every
//! variant maps to exactly one boundary status code. Application-level
//! fallible APIs return `eyre::Result<T>` with `WrapErr` context attached.
//!
//! # Concurrency & Data Structures
//! Shared keyed state (buckets, breakers, service pools) lives in
//! `scc::HashMap` with per-entry synchronization; the route table is an
//! immutable snapshot behind `arc-swap`. No lock is held across an upstream
//! call.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{FileConfigProvider, HealthChecker, HttpClientAdapter, HttpHandler},
    core::{DispatchError, GatewayDispatcher},
    ports::http_client::HttpClient,
    utils::{ConnectionTracker, GracefulShutdown},
};
