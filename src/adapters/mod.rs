pub mod config_providers;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;

/// Re-export commonly used types from adapters
pub use config_providers::FileConfigProvider;
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
