use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    response::Response,
    routing::any,
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use ladle::{
    GatewayDispatcher, HttpClientAdapter, HttpHandler,
    adapters::FileConfigProvider,
    config::{GatewayConfigValidator, models::GatewayConfig},
    metrics,
    ports::{config_provider::ConfigProvider, http_client::HttpClient},
    tracing_setup,
    utils::{ConnectionTracker, graceful_shutdown::GracefulShutdown},
};
use tokio::sync::Mutex as TokioMutex;
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "ladle.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "ladle.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "ladle.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "ladle.yaml")]
        config: String,
    },
}

/// Spawn (or replace) the health checker task for the given configuration.
async fn restart_health_checker(
    handle_slot: &TokioMutex<Option<tokio::task::JoinHandle<()>>>,
    dispatcher: &Arc<GatewayDispatcher>,
    http_client: &Arc<dyn HttpClient>,
    config: &GatewayConfig,
) {
    let mut handle_guard = handle_slot.lock().await;

    if let Some(old_handle) = handle_guard.take() {
        old_handle.abort();
    }

    if !config.health_check.enabled {
        tracing::info!("Health checking is disabled in the current configuration.");
        return;
    }

    let checker = ladle::HealthChecker::new(
        dispatcher.registry().clone(),
        http_client.clone(),
        config.health_check.clone(),
    );

    let interval = config.health_check.interval_secs;
    *handle_guard = Some(tokio::spawn(async move {
        tracing::info!(interval_secs = interval, "Health checker task started");
        if let Err(e) = checker.run().await {
            tracing::error!("Health checker run error: {}", e);
        }
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config), // Default to serve with config from args
    };

    match command {
        "validate" => {
            return validate_config_command(&config_path).await;
        }
        "init" => {
            return init_config_command(&config_path).await;
        }
        "serve" => {
            // Continue with normal server startup
        }
        _ => unreachable!(),
    }

    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    tracing::info!("Loading initial configuration from {config_path}");

    let config_provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(&config_path).context("Failed to create config provider")?,
    );

    let initial_config: GatewayConfig = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    // Malformed configuration is fatal at startup.
    GatewayConfigValidator::validate(&initial_config)
        .map_err(|e| eyre!("Invalid configuration:\n{e}"))?;

    let config_holder = Arc::new(ArcSwap::from_pointee(initial_config));

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);

    let dispatcher = Arc::new(
        GatewayDispatcher::new(&config_holder.load_full(), http_client.clone())
            .await
            .context("Failed to build gateway dispatcher")?,
    );

    let health_checker_handle = Arc::new(TokioMutex::new(None::<tokio::task::JoinHandle<()>>));
    restart_health_checker(
        &health_checker_handle,
        &dispatcher,
        &http_client,
        &config_holder.load(),
    )
    .await;

    // Rate-limit bucket sweep task; the interval is re-read every cycle so a
    // reload takes effect without restarting the task.
    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(dispatcher.sweep_interval()).await;
                dispatcher.sweep_rate_limiters().await;
            }
        });
    }

    // Config Watcher Task
    let config_holder_for_watcher = config_holder.clone();
    let dispatcher_for_watcher = dispatcher.clone();
    let health_handle_for_watcher = health_checker_handle.clone();
    let http_client_for_watcher = http_client.clone();
    let debounce_duration = Duration::from_secs(2);

    let mut notify_rx = config_provider.watch();
    let config_provider_for_watcher = config_provider.clone();
    let config_path_for_watcher = config_path.clone();

    tokio::spawn(async move {
        tracing::info!("Config watcher task started.");
        let mut last_reload_attempt_time = tokio::time::Instant::now();
        last_reload_attempt_time = last_reload_attempt_time
            .checked_sub(debounce_duration)
            .unwrap_or(last_reload_attempt_time);

        while notify_rx.recv().await.is_some() {
            // Debounce
            if last_reload_attempt_time.elapsed() < debounce_duration {
                tracing::info!("Debouncing config reload event. Still within cooldown period.");
                while notify_rx.try_recv().is_ok() {}
                continue;
            }
            last_reload_attempt_time = tokio::time::Instant::now();

            tracing::info!(
                "Attempting to reload configuration from {}",
                config_path_for_watcher
            );

            let new_config = match config_provider_for_watcher.load_config().await {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(
                        "Failed to reload configuration: {}. Keeping old configuration.",
                        e
                    );
                    while notify_rx.try_recv().is_ok() {}
                    continue;
                }
            };

            if let Err(e) = GatewayConfigValidator::validate(&new_config) {
                tracing::error!(
                    "Reloaded configuration is invalid: {}. Keeping old configuration.",
                    e
                );
                while notify_rx.try_recv().is_ok() {}
                continue;
            }

            match dispatcher_for_watcher.reload(&new_config).await {
                Ok(()) => {
                    config_holder_for_watcher.store(Arc::new(new_config));
                    tracing::info!("Configuration reloaded; route table swapped atomically.");

                    restart_health_checker(
                        &health_handle_for_watcher,
                        &dispatcher_for_watcher,
                        &http_client_for_watcher,
                        &config_holder_for_watcher.load(),
                    )
                    .await;
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to apply reloaded configuration: {}. Keeping old configuration.",
                        e
                    );
                }
            }
            while notify_rx.try_recv().is_ok() {}
        }
        tracing::info!("Config watcher task is shutting down.");
    });

    // Create graceful shutdown manager
    let graceful_shutdown = Arc::new(GracefulShutdown::new());

    // Start signal handler for graceful shutdown
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let connection_tracker = Arc::new(ConnectionTracker::new());
    let http_handler = Arc::new(HttpHandler::new(
        dispatcher.clone(),
        connection_tracker.clone(),
        config_holder.clone(),
    ));

    let addr: SocketAddr = {
        let config_ref = config_holder.load();
        config_ref
            .listen_addr
            .parse()
            .context("Failed to parse listen address")?
    };

    {
        let config_ref = config_holder.load();
        tracing::info!(
            "Starting Ladle API Gateway on {} ({} routes, {} services)",
            config_ref.listen_addr,
            config_ref.routes.len(),
            config_ref.services.len()
        );
        for route in &config_ref.routes {
            tracing::info!(
                "Configured route: {} {} -> {}",
                route.id,
                route.pattern,
                route.service
            );
        }
    }

    let make_request_route = |handler: Arc<HttpHandler>| {
        any(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let handler = handler.clone();
                async move {
                    match handler.handle_request(req, Some(client_addr)).await {
                        Ok(response) => Ok::<Response<Body>, std::convert::Infallible>(response),
                        Err(e) => {
                            tracing::error!("Request handling error: {:?}", e);
                            let error_response = Response::builder()
                                .status(500)
                                .body(Body::from("Internal Server Error"))
                                .unwrap_or_else(|_| {
                                    Response::new(Body::from("Internal Server Error"))
                                });
                            Ok(error_response)
                        }
                    }
                }
            },
        )
    };

    const _: fn() = || {
        fn assert_send<T: Send>(_: T) {}
        let h: Arc<HttpHandler> = unimplemented!();
        let req: Request = unimplemented!();
        let addr: SocketAddr = unimplemented!();
        assert_send(async move {
            let _ = h.handle_request(req, Some(addr)).await;
        });
    };
    let app = Router::new()
        .route("/{*path}", make_request_route(http_handler.clone()))
        .route("/", make_request_route(http_handler.clone()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Ladle API Gateway server starting on {}", addr);

    let server_result = tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>()
        ) => {
            result.context("Server error")
        },
        shutdown_reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received: {:?}", shutdown_reason);

            // Stop the health checker, then let in-flight requests finish.
            let mut handle_guard = health_checker_handle.lock().await;
            if let Some(health_handle) = handle_guard.take() {
                tracing::info!("Shutting down health checker...");
                health_handle.abort();
            }
            drop(handle_guard);

            connection_tracker
                .wait_for_drain(Duration::from_secs(10))
                .await;

            tracing::info!("Graceful shutdown completed");
            Ok(())
        }
    };

    server_result?;

    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    use ladle::config::loader::load_config;

    println!("🔍 Validating configuration file: {config_path}");

    // First check if file exists and is readable
    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    // Try to parse the configuration
    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    // Validate the configuration
    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Routes: {}", config.routes.len());
            println!("   • Services: {}", config.services.len());
            println!("   • Health Checks: {}", config.health_check.enabled);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all instance URLs start with http:// or https://");
            println!("   • Check that every route references a declared service");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Ensure durations use valid units (e.g., '10s', '5m')");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Ladle API Gateway Configuration

# The address to listen on
listen_addr: "127.0.0.1:8080"

# Header used to identify clients for rate limiting
client_key_header: "x-client-id"

# Health check configuration
health_check:
  enabled: true
  interval_secs: 10
  path: "/health"

# Route table (most-specific pattern wins)
routes:
  - id: recipes
    pattern: "/api/v1/recipes/**"
    service: recipe-service
    rate_limit:
      capacity: 200
      refill_per_sec: 100.0
    timeout: "10s"
  - id: users
    pattern: "/api/v1/users/**"
    service: user-service

# Upstream services
services:
  recipe-service:
    instances:
      - url: "http://localhost:3001"
      - url: "http://localhost:3002"
        weight: 2
    breaker:
      window_size: 20
      failure_ratio: 0.5
      min_samples: 10
      cooldown: "30s"
  user-service:
    instances:
      - url: "http://localhost:3003"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'ladle serve --config {config_path}' to start the server");
    Ok(())
}
