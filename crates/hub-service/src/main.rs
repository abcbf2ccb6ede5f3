//! Coordination Hub
//!
//! WebSocket server for live video calls, chat and notifications.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (text or JSON)
//! 3. Initialize Prometheus metrics recorder
//! 4. Connect to Postgres and run migrations, or fall back to in-memory
//!    repositories when `DATABASE_URL` is unset
//! 5. Spawn the room registry and build the router
//! 6. Serve `/ws`, `/health`, `/ready` and `/metrics` until shutdown

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::time::Duration;

use common::secret::ExposeSecret;
use hub_service::config::Config;
use hub_service::observability::init_metrics_recorder;
use hub_service::repositories::memory::MemoryStore;
use hub_service::repositories::Repositories;
use hub_service::runtime::HubRuntime;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration decides the log format, so it loads first
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    let (json_layer, text_layer) = if config.log_json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hub_service=debug,tower_http=debug".into()),
        )
        .with(json_layer)
        .with(text_layer)
        .init();

    info!("Starting Coordination Hub");
    info!(
        bind_address = %config.bind_address,
        allow_anonymous = config.allow_anonymous,
        persistent = config.database_url.is_some(),
        room_idle_timeout_secs = config.room_idle_timeout.as_secs(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let repositories = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url.expose_secret())
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to connect to database");
                    e
                })?;

            sqlx::migrate!("../../migrations")
                .run(&pool)
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to run migrations");
                    e
                })?;
            info!("Database connection established");
            Repositories::postgres(pool)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory repositories");
            Repositories::in_memory(&MemoryStore::new())
        }
    };

    let runtime = HubRuntime::start(&config, repositories);
    let app = runtime.router(Some(prometheus_handle));

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        e
    })?;

    // Bind before marking ready to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind listener");
        e
    })?;
    runtime.state().health.set_ready();
    info!(addr = %addr, "Coordination Hub listening");

    // Open sockets close on the shutdown token, so cancel it before the
    // server waits for in-flight connections
    let shutdown_token = runtime.shutdown_token();
    let health = std::sync::Arc::clone(&runtime.state().health);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown...");
            health.begin_draining();
            shutdown_token.cancel();
        })
        .await?;

    runtime.shutdown().await;

    info!("Coordination Hub shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
