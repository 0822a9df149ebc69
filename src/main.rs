//! # Media Bridge - Main Application Entry Point
//!
//! Bridges browser audio to host audio devices. Each WebSocket connection on
//! `/audio` gets a session with two external processes: one recording the
//! virtual speaker (sent to the browser) and one playing browser audio into
//! the virtual microphone.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (defaults, TOML file, environment)
//! - **state**: Shared application state and HTTP metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics collection
//! - **handlers**: Route table, landing page and config view
//! - **websocket**: The `/audio` WebSocket actor
//! - **audio**: Sessions, relays and external process management
//! - **error**: Error types and HTTP error responses

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::process::CommandSpawner;
use audio::session::{SessionConfig, SessionManager};
use config::AppConfig;
use state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ## Startup:
/// 1. Load `.env`, set up logging, load and validate configuration
/// 2. Build the session manager over the real process spawner
/// 3. Start the HTTP server
///
/// ## Shutdown:
/// SIGINT or SIGTERM cancels the shutdown token. Every session is torn down
/// while the server's workers are still running, then the HTTP server stops.
/// No recording or playback process outlives the server.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting media-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        capture = %config.devices.capture_target,
        playback = %config.devices.playback_target,
        max_sessions = config.performance.max_concurrent_sessions,
        "Configuration loaded"
    );

    let spawner = Arc::new(CommandSpawner::from_config(&config));
    let sessions = Arc::new(SessionManager::new(
        SessionConfig::from_app_config(&config),
        spawner,
    ));
    let app_state = AppState::new(config.clone(), sessions.clone());
    let bind_addr = config.bind_address();

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(handlers::configure_routes)
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let closed = tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => info!("Server exited"),
            }
            sessions.shutdown_all().await
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, closing sessions...");
            // Session supervisors run on the server's workers.
            let closed = sessions.shutdown_all().await;
            server_handle.stop(true).await;
            closed
        }
    };

    info!(sessions = closed, "Server stopped gracefully");
    Ok(())
}

/// Structured logging to the console.
///
/// `RUST_LOG` overrides the default filter of
/// `media_bridge=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Cancels `shutdown` on the first SIGTERM or SIGINT.
fn setup_signal_handlers(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                shutdown.cancel();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        shutdown.cancel();
    });
}
