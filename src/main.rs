//! TUS Upload Server
//!
//! Resumable chunked uploads for projects and course modules, with bounded
//! concurrency per category and background cleanup of stale uploads.

use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tus_upload_server::config::Config;
use tus_upload_server::db::{self, SqliteUploadRepository};
use tus_upload_server::routes;
use tus_upload_server::state::AppState;
use tus_upload_server::upload::UploadCategory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "tus_upload_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;

    tracing::info!("Starting TUS Upload Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Temporary upload dir: {}", config.upload.temp_dir.display());
    tracing::info!("Final upload dir: {}", config.upload.final_dir.display());

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    // Create application state
    let repository = Arc::new(SqliteUploadRepository::new(db_pool));
    let app_state = AppState::new(config.clone(), repository)
        .await
        .context("Failed to initialize upload storage")?;

    if let Err(e) = app_state.rehydrate().await {
        tracing::warn!("Failed to restore admission queues: {}", e);
    }
    app_state.sweeper().start();

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api/v1/health", routes::health::router())
        .nest(
            "/api/v1/uploads/project",
            routes::tus::router(app_state.clone(), UploadCategory::Project),
        )
        .nest(
            "/api/v1/uploads/modul",
            routes::tus::router(app_state.clone(), UploadCategory::Modul),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state.clone());

    // Start server with graceful shutdown
    let addr = (config.server.host.as_str(), config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}:{}", addr.0, addr.1))?;
    tracing::info!("TUS Upload Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    app_state.sweeper().stop();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
