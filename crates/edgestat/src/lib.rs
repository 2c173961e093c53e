// edgestat server - HTTP ingest, stats API and background workers
//
// One process runs:
// - the axum HTTP server (event ingest, stats reads, admin entrypoints)
// - the queue consumer feeding delivered batches to the orchestrator
// - the periodic scheduler for archive, clean, retention and snapshot
//   version pruning
//
// Shutdown stops the listener first, closes the queue, then lets the
// consumer drain what is buffered before the background tasks exit.

use anyhow::{Context, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use edgestat_config::RuntimeConfig;
use edgestat_lifecycle::{Archiver, Cleaner, RetentionSweeper};
use edgestat_pipeline::{BatchOrchestrator, Consumer, DeadLetterSink, MemoryQueue};
use edgestat_snapshot::SnapshotPublisher;
use edgestat_storage::Stores;
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

mod handlers;
mod init;
mod scheduler;
mod tasks;

use handlers::{
    admin_archive, admin_clean, admin_prune_snapshots, admin_retention, admin_snapshot,
    actor_day, health_check, ingest_events, path_stats, ready_check, top_actors,
};
pub use init::init_tracing;
pub use tasks::{run_task, MaintenanceTask};

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub queue: MemoryQueue,
    pub publisher: SnapshotPublisher,
    pub archiver: Archiver,
    pub cleaner: Cleaner,
    pub retention: RetentionSweeper,
    pub config: Arc<RuntimeConfig>,
    /// Cancelled on shutdown; long admin operations watch a child token
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire every service over already opened stores.
    pub fn new(stores: Stores, config: RuntimeConfig) -> Self {
        let queue = MemoryQueue::new(config.queue.clone())
            .with_dead_letters(DeadLetterSink::new(stores.blobs.clone()));
        Self {
            publisher: SnapshotPublisher::new(&stores, config.snapshot.clone()),
            archiver: Archiver::new(&stores, config.lifecycle.clone()),
            cleaner: Cleaner::new(&stores, config.lifecycle.clone()),
            retention: RetentionSweeper::new(&stores, config.lifecycle.clone()),
            queue,
            stores,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Queue consumer over this state's queue and stores.
    pub fn consumer(&self) -> Consumer {
        let orchestrator = BatchOrchestrator::new(&self.stores, self.config.aggregation.clone())
            .with_snapshots(self.publisher.clone());
        Consumer::new(self.queue.clone(), orchestrator)
    }
}

/// Error type that implements IntoResponse
pub(crate) struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request error: {:?}", self.error);
        }
        (
            self.status,
            Json(json!({
                "error": self.error.to_string(),
            })),
        )
            .into_response()
    }
}

impl AppError {
    pub fn with_status(status: StatusCode, error: anyhow::Error) -> Self {
        Self { status, error }
    }

    pub fn bad_request<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::with_status(StatusCode::BAD_REQUEST, error.into())
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, anyhow::anyhow!("{} not found", what))
    }

    pub fn internal<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, error.into())
    }
}

/// All routes, with gzip request decompression and HTTP tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/events", post(ingest_events))
        .route("/v1/stats/paths", get(path_stats))
        .route("/v1/stats/actors/:date", get(top_actors))
        .route("/v1/stats/actors/:date/:actor_hash", get(actor_day))
        .route("/v1/admin/snapshot", post(admin_snapshot))
        .route("/v1/admin/snapshot/prune", post(admin_prune_snapshots))
        .route("/v1/admin/archive", post(admin_archive))
        .route("/v1/admin/clean", post(admin_clean))
        .route("/v1/admin/retention", post(admin_retention))
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .layer(RequestDecompressionLayer::new().gzip(true))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Entry point for server mode (loads config automatically)
pub async fn run() -> Result<()> {
    let config = RuntimeConfig::load().context("Failed to load configuration")?;
    run_with_config(config).await
}

/// Entry point for server mode with pre-loaded configuration
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);

    let addr = config.server.listen_addr.clone();
    let stores = Stores::open(&config)
        .await
        .context("Failed to open storage")?;
    let state = AppState::new(stores, config);

    let consumer_handle = tokio::spawn(state.consumer().run(state.shutdown.child_token()));
    let scheduler = scheduler::spawn(&state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {}", addr))?;

    info!("edgestat listening on http://{}", addr);
    info!("Routes:");
    info!("  POST http://{}/v1/events                   - Traffic event ingest", addr);
    info!("  GET  http://{}/v1/stats/paths              - Path statistics", addr);
    info!("  GET  http://{}/v1/stats/actors/:date[/:id] - Actor statistics", addr);
    info!("  POST http://{}/v1/admin/*                  - Maintenance entrypoints", addr);
    info!("  GET  http://{}/health                      - Health check", addr);
    info!("  GET  http://{}/ready                       - Readiness check", addr);
    info!("Press Ctrl+C or send SIGTERM to stop");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // No new messages past this point; the consumer drains the rest
    state.queue.close();
    state.shutdown.cancel();
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Queue consumer task failed");
    }
    scheduler.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
