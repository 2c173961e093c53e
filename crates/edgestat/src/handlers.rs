// HTTP request handlers
//
// Event ingest, statistics reads, admin entrypoints and health checks

use anyhow::anyhow;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use edgestat_core::time::parse_date;
use edgestat_core::RawTrafficEvent;
use edgestat_pipeline::PipelineError;
use edgestat_storage::Statement;
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tracing::debug;

use crate::tasks::{run_task, MaintenanceTask};
use crate::{AppError, AppState};

const DEFAULT_TOP_ACTORS: usize = 50;
const MAX_TOP_ACTORS: usize = 500;

/// POST /v1/events - Accept a JSON array (or a single object) of traffic
/// events and enqueue one message per event
pub(crate) async fn ingest_events(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AppError> {
    let start = Instant::now();
    counter!("edgestat.ingest.requests").increment(1);
    histogram!("edgestat.ingest.bytes").record(body.len() as f64);

    let max_payload = state.config.request.max_payload_bytes;
    if body.len() > max_payload {
        counter!("edgestat.ingest.rejected").increment(1);
        return Err(AppError::with_status(
            StatusCode::PAYLOAD_TOO_LARGE,
            anyhow!("payload {} exceeds limit {}", body.len(), max_payload),
        ));
    }

    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(AppError::bad_request)?;
    let items = match payload {
        serde_json::Value::Array(items) => items,
        object @ serde_json::Value::Object(_) => vec![object],
        _ => {
            return Err(AppError::bad_request(anyhow!(
                "expected a JSON object or an array of objects"
            )))
        }
    };

    let received = items.len();
    let mut messages = Vec::with_capacity(received);
    for item in items {
        let Ok(mut event) = serde_json::from_value::<RawTrafficEvent>(item) else {
            continue;
        };
        event.fill_identity();
        // Drop at the edge what the consumer would drop anyway
        if let Err(e) = event.clone().validate() {
            debug!(error = %e, "Rejected event at ingest");
            continue;
        }
        messages.push(Bytes::from(
            serde_json::to_vec(&event).map_err(AppError::internal)?,
        ));
    }
    let accepted = messages.len();
    let rejected = received - accepted;

    if !messages.is_empty() {
        state.queue.send_batch(messages).map_err(|e| match e {
            PipelineError::QueueFull { .. } | PipelineError::QueueClosed => {
                AppError::with_status(StatusCode::SERVICE_UNAVAILABLE, e.into())
            }
            other => AppError::internal(other),
        })?;
    }

    counter!("edgestat.events.accepted").increment(accepted as u64);
    counter!("edgestat.events.rejected").increment(rejected as u64);
    debug!(
        accepted,
        rejected,
        elapsed_us = start.elapsed().as_micros() as u64,
        "Events enqueued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": accepted,
            "rejected": rejected,
        })),
    )
        .into_response())
}

/// GET /v1/stats/paths - Current snapshot, or live aggregates when none
pub(crate) async fn path_stats(State(state): State<AppState>) -> Result<Response, AppError> {
    let response = state
        .publisher
        .read_current()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(response).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct TopActorsQuery {
    limit: Option<usize>,
}

/// GET /v1/stats/actors/:date - Busiest actors of a day
pub(crate) async fn top_actors(
    State(state): State<AppState>,
    Path(date): Path<String>,
    Query(query): Query<TopActorsQuery>,
) -> Result<Response, AppError> {
    require_date(&date)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TOP_ACTORS)
        .clamp(1, MAX_TOP_ACTORS);
    let actors = state
        .stores
        .actors
        .list_top_actors(&date, limit)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "date": date, "actors": actors })).into_response())
}

/// GET /v1/stats/actors/:date/:actor_hash - One actor's day with every path
pub(crate) async fn actor_day(
    State(state): State<AppState>,
    Path((date, actor_hash)): Path<(String, String)>,
) -> Result<Response, AppError> {
    require_date(&date)?;
    let view = state
        .stores
        .actors
        .get_actor_day(&date, &actor_hash)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("actor {} on {}", actor_hash, date)))?;
    Ok(Json(view).into_response())
}

fn require_date(date: &str) -> Result<(), AppError> {
    parse_date(date)
        .map(|_| ())
        .ok_or_else(|| AppError::bad_request(anyhow!("invalid date '{}', expected YYYY-MM-DD", date)))
}

/// POST /v1/admin/snapshot
pub(crate) async fn admin_snapshot(State(state): State<AppState>) -> Result<Response, AppError> {
    admin(&state, MaintenanceTask::Snapshot).await
}

/// POST /v1/admin/snapshot/prune
pub(crate) async fn admin_prune_snapshots(
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    admin(&state, MaintenanceTask::PruneSnapshots).await
}

/// POST /v1/admin/archive
pub(crate) async fn admin_archive(State(state): State<AppState>) -> Result<Response, AppError> {
    admin(&state, MaintenanceTask::Archive).await
}

/// POST /v1/admin/clean
pub(crate) async fn admin_clean(State(state): State<AppState>) -> Result<Response, AppError> {
    admin(&state, MaintenanceTask::Clean).await
}

/// POST /v1/admin/retention
pub(crate) async fn admin_retention(State(state): State<AppState>) -> Result<Response, AppError> {
    admin(&state, MaintenanceTask::Retention).await
}

async fn admin(state: &AppState, task: MaintenanceTask) -> Result<Response, AppError> {
    let report = run_task(state, task).await.map_err(AppError::internal)?;
    Ok(Json(report).into_response())
}

/// GET /health - Basic health check
pub(crate) async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

/// GET /ready - Database reachable and queue accepting messages
pub(crate) async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.queue.is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "shutting_down"})),
        );
    }
    if let Err(e) = state.stores.db.execute(&Statement::new("SELECT 1")).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "error": e.to_string()})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "queueDepth": state.queue.len(),
            "inFlight": state.queue.in_flight(),
        })),
    )
}
