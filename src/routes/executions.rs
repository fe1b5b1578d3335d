//! Execution output endpoints.
//!
//! - `POST /v1/executions/{id}`: register an execution
//! - `GET /v1/executions/{id}`: buffered counts and state
//! - `POST /v1/executions/{id}/logs`: append log lines
//! - `POST /v1/executions/{id}/notifications`: append workflow notifications
//! - `POST /v1/executions/{id}/finish`: close both streams
//! - `DELETE /v1/executions/{id}`: forget an execution and its buffers
//!
//! Registering and finishing publish an event on the outbound event queue.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::SourceError;
use crate::tunnel::events::Event;
use crate::tunnel::protocol::{ExecutionNotification, LogLine};
use crate::AppState;

type ApiResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

#[derive(Deserialize)]
pub struct AppendLogs {
    pub lines: Vec<String>,
}

#[derive(Deserialize)]
pub struct AppendNotifications {
    pub notifications: Vec<ExecutionNotification>,
}

fn source_error(e: &SourceError) -> (StatusCode, Json<Value>) {
    let status = match e {
        SourceError::NotFound(_) => StatusCode::NOT_FOUND,
        SourceError::Finished(_) => StatusCode::CONFLICT,
        SourceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()})))
}

/// `POST /v1/executions/{id}`: `201` when new, `200` when already known.
pub async fn register(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let created = state.hub.register(&id).await;
    if created {
        let queued = state.events.try_send(Event::new(
            "execution-started",
            "execution",
            &id,
            json!({"id": id}),
        ));
        debug!(execution_id = %id, event_queued = queued, "execution registered");
    }
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(json!({"id": id, "created": created}))))
}

/// `GET /v1/executions/{id}`
pub async fn summary(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.hub.summary(&id).await {
        Some(summary) => Ok((StatusCode::OK, Json(json!(summary)))),
        None => Err(source_error(&SourceError::NotFound(id))),
    }
}

/// `DELETE /v1/executions/{id}`
pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.hub.remove(&id).await.map_err(|e| source_error(&e))?;
    Ok((StatusCode::OK, Json(json!({"id": id, "removed": true}))))
}

/// `POST /v1/executions/{id}/logs`: body `{"lines": [...]}`.
pub async fn append_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AppendLogs>,
) -> ApiResult {
    let lines = body.lines.into_iter().map(LogLine).collect();
    let appended = state
        .hub
        .append_logs(&id, lines)
        .await
        .map_err(|e| source_error(&e))?;
    Ok((StatusCode::ACCEPTED, Json(json!({"appended": appended}))))
}

/// `POST /v1/executions/{id}/notifications`: body `{"notifications": [...]}`.
pub async fn append_notifications(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AppendNotifications>,
) -> ApiResult {
    let appended = state
        .hub
        .append_notifications(&id, body.notifications)
        .await
        .map_err(|e| source_error(&e))?;
    Ok((StatusCode::ACCEPTED, Json(json!({"appended": appended}))))
}

/// `POST /v1/executions/{id}/finish`
pub async fn finish(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.hub.finish(&id).await.map_err(|e| source_error(&e))?;
    let queued = state.events.try_send(Event::new(
        "execution-finished",
        "execution",
        &id,
        json!({"id": id}),
    ));
    Ok((
        StatusCode::OK,
        Json(json!({"id": id, "finished": true, "event_queued": queued})),
    ))
}
