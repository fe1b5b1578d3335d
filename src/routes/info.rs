//! Agent information endpoint.
//!
//! `GET /info` reports identity, tunnel status and queue counters:
//!
//! | Field            | Source                                   |
//! |------------------|------------------------------------------|
//! | `cluster_id`     | `[control_plane] cluster_id`             |
//! | `runner_id`      | `[control_plane] runner_id`              |
//! | `tunnel`         | connection status and recent events      |
//! | `events`         | outbound event queue depth and drops     |
//! | `executions`     | executions tracked by the hub            |

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// Number of recent connection events included in the response.
const RECENT_EVENTS: usize = 10;

pub async fn info(State(state): State<AppState>) -> Json<Value> {
    let cp = &state.config.control_plane;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "cluster_id": cp.cluster_id,
        "runner_id": cp.runner_id,
        "organization_id": cp.organization_id,
        "environment_id": cp.environment_id,
        "tunnel": state.status.snapshot(RECENT_EVENTS).await,
        "events": {
            "queued": state.events.queued(),
            "dropped": state.events.dropped(),
        },
        "executions": state.hub.len().await,
    }))
}
