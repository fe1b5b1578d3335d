//! Local request handler.
//!
//! The agent does not listen on a socket: the control plane reaches these
//! routes through the command tunnel, which feeds each remote command into
//! [`router`] in-process.

pub mod executions;
pub mod health;
pub mod info;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Build the handler the command tunnel dispatches to.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/info", get(info::info))
        .route(
            "/v1/executions/{id}",
            post(executions::register)
                .get(executions::summary)
                .delete(executions::remove),
        )
        .route("/v1/executions/{id}/logs", post(executions::append_logs))
        .route(
            "/v1/executions/{id}/notifications",
            post(executions::append_notifications),
        )
        .route("/v1/executions/{id}/finish", post(executions::finish))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
