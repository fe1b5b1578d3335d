//! Shared application state passed to every handler via Axum's `State` extractor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::hub::ExecutionHub;
use crate::tunnel::events::EventSender;

/// State behind the local request handler (the command tunnel's target).
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the agent started (for uptime calculation).
    pub start_time: Instant,
    /// Execution output backing the log and notification relays.
    pub hub: Arc<ExecutionHub>,
    /// Publishing half of the outbound event queue.
    pub events: EventSender,
    /// Control-plane connection status and event history.
    pub status: Arc<AgentStatus>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        hub: Arc<ExecutionHub>,
        events: EventSender,
        status: Arc<AgentStatus>,
    ) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            hub,
            events,
            status,
        }
    }
}

/// Connection lifecycle event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEventType {
    Connected,
    Disconnected,
    ReconnectAttempt,
}

impl ConnectionEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ReconnectAttempt => "reconnect_attempt",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    pub timestamp: Instant,
    pub event_type: ConnectionEventType,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_CONNECTION_EVENTS: usize = 50;

/// Agent connection status. Atomics for the hot path, Mutex only for the
/// event history.
pub struct AgentStatus {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub events: Mutex<VecDeque<ConnectionEvent>>,
}

impl AgentStatus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            events: Mutex::new(VecDeque::with_capacity(MAX_CONNECTION_EVENTS)),
        }
    }

    /// Push a connection event, evicting oldest if at capacity.
    pub async fn push_event(&self, event_type: ConnectionEventType, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_CONNECTION_EVENTS {
            events.pop_front();
        }
        events.push_back(ConnectionEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
        });
    }

    /// JSON snapshot with the `limit` most recent events, newest first.
    pub async fn snapshot(&self, limit: usize) -> Value {
        let events = self.events.lock().await;
        let now = Instant::now();
        let recent: Vec<Value> = events
            .iter()
            .rev()
            .take(limit)
            .map(|e| {
                json!({
                    "ago_secs": now.duration_since(e.timestamp).as_secs(),
                    "event": e.event_type.as_str(),
                    "detail": e.detail,
                })
            })
            .collect();

        json!({
            "connected": self.connected.load(Ordering::Relaxed),
            "reconnects": self.reconnects.load(Ordering::Relaxed),
            "recent_events": recent,
        })
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::new()
    }
}
