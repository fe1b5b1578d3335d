//! Outbound event tunnel.
//!
//! Application code queues [`Event`]s through a cloneable [`EventSender`]
//! that never blocks: when the queue is full the event is dropped. The queue
//! belongs to the agent, not to a session, so events published while the
//! tunnel is down are delivered by the next session. One forwarder drains it
//! at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Sink, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::protocol::EventFrame;
use super::timed::send_json;
use crate::error::TunnelError;

/// Application event, serialized as JSON into the body of a `TEXT` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub resource: String,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        resource: impl Into<String>,
        resource_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            resource: resource.into(),
            resource_id: resource_id.into(),
            created_at: Utc::now(),
            payload,
        }
    }
}

/// Bounded event queue. Returns the publishing and draining halves.
pub fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        EventReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Enqueue without waiting. Returns `false` if the event was dropped.
    pub fn try_send(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "event queue full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(event_id = %event.id, "event queue closed, dropping event");
                false
            }
        }
    }

    /// Events dropped since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Draining half, shared across sessions.
#[derive(Clone)]
pub struct EventReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Event>>>,
}

/// Push queued events to the control plane until the stream fails or
/// `cancel` fires. A `HEALTHCHECK` frame goes out every `interval`.
/// Cancellation is a clean stop and returns `Ok`.
pub async fn run_event_forwarder<S>(
    stream: S,
    events: EventReceiver,
    interval: Duration,
    send_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), TunnelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    match forward(stream, events, interval, send_timeout, &cancel).await {
        Err(e) if e.is_cancelled() => Ok(()),
        result => result,
    }
}

async fn forward<S>(
    mut stream: S,
    events: EventReceiver,
    interval: Duration,
    send_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), TunnelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let mut rx = tokio::select! {
        () = cancel.cancelled() => return Err(TunnelError::Cancelled),
        guard = events.rx.lock() => guard,
    };

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut queue_open = true;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Err(TunnelError::Cancelled),

            _ = ticker.tick() => {
                trace!("sending event tunnel keep-alive");
                send_json(&mut stream, &EventFrame::healthcheck(), send_timeout, cancel).await?;
            }

            next = rx.recv(), if queue_open => {
                let Some(event) = next else {
                    queue_open = false;
                    continue;
                };
                let body = match serde_json::to_vec(&event) {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(event_id = %event.id, error = %e, "skipping unencodable event");
                        continue;
                    }
                };
                send_json(&mut stream, &EventFrame::text(body), send_timeout, cancel).await?;
                trace!(event_id = %event.id, event_type = %event.event_type, "event sent");
            }

            inbound = stream.next() => match inbound {
                None | Some(Ok(Message::Close(_))) => return Err(TunnelError::StreamClosed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            },
        }
    }
}
