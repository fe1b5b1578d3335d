//! Connection supervisor.
//!
//! [`Agent::run`] keeps exactly one session alive. A session opens the four
//! tunnel streams under one [`TaskGroup`]: the first stream to end takes the
//! others down with it, the supervisor logs why and reconnects after a fixed
//! pause. Only cancellation of the root token stops the loop.
//!
//! ```text
//!  Agent::run ──► run_session ──► TaskGroup
//!       ▲                           ├── command   (run_command_tunnel)
//!       │                           ├── events    (run_event_forwarder)
//!       │                           ├── logs      (StreamRelay<LogLine>)
//!       │                           └── notifications (StreamRelay<Notification>)
//!       └──── sleep(reconnect_delay) ◄── first error
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::command::run_command_tunnel;
use super::connector::{ControlPlaneConnector, TunnelKind};
use super::events::{run_event_forwarder, EventReceiver};
use super::group::TaskGroup;
use super::protocol::{FramePayload, LogLine, Notification};
use super::relay::{PushSource, RelayOptions, StreamRelay};
use super::TunnelTimeouts;
use crate::config::{Config, ControlPlaneConfig, TunnelConfig};
use crate::error::TunnelError;
use crate::state::{AgentStatus, ConnectionEventType};

pub struct Agent {
    control_plane: ControlPlaneConfig,
    tunnel: TunnelConfig,
    handler: Router,
    events: EventReceiver,
    logs: Arc<dyn PushSource<LogLine>>,
    notifications: Arc<dyn PushSource<Notification>>,
    status: Arc<AgentStatus>,
}

impl Agent {
    pub fn new(
        config: &Config,
        handler: Router,
        events: EventReceiver,
        logs: Arc<dyn PushSource<LogLine>>,
        notifications: Arc<dyn PushSource<Notification>>,
    ) -> Self {
        Self {
            control_plane: config.control_plane.clone(),
            tunnel: config.tunnel.clone(),
            handler,
            events,
            logs,
            notifications,
            status: Arc::new(AgentStatus::new()),
        }
    }

    /// Share an existing status record (e.g. one the local handler reports).
    #[must_use]
    pub fn with_status(mut self, status: Arc<AgentStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> Arc<AgentStatus> {
        self.status.clone()
    }

    /// Supervise sessions until `cancel` fires. Always returns
    /// [`TunnelError::Cancelled`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let delay = self.tunnel.reconnect_delay();
        loop {
            if cancel.is_cancelled() {
                return Err(TunnelError::Cancelled);
            }

            let result = self.run_session(&cancel).await;
            self.status.connected.store(false, Ordering::Relaxed);

            if cancel.is_cancelled() {
                info!("agent stopped");
                return Err(TunnelError::Cancelled);
            }

            let detail = match &result {
                Ok(()) => "session ended".to_string(),
                Err(e) => e.to_string(),
            };
            match &result {
                Ok(()) => info!(delay_secs = delay.as_secs(), "agent session ended, reconnecting"),
                Err(e) => warn!(
                    error = %e,
                    delay_secs = delay.as_secs(),
                    "agent connection failed, reconnecting"
                ),
            }
            self.status
                .push_event(ConnectionEventType::Disconnected, detail)
                .await;

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("agent stopped");
                    return Err(TunnelError::Cancelled);
                }
                () = tokio::time::sleep(delay) => {}
            }

            self.status.reconnects.fetch_add(1, Ordering::Relaxed);
            self.status
                .push_event(ConnectionEventType::ReconnectAttempt, String::new())
                .await;
        }
    }

    /// One session: all four streams, fate-shared. Returns the first
    /// stream's error.
    pub async fn run_session(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let session = AgentSession::start(self, cancel)?;
        session.wait().await
    }
}

/// The live set of tunnels between two reconnects.
pub struct AgentSession {
    connector: Arc<ControlPlaneConnector>,
    group: TaskGroup,
}

impl AgentSession {
    fn start(agent: &Agent, cancel: &CancellationToken) -> Result<Self, TunnelError> {
        let connector = Arc::new(ControlPlaneConnector::from_config(&agent.control_plane)?);
        let timeouts = TunnelTimeouts::from_config(&agent.tunnel);
        let mut group = TaskGroup::new(cancel);

        {
            let connector = connector.clone();
            let handler = agent.handler.clone();
            let status = agent.status.clone();
            let token = group.token();
            group.spawn("command", async move {
                let stream = connector.open(TunnelKind::Command, &token).await?;
                status.connected.store(true, Ordering::Relaxed);
                status
                    .push_event(ConnectionEventType::Connected, connector.url_for(TunnelKind::Command))
                    .await;
                run_command_tunnel(stream, handler, timeouts, token).await
            });
        }

        {
            let connector = connector.clone();
            let events = agent.events.clone();
            let interval = agent.tunnel.healthcheck_interval();
            let token = group.token();
            group.spawn("events", async move {
                let stream = connector.open(TunnelKind::Events, &token).await?;
                run_event_forwarder(stream, events, interval, timeouts.send, token).await
            });
        }

        {
            let relay = StreamRelay::new(
                "logs",
                agent.logs.clone(),
                RelayOptions::from_config(&agent.tunnel, agent.tunnel.log_stream_workers, "pod logs"),
            );
            spawn_relay(&mut group, &connector, TunnelKind::Logs, relay);
        }

        {
            let relay = StreamRelay::new(
                "notifications",
                agent.notifications.clone(),
                RelayOptions::from_config(
                    &agent.tunnel,
                    agent.tunnel.notifications_workers,
                    "workflow notifications",
                ),
            );
            spawn_relay(&mut group, &connector, TunnelKind::Notifications, relay);
        }

        Ok(Self { connector, group })
    }

    pub fn connector(&self) -> &ControlPlaneConnector {
        &self.connector
    }

    /// Wait for the first stream to end and the rest to unwind.
    pub async fn wait(self) -> Result<(), TunnelError> {
        self.group.wait().await
    }
}

fn spawn_relay<P>(
    group: &mut TaskGroup,
    connector: &Arc<ControlPlaneConnector>,
    kind: TunnelKind,
    relay: StreamRelay<P>,
) where
    P: FramePayload,
{
    let connector = connector.clone();
    let token = group.token();
    group.spawn(kind.as_str(), async move {
        let stream = connector.open(kind, &token).await?;
        relay.run(stream, token).await
    });
}
