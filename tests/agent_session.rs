//! End-to-end tests for an agent session against a fake control plane.
//!
//! The fake serves the four tunnel endpoints over plain WebSockets on a
//! loopback port and reports everything it sees through one channel. The
//! agent under test is the real one: connector, supervisor, command tunnel,
//! event forwarder, relays, local routes and execution hub.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use testkube_agent::tunnel::protocol::{
    EventFrame, ExecuteRequest, ExecuteResponse, LogLine, Opcode, StreamFrame, StreamRequest,
    StreamRequestType, HEALTHCHECK_COMMAND,
};
use testkube_agent::{
    event_queue, routes, Agent, AgentStatus, AppState, Config, Event, ExecutionHub, TunnelError,
};

// ============================================================================
// Fake control plane
// ============================================================================

#[derive(Debug)]
enum Seen {
    Connected { tunnel: &'static str, api_key: String, runner_id: Option<String> },
    Response(ExecuteResponse),
    Event(EventFrame),
    LogFrame(StreamFrame<LogLine>),
    Closed(&'static str),
}

/// Commands sent on the n-th command connection, and whether to hang up after.
#[derive(Clone)]
struct CommandScript {
    requests: Vec<ExecuteRequest>,
    hang_up: bool,
}

#[derive(Clone)]
struct FakeControlPlane {
    seen: mpsc::UnboundedSender<Seen>,
    scripts: Arc<Mutex<Vec<CommandScript>>>,
    command_connections: Arc<AtomicUsize>,
    log_requests: Arc<Vec<StreamRequest>>,
    commands_done: Arc<Notify>,
}

impl FakeControlPlane {
    fn script(&self, n: usize) -> CommandScript {
        let scripts = self.scripts.lock().unwrap();
        scripts.get(n).cloned().unwrap_or(CommandScript {
            requests: Vec::new(),
            hang_up: false,
        })
    }

    fn connected(&self, tunnel: &'static str, headers: &HeaderMap) {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(String::from);
        let _ = self.seen.send(Seen::Connected {
            tunnel,
            api_key: header("api-key").unwrap_or_default(),
            runner_id: header("runner-id"),
        });
    }
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    let text = serde_json::to_string(value).unwrap();
    socket.send(Message::Text(text.into())).await.is_ok()
}

/// Next text frame decoded as `T`; `None` once the peer is gone.
async fn recv_json<T: serde::de::DeserializeOwned>(socket: &mut WebSocket) -> Option<T> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn command_tunnel(ws: WebSocketUpgrade, headers: HeaderMap, State(cp): State<FakeControlPlane>) -> Response {
    cp.connected("command", &headers);
    ws.on_upgrade(move |mut socket| async move {
        let n = cp.command_connections.fetch_add(1, Ordering::SeqCst);
        let script = cp.script(n);
        for request in &script.requests {
            if !send_json(&mut socket, request).await {
                return;
            }
            match recv_json::<ExecuteResponse>(&mut socket).await {
                Some(response) => {
                    let _ = cp.seen.send(Seen::Response(response));
                }
                None => return,
            }
        }
        cp.commands_done.notify_one();
        if script.hang_up {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        while recv_json::<serde_json::Value>(&mut socket).await.is_some() {}
    })
}

async fn event_tunnel(ws: WebSocketUpgrade, headers: HeaderMap, State(cp): State<FakeControlPlane>) -> Response {
    cp.connected("events", &headers);
    ws.on_upgrade(move |mut socket| async move {
        while let Some(frame) = recv_json::<EventFrame>(&mut socket).await {
            let _ = cp.seen.send(Seen::Event(frame));
        }
        let _ = cp.seen.send(Seen::Closed("events"));
    })
}

async fn log_tunnel(ws: WebSocketUpgrade, headers: HeaderMap, State(cp): State<FakeControlPlane>) -> Response {
    cp.connected("logs", &headers);
    ws.on_upgrade(move |mut socket| async move {
        if !cp.log_requests.is_empty() {
            cp.commands_done.notified().await;
            for request in cp.log_requests.iter() {
                if !send_json(&mut socket, request).await {
                    return;
                }
            }
        }
        while let Some(frame) = recv_json::<StreamFrame<LogLine>>(&mut socket).await {
            let _ = cp.seen.send(Seen::LogFrame(frame));
        }
        let _ = cp.seen.send(Seen::Closed("logs"));
    })
}

async fn notification_tunnel(ws: WebSocketUpgrade, headers: HeaderMap, State(cp): State<FakeControlPlane>) -> Response {
    cp.connected("notifications", &headers);
    ws.on_upgrade(move |mut socket| async move {
        while recv_json::<serde_json::Value>(&mut socket).await.is_some() {}
        let _ = cp.seen.send(Seen::Closed("notifications"));
    })
}

/// Start the fake on a loopback port; returns its base URL and observations.
async fn start_control_plane(
    scripts: Vec<CommandScript>,
    log_requests: Vec<StreamRequest>,
) -> (String, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cp = FakeControlPlane {
        seen: tx,
        scripts: Arc::new(Mutex::new(scripts)),
        command_connections: Arc::new(AtomicUsize::new(0)),
        log_requests: Arc::new(log_requests),
        commands_done: Arc::new(Notify::new()),
    };
    let app = Router::new()
        .route("/agent/v1/execute", get(command_tunnel))
        .route("/agent/v1/events", get(event_tunnel))
        .route("/agent/v1/logs", get(log_tunnel))
        .route("/agent/v1/notifications", get(notification_tunnel))
        .with_state(cp);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}"), rx)
}

// ============================================================================
// Agent under test
// ============================================================================

struct RunningAgent {
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), TunnelError>>,
    status: Arc<AgentStatus>,
}

fn start_agent(url: &str) -> RunningAgent {
    let mut config = Config::default();
    config.control_plane.url = url.to_string();
    config.control_plane.insecure = true;
    config.control_plane.api_key = "tkcagnt_test".into();
    config.control_plane.runner_id = "runner-1".into();
    config.tunnel.reconnect_delay_secs = 1;
    let config = Arc::new(config);

    let (events, event_rx) = event_queue(16);
    let hub = Arc::new(ExecutionHub::default());
    let status = Arc::new(AgentStatus::new());
    let state = AppState::new(config.clone(), hub.clone(), events, status.clone());
    let agent = Agent::new(&config, routes::router(state), event_rx, hub.clone(), hub)
        .with_status(status.clone());

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { agent.run(token).await });
    RunningAgent { cancel, handle, status }
}

/// Pull observations until `pick` returns `Some`, failing after 15 seconds.
async fn wait_for<T>(rx: &mut mpsc::UnboundedReceiver<Seen>, mut pick: impl FnMut(Seen) -> Option<T>) -> T {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let seen = rx.recv().await.expect("control plane gone");
            if let Some(found) = pick(seen) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for the agent")
}

fn command(id: &str, method: &str, url: &str, body: Option<serde_json::Value>) -> ExecuteRequest {
    ExecuteRequest {
        message_id: id.into(),
        method: method.into(),
        url: url.into(),
        headers: body
            .as_ref()
            .map(|_| [("content-type".to_string(), vec!["application/json".to_string()])].into())
            .unwrap_or_default(),
        body: body.map(|b| b.to_string().into_bytes()).unwrap_or_default(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn command_stream_failure_takes_down_the_session_and_reconnects() {
    let scripts = vec![
        CommandScript {
            requests: vec![command("hs-1", "", HEALTHCHECK_COMMAND, None)],
            hang_up: true,
        },
        CommandScript {
            requests: vec![command("health-1", "GET", "/health", None)],
            hang_up: false,
        },
    ];
    let (url, mut seen) = start_control_plane(scripts, Vec::new()).await;
    let agent = start_agent(&url);

    let (api_key, runner_id) = wait_for(&mut seen, |s| match s {
        Seen::Connected { tunnel: "logs", api_key, runner_id } => Some((api_key, runner_id)),
        _ => None,
    })
    .await;
    assert_eq!(api_key, "tkcagnt_test");
    assert_eq!(runner_id.as_deref(), Some("runner-1"));

    let response = wait_for(&mut seen, |s| match s {
        Seen::Response(r) => Some(r),
        _ => None,
    })
    .await;
    assert_eq!(response.message_id, "hs-1");
    assert_eq!(response.status, 0);

    // The control plane hung up the command stream: the sibling streams of
    // the same session must be torn down too.
    wait_for(&mut seen, |s| matches!(s, Seen::Closed("events")).then_some(())).await;

    let response = wait_for(&mut seen, |s| match s {
        Seen::Response(r) => Some(r),
        _ => None,
    })
    .await;
    assert_eq!(response.message_id, "health-1");
    assert_eq!(response.status, 200);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connected"], true);
    assert!(agent.status.reconnects.load(Ordering::Relaxed) >= 1);

    agent.cancel.cancel();
    let result = agent.handle.await.unwrap();
    assert!(result.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn execution_output_flows_through_every_tunnel() {
    let scripts = vec![CommandScript {
        requests: vec![
            command("m1", "POST", "/v1/executions/e1", None),
            command(
                "m2",
                "POST",
                "/v1/executions/e1/logs",
                Some(json!({"lines": ["hello", "world"]})),
            ),
            command("m3", "POST", "/v1/executions/e1/finish", None),
        ],
        hang_up: false,
    }];
    let log_requests = vec![
        StreamRequest {
            stream_id: "hc".into(),
            execution_id: String::new(),
            request_type: StreamRequestType::Healthcheck,
        },
        StreamRequest {
            stream_id: "s1".into(),
            execution_id: "e1".into(),
            request_type: StreamRequestType::Normal,
        },
    ];
    let (url, mut seen) = start_control_plane(scripts, log_requests).await;
    let agent = start_agent(&url);

    let mut statuses = Vec::new();
    let mut log_frames = Vec::new();
    let mut event_types = Vec::new();
    wait_for(&mut seen, |s| {
        match s {
            Seen::Response(r) => statuses.push((r.message_id, r.status)),
            Seen::LogFrame(f) => log_frames.push(f),
            Seen::Event(frame) if frame.opcode == Opcode::Text => {
                let event: Event = serde_json::from_slice(&frame.body).unwrap();
                event_types.push(event.event_type);
            }
            _ => {}
        }
        (statuses.len() == 3 && log_frames.len() == 3 && event_types.len() == 2).then_some(())
    })
    .await;

    assert_eq!(
        statuses,
        vec![("m1".to_string(), 201), ("m2".to_string(), 202), ("m3".to_string(), 200)]
    );
    assert_eq!(event_types, vec!["execution-started", "execution-finished"]);

    let healthcheck: Vec<_> = log_frames.iter().filter(|f| f.stream_id == "hc").collect();
    assert_eq!(healthcheck.len(), 1);
    assert_eq!(healthcheck[0].seq_no, 0);
    assert_eq!(healthcheck[0].payload, LogLine::default());

    let lines: Vec<(u32, &str)> = log_frames
        .iter()
        .filter(|f| f.stream_id == "s1")
        .map(|f| (f.seq_no, f.payload.0.as_str()))
        .collect();
    assert_eq!(lines, vec![(0, "hello"), (1, "world")]);
    assert!(log_frames.iter().all(|f| !f.is_error));

    agent.cancel.cancel();
    assert!(agent.handle.await.unwrap().unwrap_err().is_cancelled());
}
