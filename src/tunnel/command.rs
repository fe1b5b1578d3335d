//! Command tunnel: the control plane invokes the local request handler.
//!
//! Requests are handled one at a time, in arrival order, on the task that
//! reads them. Every reply echoes the request's `message_id`.

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::{HeaderValue, Method, Request, StatusCode, Uri};
use axum::Router;
use futures_util::{Sink, Stream};
use http_body_util::BodyExt;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, warn};

use super::protocol::{ExecuteRequest, ExecuteResponse, HeaderMultimap, HEALTHCHECK_COMMAND};
use super::timed::{recv_json, send_json};
use super::TunnelTimeouts;
use crate::error::TunnelError;

/// Serve commands until the stream fails, times out or `cancel` fires.
/// A handler still running when `cancel` fires is dropped unanswered.
pub async fn run_command_tunnel<S>(
    mut stream: S,
    handler: Router,
    timeouts: TunnelTimeouts,
    cancel: CancellationToken,
) -> Result<(), TunnelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    loop {
        let request: ExecuteRequest = recv_json(&mut stream, timeouts.receive, &cancel).await?;
        debug!(
            message_id = %request.message_id,
            method = %request.method,
            url = %request.url,
            "command received"
        );
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(TunnelError::Cancelled),
            response = execute_command(&handler, request) => response,
        };
        send_json(&mut stream, &response, timeouts.send, &cancel).await?;
    }
}

/// Run one command against `handler`. Never fails: handler-level problems
/// become the response status.
pub async fn execute_command(handler: &Router, command: ExecuteRequest) -> ExecuteResponse {
    if command.url == HEALTHCHECK_COMMAND {
        return ExecuteResponse {
            message_id: command.message_id,
            status: 0,
            ..ExecuteResponse::default()
        };
    }

    let request = match local_request(&command) {
        Ok(request) => request,
        Err(reason) => {
            warn!(message_id = %command.message_id, url = %command.url, %reason, "rejecting command");
            return ExecuteResponse {
                message_id: command.message_id,
                status: i64::from(StatusCode::BAD_REQUEST.as_u16()),
                headers: HeaderMultimap::new(),
                body: reason.into_bytes(),
            };
        }
    };

    let response = match handler.clone().oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let (parts, body) = response.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(e) => {
            warn!(message_id = %command.message_id, error = %e, "failed to read handler response body");
            return ExecuteResponse {
                message_id: command.message_id,
                status: i64::from(StatusCode::INTERNAL_SERVER_ERROR.as_u16()),
                headers: HeaderMultimap::new(),
                body: format!("cannot read response body: {e}").into_bytes(),
            };
        }
    };

    let mut headers = HeaderMultimap::new();
    for (name, value) in &parts.headers {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    ExecuteResponse {
        message_id: command.message_id,
        status: i64::from(parts.status.as_u16()),
        headers,
        body,
    }
}

/// Synthesize the in-process request. An empty method means GET.
fn local_request(command: &ExecuteRequest) -> Result<Request<Body>, String> {
    let uri: Uri = command
        .url
        .parse()
        .map_err(|e| format!("bad command url: {e}"))?;
    let method = if command.method.is_empty() {
        Method::GET
    } else {
        Method::from_bytes(command.method.as_bytes())
            .map_err(|e| format!("bad command method: {e}"))?
    };

    let mut builder = Request::builder().method(method).uri(uri);
    for (name, values) in &command.headers {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    let mut request = builder
        .body(Body::from(command.body.clone()))
        .map_err(|e| format!("bad command header: {e}"))?;
    request
        .headers_mut()
        .entry(HOST)
        .or_insert(HeaderValue::from_static("localhost"));
    Ok(request)
}
