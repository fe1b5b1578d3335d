//! Deadline- and cancellation-aware send/receive on a tunnel stream.
//!
//! Every blocking wire operation goes through here, so a suspended task
//! always wakes up on completion or cancellation, and on timeout where a
//! deadline applies. A slow peer is treated exactly like a dead one.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;

/// Send one message, failing with [`TunnelError::SendTimeout`] past `timeout`.
pub async fn send_timed<S>(
    sink: &mut S,
    msg: Message,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), TunnelError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    tokio::select! {
        () = cancel.cancelled() => Err(TunnelError::Cancelled),
        sent = tokio::time::timeout(timeout, sink.send(msg)) => match sent {
            Ok(result) => result.map_err(TunnelError::from),
            Err(_) => Err(TunnelError::SendTimeout(timeout)),
        },
    }
}

/// Receive the next message of any kind, failing with
/// [`TunnelError::ReceiveTimeout`] when nothing arrives within `timeout`.
pub async fn recv_timed<S>(
    stream: &mut S,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Message, TunnelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    tokio::select! {
        () = cancel.cancelled() => Err(TunnelError::Cancelled),
        next = tokio::time::timeout(timeout, stream.next()) => match next {
            Ok(Some(msg)) => Ok(msg?),
            Ok(None) => Err(TunnelError::StreamClosed),
            Err(_) => Err(TunnelError::ReceiveTimeout(timeout)),
        },
    }
}

/// Serialize `frame` as a JSON text message and send it with [`send_timed`].
pub async fn send_json<S, T>(
    sink: &mut S,
    frame: &T,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), TunnelError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
    T: Serialize,
{
    let text = serde_json::to_string(frame).map_err(TunnelError::Encode)?;
    send_timed(sink, Message::Text(text.into()), timeout, cancel).await
}

/// Receive the next data frame and decode it as JSON.
///
/// Control frames (ping/pong) count as liveness: each one restarts the
/// receive deadline. A close frame ends the stream.
pub async fn recv_json<S, T>(
    stream: &mut S,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, TunnelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    T: DeserializeOwned,
{
    loop {
        if let Some(frame) = decode(recv_timed(stream, timeout, cancel).await?) {
            return frame;
        }
    }
}

/// Like [`recv_json`] but without a deadline: waits for a frame, stream
/// end or cancellation. For peers that may legitimately stay silent.
pub async fn recv_json_untimed<S, T>(
    stream: &mut S,
    cancel: &CancellationToken,
) -> Result<T, TunnelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    T: DeserializeOwned,
{
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => return Err(TunnelError::Cancelled),
            next = stream.next() => match next {
                Some(msg) => msg?,
                None => return Err(TunnelError::StreamClosed),
            },
        };
        if let Some(frame) = decode(msg) {
            return frame;
        }
    }
}

/// `None` for control frames.
fn decode<T: DeserializeOwned>(msg: Message) -> Option<Result<T, TunnelError>> {
    match msg {
        Message::Text(text) => Some(serde_json::from_str(&text).map_err(TunnelError::Decode)),
        Message::Binary(data) => Some(serde_json::from_slice(&data).map_err(TunnelError::Decode)),
        Message::Close(_) => Some(Err(TunnelError::StreamClosed)),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}
