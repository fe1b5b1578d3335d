//! Generic stream relay.
//!
//! One relay tunnel multiplexes many logical push-streams. The control plane
//! sends [`StreamRequest`]s; a bounded pool of workers resolves each to a
//! [`PushSource`] stream and forwards its items as [`StreamFrame`]s. All
//! frames funnel through a single sender task, so frames of different streams
//! interleave but each stream's `seq_no` increases by one from 0.
//!
//! The same machinery serves pod logs and workflow notifications; only the
//! payload type and the source differ.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures_util::{Sink, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::group::TaskGroup;
use super::protocol::{format_timestamp, FramePayload, StreamFrame, StreamRequest};
use super::timed::{recv_json_untimed, send_json};
use super::TunnelTimeouts;
use crate::config::TunnelConfig;
use crate::error::{SourceError, TunnelError};

/// Queue slots per worker for both the request and the response queue.
pub const BUFFER_PER_WORKER: usize = 5;

/// Resolves an execution to a finite, ordered stream of payloads.
///
/// Resolution may fail transiently (the execution is not visible yet); the
/// relay retries before reporting an error frame.
pub trait PushSource<P>: Send + Sync {
    fn open<'a>(
        &'a self,
        execution_id: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'static, P>, SourceError>>;
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub workers: usize,
    pub timeouts: TunnelTimeouts,
    pub resolve_attempts: u32,
    pub resolve_retry_delay: Duration,
    /// What the source yields, for error frames ("pod logs").
    pub what: &'static str,
}

impl RelayOptions {
    pub fn from_config(config: &TunnelConfig, workers: usize, what: &'static str) -> Self {
        Self {
            workers,
            timeouts: TunnelTimeouts::from_config(config),
            resolve_attempts: config.resolve_attempts,
            resolve_retry_delay: config.resolve_retry_delay(),
            what,
        }
    }
}

pub struct StreamRelay<P> {
    name: &'static str,
    source: Arc<dyn PushSource<P>>,
    options: RelayOptions,
}

impl<P> Clone for StreamRelay<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            source: self.source.clone(),
            options: self.options.clone(),
        }
    }
}

impl<P: FramePayload> StreamRelay<P> {
    pub fn new(name: &'static str, source: Arc<dyn PushSource<P>>, options: RelayOptions) -> Self {
        Self {
            name,
            source,
            options,
        }
    }

    /// Serve the relay on `stream` until a wire error or cancellation.
    pub async fn run<S>(&self, stream: S, cancel: CancellationToken) -> Result<(), TunnelError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let workers = self.options.workers.max(1);
        let capacity = BUFFER_PER_WORKER * workers;
        let (sink, stream) = stream.split();
        let (request_tx, request_rx) = mpsc::channel::<StreamRequest>(capacity);
        let (frame_tx, frame_rx) = mpsc::channel::<StreamFrame<P>>(capacity);
        let request_rx = Arc::new(Mutex::new(request_rx));
        let timeouts = self.options.timeouts;

        info!(relay = self.name, workers, "stream relay started");

        let mut group = TaskGroup::new(&cancel);
        group.spawn(
            "relay-receiver",
            receive_requests(stream, request_tx, group.token()),
        );
        for _ in 0..workers {
            let worker = self.clone();
            let requests = request_rx.clone();
            let frames = frame_tx.clone();
            let token = group.token();
            group.spawn("relay-worker", async move {
                worker.work(requests, frames, token).await
            });
        }
        drop(frame_tx);
        group.spawn(
            "relay-sender",
            send_frames(sink, frame_rx, timeouts.send, group.token()),
        );

        let result = group.wait().await;
        info!(relay = self.name, "stream relay stopped");
        result
    }

    async fn work(
        &self,
        requests: Arc<Mutex<mpsc::Receiver<StreamRequest>>>,
        frames: mpsc::Sender<StreamFrame<P>>,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        loop {
            let request = {
                let mut rx = tokio::select! {
                    () = cancel.cancelled() => return Err(TunnelError::Cancelled),
                    guard = requests.lock() => guard,
                };
                tokio::select! {
                    () = cancel.cancelled() => return Err(TunnelError::Cancelled),
                    next = rx.recv() => match next {
                        Some(request) => request,
                        None => return Ok(()),
                    },
                }
            };

            if request.is_healthcheck() {
                let reply = StreamFrame {
                    stream_id: request.stream_id,
                    seq_no: 0,
                    payload: P::empty(),
                    is_error: false,
                };
                push(&frames, reply, &cancel).await?;
                continue;
            }

            self.serve(request, &frames, &cancel).await?;
        }
    }

    /// Forward every item of one logical stream. Only wire-level problems
    /// are returned; source failures become an error frame.
    async fn serve(
        &self,
        request: StreamRequest,
        frames: &mpsc::Sender<StreamFrame<P>>,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let mut items = match self.resolve(&request, cancel).await? {
            Ok(items) => items,
            Err(e) => {
                warn!(
                    relay = self.name,
                    stream_id = %request.stream_id,
                    execution_id = %request.execution_id,
                    attempts = self.options.resolve_attempts,
                    error = %e,
                    "cannot resolve push source"
                );
                let message = format!(
                    "{} cannot get {}: {e}",
                    format_timestamp(Utc::now()),
                    self.options.what
                );
                let frame = StreamFrame {
                    stream_id: request.stream_id,
                    seq_no: 0,
                    payload: P::error(message),
                    is_error: true,
                };
                return push(frames, frame, cancel).await;
            }
        };

        let mut sequence = Sequence::default();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Err(TunnelError::Cancelled),
                next = items.next() => next,
            };
            let Some(payload) = next else {
                debug!(
                    relay = self.name,
                    stream_id = %request.stream_id,
                    frames = sequence.issued(),
                    "push stream finished"
                );
                return Ok(());
            };
            let frame = match sequence.next() {
                Some(seq_no) => StreamFrame {
                    stream_id: request.stream_id.clone(),
                    seq_no,
                    payload,
                    is_error: false,
                },
                None => {
                    warn!(relay = self.name, stream_id = %request.stream_id, "sequence numbers exhausted");
                    let frame = StreamFrame {
                        stream_id: request.stream_id,
                        seq_no: Sequence::LAST,
                        payload: P::error(format!(
                            "{} {} stream too long, sequence numbers exhausted",
                            format_timestamp(Utc::now()),
                            self.options.what
                        )),
                        is_error: true,
                    };
                    return push(frames, frame, cancel).await;
                }
            };
            push(frames, frame, cancel).await?;
        }
    }

    /// Retry resolution while it keeps failing, up to the configured number
    /// of attempts. The outer error is cancellation only.
    async fn resolve(
        &self,
        request: &StreamRequest,
        cancel: &CancellationToken,
    ) -> Result<Result<BoxStream<'static, P>, SourceError>, TunnelError> {
        let attempts = self.options.resolve_attempts.max(1);
        let mut attempt = 1;
        loop {
            let opened = tokio::select! {
                () = cancel.cancelled() => return Err(TunnelError::Cancelled),
                opened = self.source.open(&request.execution_id) => opened,
            };
            match opened {
                Ok(items) => return Ok(Ok(items)),
                Err(e) if attempt >= attempts => return Ok(Err(e)),
                Err(e) => debug!(
                    relay = self.name,
                    stream_id = %request.stream_id,
                    execution_id = %request.execution_id,
                    attempt,
                    error = %e,
                    "push source not ready, retrying"
                ),
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(TunnelError::Cancelled),
                () = tokio::time::sleep(self.options.resolve_retry_delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Per-stream sequence numbers. Data frames get `0..LAST`; `LAST` is kept
/// for the error frame that ends an exhausted stream.
#[derive(Debug, Default)]
struct Sequence {
    next: u32,
}

impl Sequence {
    const LAST: u32 = u32::MAX;

    fn next(&mut self) -> Option<u32> {
        if self.next == Self::LAST {
            return None;
        }
        let seq_no = self.next;
        self.next += 1;
        Some(seq_no)
    }

    fn issued(&self) -> u32 {
        self.next
    }
}

async fn push<P>(
    frames: &mpsc::Sender<StreamFrame<P>>,
    frame: StreamFrame<P>,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    tokio::select! {
        () = cancel.cancelled() => Err(TunnelError::Cancelled),
        sent = frames.send(frame) => sent.map_err(|_| TunnelError::Cancelled),
    }
}

/// Stream requests arrive only when someone asks for output, so an idle
/// relay has no receive deadline.
async fn receive_requests<R>(
    mut stream: R,
    requests: mpsc::Sender<StreamRequest>,
    cancel: CancellationToken,
) -> Result<(), TunnelError>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let request: StreamRequest = recv_json_untimed(&mut stream, &cancel).await?;
        tokio::select! {
            () = cancel.cancelled() => return Err(TunnelError::Cancelled),
            sent = requests.send(request) => sent.map_err(|_| TunnelError::Cancelled)?,
        }
    }
}

async fn send_frames<W, P>(
    mut sink: W,
    mut frames: mpsc::Receiver<StreamFrame<P>>,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), TunnelError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
    P: FramePayload,
{
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return Err(TunnelError::Cancelled),
            next = frames.recv() => match next {
                Some(frame) => frame,
                None => return Err(TunnelError::Cancelled),
            },
        };
        send_json(&mut sink, &frame, timeout, &cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use futures_util::SinkExt;

    use super::*;
    use crate::tunnel::protocol::{LogLine, StreamRequestType};
    use crate::tunnel::testing::{ws_pair, TestWs};
    use crate::tunnel::timed::recv_json;

    /// Fails the first `failures` opens, then yields `lines` items per stream.
    struct FakeSource {
        failures: u32,
        calls: AtomicU32,
        lines: usize,
        item_delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl FakeSource {
        fn new(failures: u32, lines: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                lines,
                item_delay: Duration::ZERO,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }
    }

    impl PushSource<LogLine> for Arc<FakeSource> {
        fn open<'a>(
            &'a self,
            execution_id: &'a str,
        ) -> BoxFuture<'a, Result<BoxStream<'static, LogLine>, SourceError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= self.failures {
                    return Err(SourceError::NotFound(execution_id.to_string()));
                }
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(active, Ordering::SeqCst);

                let source = Arc::clone(self);
                let id = execution_id.to_string();
                let lines = self.lines;
                let delay = self.item_delay;
                let stream = futures::stream::unfold(0usize, move |i| {
                    let source = source.clone();
                    let id = id.clone();
                    async move {
                        if i == lines {
                            source.active.fetch_sub(1, Ordering::SeqCst);
                            return None;
                        }
                        tokio::time::sleep(delay).await;
                        Some((LogLine(format!("{id}:{i}")), i + 1))
                    }
                });
                Ok(stream.boxed())
            })
        }
    }

    fn options(workers: usize) -> RelayOptions {
        RelayOptions {
            workers,
            timeouts: TunnelTimeouts {
                send: Duration::from_secs(5),
                receive: Duration::from_secs(300),
            },
            resolve_attempts: 10,
            resolve_retry_delay: Duration::from_millis(100),
            what: "pod logs",
        }
    }

    fn start(
        source: Arc<FakeSource>,
        workers: usize,
        client: TestWs,
    ) -> (CancellationToken, tokio::task::JoinHandle<Result<(), TunnelError>>) {
        let source: Arc<dyn PushSource<LogLine>> = Arc::new(source);
        let relay = StreamRelay::new("logs", source, options(workers));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { relay.run(client, token).await });
        (cancel, handle)
    }

    async fn request(server: &mut TestWs, stream_id: &str, execution_id: &str) {
        let req = StreamRequest {
            stream_id: stream_id.into(),
            execution_id: execution_id.into(),
            request_type: StreamRequestType::Normal,
        };
        send_json(server, &req, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
    }

    async fn frame(server: &mut TestWs) -> StreamFrame<LogLine> {
        recv_json(server, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn healthcheck_gets_an_empty_frame_without_touching_the_source() {
        let source = FakeSource::new(0, 3);
        let (client, mut server) = ws_pair(64 * 1024).await;
        let (cancel, _relay) = start(source.clone(), 2, client);

        let ping = StreamRequest {
            stream_id: "hc".into(),
            execution_id: "hc".into(),
            request_type: StreamRequestType::Healthcheck,
        };
        send_json(&mut server, &ping, Duration::from_secs(5), &cancel).await.unwrap();

        let reply = frame(&mut server).await;
        assert_eq!(reply.stream_id, "hc");
        assert_eq!(reply.seq_no, 0);
        assert_eq!(reply.payload, LogLine::default());
        assert!(!reply.is_error);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn sequence_numbers_are_dense_per_stream() {
        let source = FakeSource::new(0, 4);
        let (client, mut server) = ws_pair(64 * 1024).await;
        let (cancel, _relay) = start(source, 3, client);

        for (stream_id, execution_id) in [("s1", "e1"), ("s2", "e2"), ("s3", "e3")] {
            request(&mut server, stream_id, execution_id).await;
        }

        let mut seen: HashMap<String, Vec<(u32, String)>> = HashMap::new();
        for _ in 0..12 {
            let f = frame(&mut server).await;
            assert!(!f.is_error);
            seen.entry(f.stream_id).or_default().push((f.seq_no, f.payload.0));
        }

        for (stream_id, execution_id) in [("s1", "e1"), ("s2", "e2"), ("s3", "e3")] {
            let expected: Vec<(u32, String)> =
                (0..4).map(|i| (i, format!("{execution_id}:{i}"))).collect();
            assert_eq!(seen[stream_id], expected);
        }
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_succeeds_on_the_last_attempt() {
        let source = FakeSource::new(9, 1);
        let (client, mut server) = ws_pair(64 * 1024).await;
        let (cancel, _relay) = start(source.clone(), 1, client);

        request(&mut server, "s1", "late").await;
        let f = frame(&mut server).await;
        assert!(!f.is_error);
        assert_eq!(f.payload, LogLine::from("late:0"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 10);
        cancel.cancel();
    }

    #[tokio::test]
    async fn first_successful_resolution_is_not_retried() {
        let source = FakeSource::new(0, 1);
        let (client, mut server) = ws_pair(64 * 1024).await;
        let (cancel, _relay) = start(source.clone(), 1, client);

        request(&mut server, "s1", "e1").await;
        let f = frame(&mut server).await;
        assert_eq!(f.seq_no, 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_resolution_sends_one_error_frame() {
        let source = FakeSource::new(u32::MAX, 1);
        let (client, mut server) = ws_pair(64 * 1024).await;
        let (cancel, _relay) = start(source.clone(), 1, client);

        request(&mut server, "s1", "missing").await;
        let f = frame(&mut server).await;
        assert_eq!(f.stream_id, "s1");
        assert_eq!(f.seq_no, 0);
        assert!(f.is_error);
        assert!(f.payload.0.contains("cannot get pod logs: execution missing not found"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 10);

        // The worker is free again and nothing else was queued for "s1".
        let ping = StreamRequest {
            stream_id: "hc".into(),
            execution_id: String::new(),
            request_type: StreamRequestType::Healthcheck,
        };
        send_json(&mut server, &ping, Duration::from_secs(5), &cancel).await.unwrap();
        assert_eq!(frame(&mut server).await.stream_id, "hc");
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_streams_are_bounded_by_the_pool() {
        let source = Arc::new(FakeSource {
            item_delay: Duration::from_millis(50),
            ..Arc::into_inner(FakeSource::new(0, 3)).unwrap()
        });
        let (client, mut server) = ws_pair(64 * 1024).await;
        let (cancel, _relay) = start(source.clone(), 2, client);

        for i in 0..6 {
            request(&mut server, &format!("s{i}"), &format!("e{i}")).await;
        }
        for _ in 0..18 {
            frame(&mut server).await;
        }
        assert_eq!(source.max_active.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[test]
    fn sequence_stops_before_reusing_a_number() {
        let mut sequence = Sequence {
            next: Sequence::LAST - 2,
        };
        assert_eq!(sequence.next(), Some(Sequence::LAST - 2));
        assert_eq!(sequence.next(), Some(Sequence::LAST - 1));
        assert_eq!(sequence.next(), None);
        assert_eq!(sequence.next(), None);
        assert_eq!(sequence.issued(), Sequence::LAST);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_relay_has_no_receive_deadline() {
        let source = FakeSource::new(0, 1);
        let (client, mut server) = ws_pair(64 * 1024).await;
        let (cancel, relay) = start(source, 1, client);

        tokio::time::sleep(options(1).timeouts.receive * 4).await;
        assert!(!relay.is_finished());

        request(&mut server, "s1", "e1").await;
        let f = frame(&mut server).await;
        assert_eq!(f.payload, LogLine::from("e1:0"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn peer_close_is_fatal_to_the_relay() {
        let source = FakeSource::new(0, 1);
        let (client, mut server) = ws_pair(4096).await;
        let (_cancel, relay) = start(source, 2, client);

        server.close(None).await.unwrap();
        let err = relay.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::StreamClosed | TunnelError::Transport(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_every_task() {
        let source = FakeSource::new(0, 1);
        let (client, _server) = ws_pair(4096).await;
        let (cancel, relay) = start(source, 4, client);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), relay).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
