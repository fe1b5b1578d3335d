//! In-memory execution output hub.
//!
//! Each registered execution owns two sequenced ring buffers: log lines and
//! workflow notifications. The hub is the agent's [`PushSource`] for both
//! relays: opening a source replays what is still buffered and then follows
//! new entries until the execution is finished.
//!
//! Subscribers are woken through a per-buffer [`Notify`]; the wait is armed
//! while the buffer lock is held so an append can never slip between the
//! check and the wait.
//!
//! Finished executions are kept for late readers up to a fixed count, oldest
//! evicted first. An open follower holds its buffer, so eviction never cuts
//! a stream short.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

use crate::error::SourceError;
use crate::tunnel::protocol::{ExecutionNotification, LogLine, Notification};
use crate::tunnel::relay::PushSource;

/// Entries kept per buffer before the oldest are evicted.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Finished executions retained before the oldest is dropped.
pub const DEFAULT_MAX_FINISHED: usize = 100;

/// Ring buffer of sequenced items with subscriber notification.
pub struct OutputBuffer<T> {
    entries: VecDeque<(u64, T)>,
    next_seq: u64,
    max_entries: usize,
    finished: bool,
    notify: Arc<Notify>,
}

impl<T: Clone> OutputBuffer<T> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            next_seq: 1,
            max_entries: max_entries.max(1),
            finished: false,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append, evicting the oldest entry if full, and wake all waiters.
    pub fn push(&mut self, item: T) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back((self.next_seq, item));
        self.next_seq += 1;
        self.notify.notify_waiters();
    }

    /// Entries with `seq > since`, and the sequence number to resume from.
    pub fn read_since(&self, since: u64) -> (Vec<T>, u64) {
        let items: Vec<T> = self
            .entries
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(_, item)| item.clone())
            .collect();
        let last = self.entries.back().map_or(since, |(seq, _)| (*seq).max(since));
        (items, last)
    }

    pub fn finish(&mut self) {
        self.finished = true;
        self.notify.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

struct ExecutionRecord {
    logs: Arc<Mutex<OutputBuffer<LogLine>>>,
    notifications: Arc<Mutex<OutputBuffer<ExecutionNotification>>>,
}

impl ExecutionRecord {
    fn new(max_entries: usize) -> Self {
        Self {
            logs: Arc::new(Mutex::new(OutputBuffer::new(max_entries))),
            notifications: Arc::new(Mutex::new(OutputBuffer::new(max_entries))),
        }
    }
}

/// Summary of one execution, for the local API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionSummary {
    pub id: String,
    pub log_lines: usize,
    pub notifications: usize,
    pub finished: bool,
}

#[derive(Default)]
struct Executions {
    records: HashMap<String, ExecutionRecord>,
    /// Finished ids, oldest first.
    finished: VecDeque<String>,
}

pub struct ExecutionHub {
    executions: RwLock<Executions>,
    max_entries: usize,
    max_finished: usize,
}

impl Default for ExecutionHub {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl ExecutionHub {
    pub fn new(max_entries: usize) -> Self {
        Self::with_retention(max_entries, DEFAULT_MAX_FINISHED)
    }

    pub fn with_retention(max_entries: usize, max_finished: usize) -> Self {
        Self {
            executions: RwLock::new(Executions::default()),
            max_entries,
            max_finished,
        }
    }

    /// Register an execution. Returns `false` if it already existed.
    pub async fn register(&self, id: &str) -> bool {
        let mut executions = self.executions.write().await;
        if executions.records.contains_key(id) {
            return false;
        }
        executions
            .records
            .insert(id.to_string(), ExecutionRecord::new(self.max_entries));
        debug!(execution_id = id, "execution registered");
        true
    }

    /// Forget an execution. Open followers keep their buffer and end once it
    /// is finished.
    pub async fn remove(&self, id: &str) -> Result<(), SourceError> {
        let mut executions = self.executions.write().await;
        let record = executions
            .records
            .remove(id)
            .ok_or_else(|| SourceError::NotFound(id.to_string()))?;
        executions.finished.retain(|f| f != id);
        record.logs.lock().await.finish();
        record.notifications.lock().await.finish();
        debug!(execution_id = id, "execution removed");
        Ok(())
    }

    pub async fn append_logs(&self, id: &str, lines: Vec<LogLine>) -> Result<usize, SourceError> {
        let buffer = self.buffer(id, |r| r.logs.clone()).await?;
        let mut buffer = buffer.lock().await;
        if buffer.is_finished() {
            return Err(SourceError::Finished(id.to_string()));
        }
        let count = lines.len();
        for line in lines {
            buffer.push(line);
        }
        Ok(count)
    }

    pub async fn append_notifications(
        &self,
        id: &str,
        notifications: Vec<ExecutionNotification>,
    ) -> Result<usize, SourceError> {
        let buffer = self.buffer(id, |r| r.notifications.clone()).await?;
        let mut buffer = buffer.lock().await;
        if buffer.is_finished() {
            return Err(SourceError::Finished(id.to_string()));
        }
        let count = notifications.len();
        for notification in notifications {
            buffer.push(notification);
        }
        Ok(count)
    }

    /// Mark an execution finished: open sources drain and end. May evict
    /// the oldest finished executions past the retention limit.
    pub async fn finish(&self, id: &str) -> Result<(), SourceError> {
        let mut executions = self.executions.write().await;
        let record = executions
            .records
            .get(id)
            .ok_or_else(|| SourceError::NotFound(id.to_string()))?;
        let newly_finished = !record.logs.lock().await.is_finished();
        record.logs.lock().await.finish();
        record.notifications.lock().await.finish();
        debug!(execution_id = id, "execution finished");

        if newly_finished {
            executions.finished.push_back(id.to_string());
        }
        while executions.finished.len() > self.max_finished {
            let Some(oldest) = executions.finished.pop_front() else {
                break;
            };
            executions.records.remove(&oldest);
            debug!(execution_id = %oldest, "finished execution evicted");
        }
        Ok(())
    }

    pub async fn summary(&self, id: &str) -> Option<ExecutionSummary> {
        let executions = self.executions.read().await;
        let record = executions.records.get(id)?;
        let logs = record.logs.lock().await;
        let notifications = record.notifications.lock().await;
        Some(ExecutionSummary {
            id: id.to_string(),
            log_lines: logs.len(),
            notifications: notifications.len(),
            finished: logs.is_finished(),
        })
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.records.is_empty()
    }

    pub async fn follow_logs(&self, id: &str) -> Result<BoxStream<'static, LogLine>, SourceError> {
        let buffer = self.buffer(id, |r| r.logs.clone()).await?;
        Ok(follow(buffer))
    }

    pub async fn follow_notifications(
        &self,
        id: &str,
    ) -> Result<BoxStream<'static, Notification>, SourceError> {
        let buffer = self.buffer(id, |r| r.notifications.clone()).await?;
        Ok(follow(buffer).map(Notification::from).boxed())
    }

    async fn buffer<T>(
        &self,
        id: &str,
        pick: impl FnOnce(&ExecutionRecord) -> Arc<Mutex<OutputBuffer<T>>>,
    ) -> Result<Arc<Mutex<OutputBuffer<T>>>, SourceError> {
        let executions = self.executions.read().await;
        executions
            .records
            .get(id)
            .map(pick)
            .ok_or_else(|| SourceError::NotFound(id.to_string()))
    }
}

/// Replay buffered entries, then follow new ones until the buffer finishes.
fn follow<T>(buffer: Arc<Mutex<OutputBuffer<T>>>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    futures::stream::unfold(
        (buffer, 0u64, VecDeque::<T>::new()),
        |(buffer, mut cursor, mut pending)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (buffer, cursor, pending)));
                }

                let guard = buffer.lock().await;
                let (items, next) = guard.read_since(cursor);
                if !items.is_empty() {
                    cursor = next;
                    pending.extend(items);
                    continue;
                }
                if guard.is_finished() {
                    return None;
                }

                let notify = guard.notifier();
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(guard);
                notified.await;
            }
        },
    )
    .boxed()
}

impl PushSource<LogLine> for ExecutionHub {
    fn open<'a>(
        &'a self,
        execution_id: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'static, LogLine>, SourceError>> {
        Box::pin(self.follow_logs(execution_id))
    }
}

impl PushSource<Notification> for ExecutionHub {
    fn open<'a>(
        &'a self,
        execution_id: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Notification>, SourceError>> {
        Box::pin(self.follow_notifications(execution_id))
    }
}
