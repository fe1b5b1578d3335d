//! Fate-sharing task group.
//!
//! [`TaskGroup`] spawns named tasks under one child cancellation token. The
//! first task to return (with or without an error) cancels the token, the
//! group then waits for every sibling to unwind and reports the first real
//! error. Cancellations are not errors.

use std::collections::HashMap;
use std::future::Future;

use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TunnelError;

pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: JoinSet<Result<(), TunnelError>>,
    names: HashMap<Id, &'static str>,
}

impl TaskGroup {
    /// New group whose scope is cancelled together with `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            tasks: JoinSet::new(),
            names: HashMap::new(),
        }
    }

    /// The group's cancellation scope, to hand to spawned tasks.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), TunnelError>> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.names.insert(handle.id(), name);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the first task, cancel the rest, wait for them too.
    pub async fn wait(mut self) -> Result<(), TunnelError> {
        let mut first_error: Option<TunnelError> = None;

        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.cancel.cancel();

            let (name, result) = match joined {
                Ok((id, result)) => (self.name_of(id), result),
                Err(e) => {
                    let name = self.name_of(e.id());
                    (
                        name,
                        Err(TunnelError::Task {
                            name,
                            reason: e.to_string(),
                        }),
                    )
                }
            };

            match result {
                Ok(()) => debug!(task = name, "task finished"),
                Err(e) if e.is_cancelled() => debug!(task = name, "task cancelled"),
                Err(e) => {
                    debug!(task = name, error = %e, "task failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn name_of(&self, id: Id) -> &'static str {
        self.names.get(&id).copied().unwrap_or("unknown")
    }
}
