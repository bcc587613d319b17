//! Cancellable retry timers keyed by message id.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Arena of pending backoff timers.
///
/// At most one timer exists per message; scheduling again replaces (aborts)
/// the previous one. Dropping the arena aborts everything still pending.
#[derive(Default)]
pub(crate) struct RetryTimers {
    handles: Arc<DashMap<Uuid, (u64, JoinHandle<()>)>>,
    next_generation: AtomicU64,
}

impl RetryTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` unless cancelled first.
    pub fn schedule<F>(&self, id: Uuid, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handles = self.handles.clone();
        // The delay counts from scheduling, not from the task's first poll
        let deadline = tokio::time::Instant::now() + delay;

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            handles.remove_if(&id, |_, (g, _)| *g == generation);
            task.await;
        });

        if let Some((_, previous)) = self.handles.insert(id, (generation, handle)) {
            previous.abort();
        }
    }

    /// Cancel the timer for a message. Returns whether one was pending.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.handles.remove(id) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<Uuid> = self.handles.iter().map(|r| *r.key()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.handles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for RetryTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
