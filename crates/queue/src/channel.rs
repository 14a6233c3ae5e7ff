//! Channel queue: one named FIFO bound to one limiter configuration.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, Notify};

use feedwatch_core::ChannelConfig;

use crate::limiter::TokenBucket;
use crate::task::Task;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    /// Tasks popped by the worker and not yet finished or re-enqueued.
    /// Kept under the same lock as `pending` so an idle check never sees
    /// a task in neither place.
    executing: usize,
}

/// Single-producer/single-consumer FIFO shared between the enqueuing side
/// and the channel's worker.
pub(crate) struct ChannelQueue {
    config: ChannelConfig,
    state: Mutex<QueueState>,
    available: Notify,
    /// Locked by the running worker for its whole lifetime, so credit
    /// state carries over a stop/start.
    limiter: Arc<AsyncMutex<TokenBucket>>,
}

impl ChannelQueue {
    pub(crate) fn new(config: ChannelConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            limiter: Arc::new(AsyncMutex::new(TokenBucket::from_config(&config))),
            config,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn limiter(&self) -> Arc<AsyncMutex<TokenBucket>> {
        self.limiter.clone()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the tail. Returns the depth after the push.
    pub(crate) fn push(&self, task: Task) -> usize {
        let depth = {
            let mut state = self.state();
            state.pending.push_back(task);
            state.pending.len()
        };
        self.available.notify_one();
        depth
    }

    fn try_take(&self) -> Option<Task> {
        let mut state = self.state();
        let task = state.pending.pop_front()?;
        state.executing += 1;
        Some(task)
    }

    /// Pop the head, waiting while the FIFO is empty.
    pub(crate) async fn take(&self) -> Task {
        loop {
            if let Some(task) = self.try_take() {
                return task;
            }
            self.available.notified().await;
        }
    }

    /// Put an executing task back at the tail.
    pub(crate) fn requeue(&self, task: Task) {
        {
            let mut state = self.state();
            state.pending.push_back(task);
            state.executing = state.executing.saturating_sub(1);
        }
        self.available.notify_one();
    }

    /// Mark an executing task as done (succeeded or dropped).
    pub(crate) fn finish(&self) {
        let mut state = self.state();
        state.executing = state.executing.saturating_sub(1);
    }

    /// Forget tasks counted as executing. Only valid once no worker runs
    /// for this channel (after an aborted stop).
    pub(crate) fn reset_executing(&self) -> usize {
        std::mem::take(&mut self.state().executing)
    }

    pub(crate) fn pending(&self) -> usize {
        self.state().pending.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state();
        state.pending.is_empty() && state.executing == 0
    }
}
