//! Multi-channel, rate-limited task dispatcher.
//!
//! The dispatcher owns a fixed set of named channels, each with its own
//! FIFO and token bucket. [`Dispatcher::start`] spawns exactly one worker
//! per channel; every worker loops:
//!
//! 1. acquire a credit from the channel's limiter
//! 2. pop the next task (waiting while the FIFO is empty)
//! 3. execute it
//! 4. on failure, sleep `base * 2^(failures - 1)` and re-enqueue at the
//!    tail, or drop the task once `max_retries` attempts were made
//!
//! Channels never block each other. Cancellation from [`Dispatcher::stop`]
//! lands at the next suspension point (credit wait, empty FIFO, backoff
//! sleep); a unit of work that is already executing runs to completion,
//! or is aborted and lost once the shutdown timeout elapses.
//!
//! Each channel's token bucket lives in its queue, so a stop/start cycle
//! does not hand out a fresh set of credits.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use feedwatch_core::{ChannelConfig, RetryPolicy};

use crate::channel::ChannelQueue;
use crate::error::QueueError;
use crate::task::{FnTask, Task, TaskUnit};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_FAULT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct RunState {
    cancel: Option<CancellationToken>,
    workers: Vec<JoinHandle<()>>,
}

/// Explicitly constructed dispatcher; share it as `Arc<Dispatcher>`.
///
/// Lifecycle: construct → [`register`](Self::register) channels →
/// [`start`](Self::start) → [`stop`](Self::stop). Registration takes
/// `&mut self`, so it can only happen before the instance is shared.
pub struct Dispatcher {
    channels: HashMap<String, Arc<ChannelQueue>>,
    retry: RetryPolicy,
    idle: Arc<Notify>,
    next_id: AtomicU64,
    run: Mutex<RunState>,
    shutdown_timeout: Duration,
    fault_pause: Duration,
}

impl Dispatcher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            channels: HashMap::new(),
            retry,
            idle: Arc::new(Notify::new()),
            next_id: AtomicU64::new(1),
            run: Mutex::new(RunState::default()),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            fault_pause: DEFAULT_FAULT_PAUSE,
        }
    }

    /// Create a dispatcher with every configured channel registered.
    pub fn from_config(channels: &[ChannelConfig], retry: RetryPolicy) -> Result<Self, QueueError> {
        let mut dispatcher = Self::new(retry);
        for channel in channels {
            dispatcher.register_channel(channel.clone())?;
        }
        Ok(dispatcher)
    }

    /// Upper bound on how long [`stop`](Self::stop) waits for a worker
    /// stuck inside a unit of work before aborting it (default: 10s).
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Pause after an internal worker fault such as a panicking task (default: 1s).
    pub fn with_fault_pause(mut self, pause: Duration) -> Self {
        self.fault_pause = pause;
        self
    }

    /// Declare a channel and its limiter parameters.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        max_credits: u32,
        refill_interval: Duration,
    ) -> Result<(), QueueError> {
        self.register_channel(ChannelConfig::new(
            name,
            max_credits,
            refill_interval.as_secs_f64(),
        ))
    }

    pub fn register_channel(&mut self, config: ChannelConfig) -> Result<(), QueueError> {
        let invalid = |reason: &str| QueueError::InvalidChannel {
            name: config.name.clone(),
            reason: reason.to_string(),
        };
        if config.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if config.max_credits == 0 {
            return Err(invalid("max_credits must be positive"));
        }
        if !(config.refill_interval_seconds.is_finite() && config.refill_interval_seconds > 0.0) {
            return Err(invalid("refill interval must be positive"));
        }
        if self.channels.contains_key(&config.name) {
            return Err(QueueError::DuplicateChannel(config.name));
        }

        debug!(
            channel = %config.name,
            max_credits = config.max_credits,
            refill_secs = config.refill_interval_seconds,
            "channel registered"
        );
        self.channels
            .insert(config.name.clone(), Arc::new(ChannelQueue::new(config)));
        Ok(())
    }

    pub fn channel_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Spawn one worker per registered channel. No-op if already running.
    pub async fn start(&self) {
        let mut run = self.run.lock().await;
        if run.cancel.is_some() {
            return;
        }

        info!(channels = self.channels.len(), "dispatcher starting");
        let cancel = CancellationToken::new();
        for queue in self.channels.values() {
            let worker = ChannelWorker {
                queue: queue.clone(),
                retry: self.retry,
                idle: self.idle.clone(),
                cancel: cancel.clone(),
                fault_pause: self.fault_pause,
            };
            run.workers.push(tokio::spawn(worker.run()));
        }
        run.cancel = Some(cancel);
        info!("dispatcher started");
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.cancel.is_some()
    }

    /// Number of live worker tasks (one per channel while running).
    pub async fn worker_count(&self) -> usize {
        self.run
            .lock()
            .await
            .workers
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Signal every worker to stop and wait for them. No-op if not running.
    ///
    /// Workers waiting for a credit, a task, or a backoff deadline stop
    /// immediately. A worker inside a unit of work is given up to the
    /// shutdown timeout before it is aborted; its task is lost and the
    /// channel is marked idle again so [`await_idle`](Self::await_idle)
    /// keeps working after a restart.
    pub async fn stop(&self) {
        let (cancel, workers) = {
            let mut run = self.run.lock().await;
            let Some(cancel) = run.cancel.take() else {
                return;
            };
            (cancel, std::mem::take(&mut run.workers))
        };

        info!("dispatcher stopping");
        cancel.cancel();

        let aborts: Vec<_> = workers.iter().map(|h| h.abort_handle()).collect();
        let mut joined = futures::future::join_all(workers);
        match tokio::time::timeout(self.shutdown_timeout, &mut joined).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            warn!(error = %e, "channel worker ended abnormally");
                        }
                    }
                }
            }
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "channel workers did not stop in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
                joined.await;
                for queue in self.channels.values() {
                    let lost = queue.reset_executing();
                    if lost > 0 {
                        warn!(channel = %queue.name(), lost, "aborted unit of work dropped");
                    }
                }
                self.idle.notify_waiters();
            }
        }
        info!("dispatcher stopped");
    }

    /// Append a task with retry count 0 to the named channel.
    pub fn enqueue(&self, channel: &str, unit: impl TaskUnit + 'static) -> Result<u64, QueueError> {
        self.enqueue_boxed(channel, Box::new(unit))
    }

    pub fn enqueue_boxed(&self, channel: &str, unit: Box<dyn TaskUnit>) -> Result<u64, QueueError> {
        let queue = self.queue(channel)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = unit.describe();
        let depth = queue.push(Task::new(id, channel, unit, self.retry.max_retries));
        debug!(channel, task_id = id, task = %label, depth, "task enqueued");
        Ok(id)
    }

    /// Convenience for enqueuing an async closure.
    pub fn enqueue_fn<F, Fut>(&self, channel: &str, label: &str, func: F) -> Result<u64, QueueError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), QueueError>> + Send + 'static,
    {
        self.enqueue(channel, FnTask::new(label, func))
    }

    /// Current FIFO depth of a channel (excludes the task being executed).
    pub fn pending_count(&self, channel: &str) -> Result<usize, QueueError> {
        Ok(self.queue(channel)?.pending())
    }

    /// Wait until every channel has nothing pending and nothing executing.
    ///
    /// Never returns while tasks are queued on a stopped dispatcher.
    pub async fn await_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.channels.values().all(|q| q.is_idle()) {
                return;
            }
            notified.await;
        }
    }

    fn queue(&self, channel: &str) -> Result<&Arc<ChannelQueue>, QueueError> {
        self.channels
            .get(channel)
            .ok_or_else(|| QueueError::UnknownChannel(channel.to_string()))
    }
}

// ── Channel worker ──────────────────────────────────────────────────

struct ChannelWorker {
    queue: Arc<ChannelQueue>,
    retry: RetryPolicy,
    idle: Arc<Notify>,
    cancel: CancellationToken,
    fault_pause: Duration,
}

enum Attempt {
    Succeeded,
    Failed(QueueError),
    Panicked,
}

impl ChannelWorker {
    async fn run(self) {
        let channel = self.queue.name().to_string();
        let mut limiter = self.queue.limiter().lock_owned().await;
        info!(channel = %channel, credits = limiter.credits(), "channel worker started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = limiter.acquire() => {}
            }

            let mut task = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                task = self.queue.take() => task,
            };

            debug!(channel = %channel, task_id = task.id, retries = task.retries, "executing task");
            let attempt = match AssertUnwindSafe(task.unit().execute()).catch_unwind().await {
                Ok(Ok(())) => Attempt::Succeeded,
                Ok(Err(e)) => Attempt::Failed(e),
                Err(_) => Attempt::Panicked,
            };

            match attempt {
                Attempt::Succeeded => {
                    debug!(channel = %channel, task_id = task.id, "task completed");
                    self.finish();
                }
                Attempt::Failed(e) => {
                    error!(
                        channel = %channel,
                        task_id = task.id,
                        task = %task.unit().describe(),
                        error = %e,
                        "task execution failed"
                    );
                    if task.record_failure() {
                        let delay = self.retry.backoff_after(task.retries);
                        info!(channel = %channel, task_id = task.id, delay = ?delay, "task will be retried");
                        let cancelled = self.pause(delay).await;
                        self.queue.requeue(task);
                        if cancelled {
                            break;
                        }
                    } else {
                        error!(
                            channel = %channel,
                            task_id = task.id,
                            attempts = task.retries,
                            "task retries exhausted, dropping"
                        );
                        self.finish();
                    }
                }
                Attempt::Panicked => {
                    error!(
                        channel = %channel,
                        task_id = task.id,
                        "channel worker fault while executing task, dropping task"
                    );
                    self.finish();
                    if self.pause(self.fault_pause).await {
                        break;
                    }
                }
            }
        }

        info!(channel = %channel, "channel worker stopped");
    }

    fn finish(&self) {
        self.queue.finish();
        self.idle.notify_waiters();
    }

    /// Sleep for `delay`; returns `true` if cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}
