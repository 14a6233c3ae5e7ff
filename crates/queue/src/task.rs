//! Task and the unit-of-work trait.

use std::future::Future;

use async_trait::async_trait;

use crate::error::QueueError;

/// An opaque unit of work executed by a channel worker.
///
/// The dispatcher knows nothing about payloads; it only calls `execute`
/// and retries on `Err`.
#[async_trait]
pub trait TaskUnit: Send + Sync {
    async fn execute(&self) -> Result<(), QueueError>;

    /// Short label used in log lines.
    fn describe(&self) -> String {
        "task".to_string()
    }
}

/// Adapts an async closure into a [`TaskUnit`].
///
/// # Example
/// ```ignore
/// dispatcher.enqueue("webhook_push", FnTask::new("ping", || async { Ok(()) }))?;
/// ```
pub struct FnTask<F> {
    label: String,
    func: F,
}

impl<F> FnTask<F> {
    pub fn new<Fut>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), QueueError>> + Send,
    {
        Self {
            label: label.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> TaskUnit for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueError>> + Send,
{
    async fn execute(&self) -> Result<(), QueueError> {
        (self.func)().await
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// A queued unit of work plus its retry bookkeeping.
pub struct Task {
    pub id: u64,
    pub channel: String,
    pub retries: u32,
    pub max_retries: u32,
    unit: Box<dyn TaskUnit>,
}

impl Task {
    pub fn new(id: u64, channel: impl Into<String>, unit: Box<dyn TaskUnit>, max_retries: u32) -> Self {
        Self {
            id,
            channel: channel.into(),
            retries: 0,
            max_retries,
            unit,
        }
    }

    pub fn unit(&self) -> &dyn TaskUnit {
        self.unit.as_ref()
    }

    /// Count a failed attempt; returns `true` if another attempt is allowed.
    pub fn record_failure(&mut self) -> bool {
        self.retries += 1;
        self.retries < self.max_retries
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("unit", &self.unit.describe())
            .field("retries", &self.retries)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_bounded_by_max_retries() {
        let unit = FnTask::new("noop", || async { Ok(()) });
        let mut task = Task::new(1, "push", Box::new(unit), 3);
        assert!(task.record_failure());
        assert!(task.record_failure());
        assert!(!task.record_failure());
        assert_eq!(task.retries, 3);
    }

    #[tokio::test]
    async fn fn_task_executes_closure() {
        let unit = FnTask::new("boom", || async { Err(QueueError::task("boom")) });
        assert_eq!(unit.describe(), "boom");
        let err = unit.execute().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
