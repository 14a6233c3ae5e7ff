//! Queue adapter: one notification send as a retryable task.

use std::sync::Arc;

use async_trait::async_trait;

use feedwatch_queue::{QueueError, TaskUnit};

use crate::traits::{Notification, Notifier};

/// Sends a pre-rendered notification through a notifier when executed.
///
/// Errors are surfaced to the dispatcher, which owns the retry policy.
pub struct DeliveryTask {
    notifier: Arc<dyn Notifier>,
    notification: Notification,
}

impl DeliveryTask {
    pub fn new(notifier: Arc<dyn Notifier>, notification: Notification) -> Self {
        Self {
            notifier,
            notification,
        }
    }

    pub fn notification(&self) -> &Notification {
        &self.notification
    }
}

#[async_trait]
impl TaskUnit for DeliveryTask {
    async fn execute(&self) -> Result<(), QueueError> {
        self.notifier
            .send(&self.notification)
            .await
            .map_err(|e| QueueError::task(format!("{}: {e}", self.notifier.channel_name())))
    }

    fn describe(&self) -> String {
        format!("{} <- {}", self.notifier.channel_name(), self.notification.summary())
    }
}
