//! Change-detection engine.
//!
//! A cycle runs two passes over the tracking lists:
//!
//! - **broadcast**: new items of every account in the global list are
//!   queued for the webhook channel;
//! - **targeted**: for every (observer, account) pair, new items and new
//!   relationship edges are queued for the bot channel, mentioning the
//!   observer.
//!
//! Both passes share one [`ProcessedSet`]. Relationship edges are diffed
//! against the last snapshot of the account; the first observation of an
//! account only records the snapshot. State is saved after every cycle and
//! a failed save is logged, never rolled back.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use feedwatch_connector::ContentSource;
use feedwatch_core::{AccountInfo, DetectionConfig, Entity, TrackedAccount};
use feedwatch_notify::{DeliveryTask, MessageBuilder, Notification, Notifier, NotifyError};
use feedwatch_queue::Dispatcher;

use crate::error::EngineError;
use crate::state::{PersistedState, ProcessedSet, StateStore};
use crate::subscriptions::SubscriptionSource;

/// A delivery lane: the dispatcher channel and the notifier it feeds.
#[derive(Clone)]
pub struct Route {
    pub channel: String,
    pub notifier: Arc<dyn Notifier>,
}

impl Route {
    pub fn new(channel: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            channel: channel.into(),
            notifier,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub accounts_checked: usize,
    pub accounts_skipped: usize,
    pub items_enqueued: usize,
    pub edges_enqueued: usize,
    pub cancelled: bool,
    pub saved: bool,
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Broadcast,
    Observer(&'a str),
}

/// Entities in `current` that were not in `previous`, in `current` order.
///
/// `None` means the account was never observed: nothing is new.
pub fn new_edges<'a>(previous: Option<&[String]>, current: &'a [Entity]) -> Vec<&'a Entity> {
    let Some(previous) = previous else {
        return Vec::new();
    };
    let known: HashSet<&str> = previous.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    current
        .iter()
        .filter(|e| !known.contains(e.id.as_str()) && seen.insert(e.id.as_str()))
        .collect()
}

pub struct DetectionEngine {
    source: Arc<dyn ContentSource>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn StateStore>,
    subscriptions: Arc<dyn SubscriptionSource>,
    messages: MessageBuilder,
    broadcast: Route,
    targeted: Option<Route>,
    settings: DetectionConfig,
    processed: ProcessedSet,
    snapshot: BTreeMap<String, Vec<String>>,
}

impl DetectionEngine {
    /// Build an engine and load persisted state. An unreadable store
    /// yields empty state.
    pub fn new(
        source: Arc<dyn ContentSource>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn StateStore>,
        subscriptions: Arc<dyn SubscriptionSource>,
        broadcast: Route,
        settings: DetectionConfig,
    ) -> Self {
        let state = store.load().unwrap_or_else(|e| {
            error!(error = %e, "cannot load persisted state, starting empty");
            PersistedState::default()
        });
        let processed = ProcessedSet::from_list(state.processed_ids, settings.processed_cap);
        info!(
            processed = processed.len(),
            snapshots = state.relationships.len(),
            "detection state loaded"
        );

        Self {
            source,
            dispatcher,
            store,
            subscriptions,
            messages: MessageBuilder::default(),
            broadcast,
            targeted: None,
            settings,
            processed,
            snapshot: state.relationships,
        }
    }

    pub fn with_targeted(mut self, route: Route) -> Self {
        self.targeted = Some(route);
        self
    }

    pub fn with_messages(mut self, messages: MessageBuilder) -> Self {
        self.messages = messages;
        self
    }

    pub fn processed(&self) -> &ProcessedSet {
        &self.processed
    }

    pub fn snapshot(&self, account_id: &str) -> Option<&[String]> {
        self.snapshot.get(account_id).map(Vec::as_slice)
    }

    /// Loop forever: one cycle, then sleep `interval`. Returns on cancel.
    pub async fn run_periodic(&mut self, cancel: CancellationToken) {
        let interval = self.settings.interval();
        info!(interval_secs = interval.as_secs_f64(), "detection loop started");

        loop {
            match AssertUnwindSafe(self.run_cycle(&cancel)).catch_unwind().await {
                Ok(Ok(report)) => info!(
                    checked = report.accounts_checked,
                    skipped = report.accounts_skipped,
                    items = report.items_enqueued,
                    edges = report.edges_enqueued,
                    saved = report.saved,
                    "detection cycle finished"
                ),
                Ok(Err(e)) => error!(error = %e, "detection cycle failed"),
                Err(_) => error!(error = %EngineError::Panicked, "detection cycle failed"),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("detection loop stopped");
    }

    /// One full cycle: broadcast pass, targeted pass, processed-set
    /// eviction, save.
    ///
    /// State is saved even when a pass fails; the first pass error is
    /// returned afterwards.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<CycleReport, EngineError> {
        let mut report = CycleReport::default();

        let broadcast = self.broadcast_pass(cancel, &mut report).await;
        let targeted = if report.cancelled {
            Ok(())
        } else {
            self.targeted_pass(cancel, &mut report).await
        };

        self.processed.end_cycle();
        report.saved = self.persist();
        broadcast.and(targeted).map(|()| report)
    }

    /// Broadcast pass only, then save and wait for the dispatcher to drain.
    ///
    /// The dispatcher must be running, otherwise queued deliveries could
    /// never flush.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> Result<CycleReport, EngineError> {
        if !self.dispatcher.is_running().await {
            return Err(EngineError::DispatcherStopped);
        }

        let mut report = CycleReport::default();
        let result = self.broadcast_pass(cancel, &mut report).await;
        self.processed.end_cycle();
        report.saved = self.persist();
        result?;

        info!(queued = report.items_enqueued, "waiting for deliveries to flush");
        tokio::select! {
            _ = self.dispatcher.await_idle() => {}
            _ = cancel.cancelled() => report.cancelled = true,
        }
        Ok(report)
    }

    async fn broadcast_pass(
        &mut self,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let accounts = self.subscriptions.broadcast_accounts()?;
        debug!(accounts = accounts.len(), "broadcast pass started");

        for (i, tracked) in accounts.iter().enumerate() {
            if i > 0 && !self.pace(cancel).await {
                report.cancelled = true;
                break;
            }
            let Some(account) = self.resolve(tracked, report).await else {
                continue;
            };
            self.check_items(&account, Target::Broadcast, report).await?;
        }
        Ok(())
    }

    async fn targeted_pass(
        &mut self,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let observers = self.subscriptions.observer_subscriptions()?;
        if observers.is_empty() {
            return Ok(());
        }
        if self.targeted.is_none() {
            warn!(
                observers = observers.len(),
                "observer lists present but no targeted route configured, skipping targeted pass"
            );
            return Ok(());
        }

        let mut first = true;
        for subs in &observers {
            for tracked in &subs.accounts {
                if !first && !self.pace(cancel).await {
                    report.cancelled = true;
                    return Ok(());
                }
                first = false;

                let Some(account) = self.resolve(tracked, report).await else {
                    continue;
                };
                let target = Target::Observer(&subs.observer_id);
                self.check_items(&account, target, report).await?;
                self.check_relationships(&account, &subs.observer_id, report)
                    .await?;
            }
        }
        Ok(())
    }

    /// Sleep between accounts. Returns `false` if cancelled.
    async fn pace(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.pacing()) => true,
        }
    }

    async fn resolve(&self, tracked: &TrackedAccount, report: &mut CycleReport) -> Option<AccountInfo> {
        match self.source.fetch_account(&tracked.username).await {
            Ok(account) => {
                report.accounts_checked += 1;
                Some(account)
            }
            Err(e) => {
                warn!(account = %tracked.username, error = %e, "cannot resolve account, skipping");
                report.accounts_skipped += 1;
                None
            }
        }
    }

    fn route(&self, target: Target<'_>) -> Option<&Route> {
        match target {
            Target::Broadcast => Some(&self.broadcast),
            Target::Observer(_) => self.targeted.as_ref(),
        }
    }

    fn enqueue(&self, route: &Route, notification: Notification) -> Result<u64, EngineError> {
        let task = DeliveryTask::new(route.notifier.clone(), notification);
        Ok(self.dispatcher.enqueue(&route.channel, task)?)
    }

    async fn check_items(
        &mut self,
        account: &AccountInfo,
        target: Target<'_>,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let items = match self
            .source
            .fetch_latest_items(&account.id, self.settings.item_limit)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(account = %account.username, error = %e, "cannot fetch items");
                return Ok(());
            }
        };

        // Newest first from the source; deliver oldest first.
        for item in items.iter().rev() {
            if self.processed.seen(&item.id) {
                continue;
            }
            let Some(route) = self.route(target) else {
                return Ok(());
            };

            let rendered = match target {
                Target::Broadcast => self.messages.broadcast_item(account, item),
                Target::Observer(observer) => self.messages.targeted_item(observer, account, item),
            };
            let notification = match rendered {
                Ok(n) => n,
                Err(e) => {
                    // Failed renders are not retried.
                    log_render_error(&account.username, &item.id, &e);
                    self.processed.insert(item.id.clone());
                    continue;
                }
            };

            let task_id = self.enqueue(route, notification)?;
            info!(
                account = %account.username,
                item = %item.id,
                channel = %route.channel,
                task_id,
                "new item queued"
            );
            self.processed.insert(item.id.clone());
            report.items_enqueued += 1;
        }
        Ok(())
    }

    async fn check_relationships(
        &mut self,
        account: &AccountInfo,
        observer: &str,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let current = match self
            .source
            .fetch_relationships(&account.id, self.settings.relationship_limit)
            .await
        {
            Ok(current) => current,
            Err(e) => {
                warn!(account = %account.username, error = %e, "cannot fetch relationships, keeping snapshot");
                return Ok(());
            }
        };

        let previous = self.snapshot.get(&account.id).map(Vec::as_slice);
        if previous.is_none() {
            debug!(account = %account.username, edges = current.len(), "first observation, recording snapshot");
        }

        if let Some(route) = self.targeted.as_ref() {
            for entity in new_edges(previous, &current) {
                let notification = match self.messages.targeted_relationship(observer, account, entity) {
                    Ok(n) => n,
                    Err(e) => {
                        log_render_error(&account.username, &entity.id, &e);
                        continue;
                    }
                };
                let task_id = self.enqueue(route, notification)?;
                info!(
                    account = %account.username,
                    entity = %entity.username,
                    channel = %route.channel,
                    task_id,
                    "new relationship queued"
                );
                report.edges_enqueued += 1;
            }
        }

        let ids = current.into_iter().map(|e| e.id).collect();
        self.snapshot.insert(account.id.clone(), ids);
        Ok(())
    }

    /// Save both records. Failure is logged; in-memory state is kept.
    fn persist(&self) -> bool {
        let state = PersistedState {
            processed_ids: self.processed.to_list(),
            relationships: self.snapshot.clone(),
        };
        match self.store.save(&state) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "cannot save state, will retry next cycle");
                false
            }
        }
    }
}

fn log_render_error(account: &str, id: &str, e: &NotifyError) {
    warn!(account, id, error = %e, "cannot render message, skipping");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            username: format!("user{id}"),
            name: format!("User {id}"),
            description: None,
        }
    }

    fn ids(v: &[&Entity]) -> Vec<String> {
        v.iter().map(|e| e.id.clone()).collect()
    }

    #[test]
    fn diff_reports_only_added_edges() {
        let previous = vec!["A".to_string(), "B".to_string()];
        let current = vec![entity("A"), entity("B"), entity("C")];
        assert_eq!(ids(&new_edges(Some(previous.as_slice()), &current)), vec!["C"]);
    }

    #[test]
    fn never_observed_reports_nothing() {
        let current = vec![entity("A"), entity("B"), entity("C")];
        assert!(new_edges(None, &current).is_empty());
    }

    #[test]
    fn observed_empty_reports_everything() {
        let current = vec![entity("A"), entity("B")];
        assert_eq!(ids(&new_edges(Some(&[][..]), &current)), vec!["A", "B"]);
    }

    #[test]
    fn removed_edges_are_ignored_and_duplicates_collapsed() {
        let previous = vec!["A".to_string(), "B".to_string()];
        let current = vec![entity("B"), entity("D"), entity("D")];
        assert_eq!(ids(&new_edges(Some(previous.as_slice()), &current)), vec!["D"]);
    }
}
