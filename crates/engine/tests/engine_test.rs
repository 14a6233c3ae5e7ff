//! Detection engine against in-memory collaborators.
//!
//! Every test runs on tokio's paused clock so pacing and cycle sleeps
//! auto-advance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use feedwatch_connector::{ContentSource, SourceError};
use feedwatch_core::{
    AccountInfo, DetectionConfig, Entity, Item, ItemMetrics, ObserverSubscriptions, RetryPolicy,
    TrackedAccount,
};
use feedwatch_engine::{
    DetectionEngine, EngineError, PersistedState, Route, StateError, StateStore, SubscriptionError,
    SubscriptionSource,
};
use feedwatch_notify::{
    MessageBuilder, MessageTemplates, Notification, Notifier, NotifyError, TemplateRenderer,
};
use feedwatch_queue::Dispatcher;

const BROADCAST: &str = "webhook_push";
const TARGETED: &str = "discord_bot";

// ── Collaborators ────────────────────────────────────────────────

#[derive(Default)]
struct MockSource {
    accounts: Mutex<HashMap<String, AccountInfo>>,
    items: Mutex<HashMap<String, Vec<Item>>>,
    relationships: Mutex<HashMap<String, Vec<Entity>>>,
}

impl MockSource {
    fn with_account(self, username: &str, id: &str) -> Self {
        self.accounts.lock().unwrap().insert(
            username.to_string(),
            AccountInfo {
                id: id.to_string(),
                username: username.to_string(),
                name: username.to_uppercase(),
                description: None,
                followers_count: 10,
            },
        );
        self
    }

    fn set_items(&self, account_id: &str, ids: &[&str]) {
        let items = ids
            .iter()
            .map(|id| Item {
                id: id.to_string(),
                text: format!("item {id}"),
                created_at: None,
                metrics: ItemMetrics::default(),
            })
            .collect();
        self.items.lock().unwrap().insert(account_id.to_string(), items);
    }

    fn set_relationships(&self, account_id: &str, ids: &[&str]) {
        let entities = ids
            .iter()
            .map(|id| Entity {
                id: id.to_string(),
                username: format!("user_{id}"),
                name: format!("User {id}"),
                description: Some("hello".into()),
            })
            .collect();
        self.relationships
            .lock()
            .unwrap()
            .insert(account_id.to_string(), entities);
    }
}

#[async_trait]
impl ContentSource for MockSource {
    async fn fetch_account(&self, username: &str) -> Result<AccountInfo, SourceError> {
        self.accounts
            .lock()
            .unwrap()
            .get(username)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(username.to_string()))
    }

    async fn fetch_latest_items(&self, account_id: &str, _limit: u32) -> Result<Vec<Item>, SourceError> {
        Ok(self.items.lock().unwrap().get(account_id).cloned().unwrap_or_default())
    }

    async fn fetch_relationships(&self, account_id: &str, _limit: u32) -> Result<Vec<Entity>, SourceError> {
        self.relationships
            .lock()
            .unwrap()
            .get(account_id)
            .cloned()
            .ok_or(SourceError::RateLimited { retry_after_secs: 60 })
    }
}

#[derive(Default)]
struct MemoryStore {
    state: Mutex<PersistedState>,
    fail_save: AtomicBool,
    saves: AtomicUsize,
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<PersistedState, StateError> {
        Ok(self.state.lock().unwrap().clone())
    }

    fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(StateError::Io(std::io::Error::other("disk full")));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = state.clone();
        Ok(())
    }
}

#[derive(Default)]
struct StaticSubs {
    broadcast: Mutex<Vec<TrackedAccount>>,
    observers: Mutex<Vec<ObserverSubscriptions>>,
    fail_next: AtomicBool,
    calls: AtomicUsize,
}

impl StaticSubs {
    fn broadcast(names: &[&str]) -> Self {
        let subs = Self::default();
        *subs.broadcast.lock().unwrap() = names.iter().map(|n| TrackedAccount::bare(n)).collect();
        subs
    }

    fn observer(observer: &str, names: &[&str]) -> Self {
        let subs = Self::default();
        *subs.observers.lock().unwrap() = vec![ObserverSubscriptions {
            observer_id: observer.to_string(),
            accounts: names.iter().map(|n| TrackedAccount::bare(n)).collect(),
        }];
        subs
    }
}

impl SubscriptionSource for StaticSubs {
    fn broadcast_accounts(&self) -> Result<Vec<TrackedAccount>, SubscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SubscriptionError::Store(StateError::Io(std::io::Error::other(
                "unreadable",
            ))));
        }
        Ok(self.broadcast.lock().unwrap().clone())
    }

    fn observer_subscriptions(&self) -> Result<Vec<ObserverSubscriptions>, SubscriptionError> {
        Ok(self.observers.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "recording"
    }
}

// ── Harness ──────────────────────────────────────────────────────

struct Harness {
    source: Arc<MockSource>,
    store: Arc<MemoryStore>,
    subs: Arc<StaticSubs>,
    dispatcher: Arc<Dispatcher>,
    webhook: Arc<RecordingNotifier>,
    bot: Arc<RecordingNotifier>,
}

impl Harness {
    fn new(source: MockSource, subs: StaticSubs) -> Self {
        let mut dispatcher = Dispatcher::new(RetryPolicy::default());
        dispatcher.register(BROADCAST, 5, Duration::from_secs(2)).unwrap();
        dispatcher.register(TARGETED, 5, Duration::from_secs(5)).unwrap();
        Self {
            source: Arc::new(source),
            store: Arc::new(MemoryStore::default()),
            subs: Arc::new(subs),
            dispatcher: Arc::new(dispatcher),
            webhook: Arc::new(RecordingNotifier::default()),
            bot: Arc::new(RecordingNotifier::default()),
        }
    }

    fn engine(&self) -> DetectionEngine {
        self.engine_with(DetectionConfig::default())
    }

    fn engine_with(&self, settings: DetectionConfig) -> DetectionEngine {
        DetectionEngine::new(
            self.source.clone(),
            self.dispatcher.clone(),
            self.store.clone(),
            self.subs.clone(),
            Route::new(BROADCAST, self.webhook.clone()),
            settings,
        )
        .with_targeted(Route::new(TARGETED, self.bot.clone()))
    }

    fn pending(&self, channel: &str) -> usize {
        self.dispatcher.pending_count(channel).unwrap()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn already_processed_item_is_not_requeued() {
    let h = Harness::new(
        MockSource::default().with_account("userA", "100"),
        StaticSubs::broadcast(&["userA"]),
    );
    h.source.set_items("100", &["2", "1"]);
    h.store.state.lock().unwrap().processed_ids = vec!["1".into()];

    let mut engine = h.engine();
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.items_enqueued, 1);
    assert_eq!(h.pending(BROADCAST), 1);
    assert!(engine.processed().contains("1"));
    assert!(engine.processed().contains("2"));
    assert_eq!(engine.processed().len(), 2);
    assert_eq!(h.store.state.lock().unwrap().processed_ids, vec!["1", "2"]);

    // The same fetch result on the next cycle queues nothing.
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.items_enqueued, 0);
    assert_eq!(h.pending(BROADCAST), 1);

    h.dispatcher.start().await;
    h.dispatcher.await_idle().await;
    let sent = h.webhook.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].embeds[0].url.as_deref(),
        Some("https://x.com/userA/status/2")
    );
    drop(sent);
    h.dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn first_observation_records_snapshot_without_deliveries() {
    let h = Harness::new(
        MockSource::default().with_account("userA", "100"),
        StaticSubs::observer("42", &["userA"]),
    );
    h.source.set_relationships("100", &["A", "B", "C"]);

    let mut engine = h.engine();
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.edges_enqueued, 0);
    assert_eq!(h.pending(TARGETED), 0);
    assert_eq!(engine.snapshot("100").unwrap(), ["A", "B", "C"]);
    assert_eq!(
        h.store.state.lock().unwrap().relationships["100"],
        vec!["A", "B", "C"]
    );
}

#[tokio::test(start_paused = true)]
async fn only_added_edges_are_delivered_and_snapshot_replaced() {
    let h = Harness::new(
        MockSource::default().with_account("userA", "100"),
        StaticSubs::observer("42", &["userA"]),
    );
    h.store
        .state
        .lock()
        .unwrap()
        .relationships
        .insert("100".into(), vec!["A".into(), "B".into()]);
    h.source.set_relationships("100", &["A", "B", "C"]);

    let mut engine = h.engine();
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.edges_enqueued, 1);
    assert_eq!(h.pending(TARGETED), 1);

    // B unfollowed, D followed: only D is new, B vanishes silently.
    h.source.set_relationships("100", &["A", "C", "D"]);
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.edges_enqueued, 1);
    assert_eq!(engine.snapshot("100").unwrap(), ["A", "C", "D"]);

    h.dispatcher.start().await;
    h.dispatcher.await_idle().await;
    let sent = h.bot.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].content.as_deref().unwrap().starts_with("<@42>"));
    assert_eq!(sent[0].embeds[0].url.as_deref(), Some("https://x.com/user_C"));
    assert_eq!(sent[1].embeds[0].url.as_deref(), Some("https://x.com/user_D"));
    drop(sent);
    h.dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn relationship_fetch_error_keeps_previous_snapshot() {
    let h = Harness::new(
        MockSource::default().with_account("userA", "100"),
        StaticSubs::observer("42", &["userA"]),
    );
    h.store
        .state
        .lock()
        .unwrap()
        .relationships
        .insert("100".into(), vec!["A".into()]);
    // No relationships configured: the mock answers RateLimited.

    let mut engine = h.engine();
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.edges_enqueued, 0);
    assert_eq!(engine.snapshot("100").unwrap(), ["A"]);
}

#[tokio::test(start_paused = true)]
async fn targeted_items_mention_observer() {
    let h = Harness::new(
        MockSource::default().with_account("userA", "100"),
        StaticSubs::observer("42", &["userA"]),
    );
    h.source.set_items("100", &["9"]);
    h.source.set_relationships("100", &[]);

    let mut engine = h.engine();
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.items_enqueued, 1);
    assert_eq!(h.pending(TARGETED), 1);
    assert_eq!(h.pending(BROADCAST), 0);
    // Observed with no edges is recorded as an empty snapshot.
    assert_eq!(engine.snapshot("100").unwrap(), [] as [String; 0]);
}

#[tokio::test(start_paused = true)]
async fn unresolvable_account_is_skipped() {
    let h = Harness::new(
        MockSource::default().with_account("userB", "200"),
        StaticSubs::broadcast(&["ghost", "userB"]),
    );
    h.source.set_items("200", &["5"]);

    let mut engine = h.engine();
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.accounts_skipped, 1);
    assert_eq!(report.accounts_checked, 1);
    assert_eq!(report.items_enqueued, 1);
}

#[tokio::test(start_paused = true)]
async fn save_failure_keeps_in_memory_state() {
    let h = Harness::new(
        MockSource::default().with_account("userA", "100"),
        StaticSubs::broadcast(&["userA"]),
    );
    h.source.set_items("100", &["1"]);
    h.store.fail_save.store(true, Ordering::SeqCst);

    let mut engine = h.engine();
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert!(!report.saved);
    assert!(engine.processed().contains("1"));

    h.store.fail_save.store(false, Ordering::SeqCst);
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert!(report.saved);
    assert_eq!(report.items_enqueued, 0);
    assert_eq!(h.store.state.lock().unwrap().processed_ids, vec!["1"]);
}

#[tokio::test(start_paused = true)]
async fn accounts_are_paced_and_cancel_interrupts_pacing() {
    let h = Harness::new(
        MockSource::default()
            .with_account("a", "1")
            .with_account("b", "2")
            .with_account("c", "3"),
        StaticSubs::broadcast(&["a", "b", "c"]),
    );

    let mut engine = h.engine();
    let started = Instant::now();
    engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(4));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = engine.run_cycle(&cancel).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.accounts_checked, 1);
}

#[tokio::test(start_paused = true)]
async fn periodic_loop_survives_failed_cycle() {
    let h = Harness::new(
        MockSource::default().with_account("userA", "100"),
        StaticSubs::broadcast(&["userA"]),
    );
    h.subs.fail_next.store(true, Ordering::SeqCst);

    let mut engine = h.engine();
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let handle = tokio::spawn(async move { engine.run_periodic(loop_cancel).await });

    // Default interval is 300s: expect cycles at t=0, 300, 600.
    tokio::time::sleep(Duration::from_secs(650)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(h.subs.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn run_once_flushes_deliveries() {
    let h = Harness::new(
        MockSource::default().with_account("userA", "100"),
        StaticSubs::broadcast(&["userA"]),
    );
    h.source.set_items("100", &["3", "2", "1"]);

    let mut engine = h.engine();
    assert!(matches!(
        engine.run_once(&CancellationToken::new()).await,
        Err(EngineError::DispatcherStopped)
    ));

    h.dispatcher.start().await;
    let report = engine.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.items_enqueued, 3);
    assert!(report.saved);

    let sent = h.webhook.sent.lock().unwrap();
    let urls: Vec<_> = sent.iter().map(|n| n.embeds[0].url.clone().unwrap()).collect();
    assert_eq!(
        urls,
        vec![
            "https://x.com/userA/status/1",
            "https://x.com/userA/status/2",
            "https://x.com/userA/status/3",
        ]
    );
    drop(sent);
    h.dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn quiet_account_item_survives_churn_from_busy_account() {
    let h = Harness::new(
        MockSource::default()
            .with_account("quiet", "1")
            .with_account("busy", "2"),
        StaticSubs::broadcast(&["quiet", "busy"]),
    );
    h.source.set_items("1", &["q1"]);
    h.source.set_items("2", &["b1"]);

    let mut engine = h.engine_with(DetectionConfig {
        processed_cap: 3,
        ..DetectionConfig::default()
    });
    let cancel = CancellationToken::new();
    assert_eq!(engine.run_cycle(&cancel).await.unwrap().items_enqueued, 2);

    h.source.set_items("2", &["b3", "b2", "b1"]);
    assert_eq!(engine.run_cycle(&cancel).await.unwrap().items_enqueued, 2);

    // Same fetch results: the window exceeds the cap but nothing is new.
    assert_eq!(engine.run_cycle(&cancel).await.unwrap().items_enqueued, 0);
    assert!(engine.processed().contains("q1"));

    // b1 drops out of the busy window and is the one evicted.
    h.source.set_items("2", &["b4", "b3", "b2"]);
    assert_eq!(engine.run_cycle(&cancel).await.unwrap().items_enqueued, 1);
    assert!(engine.processed().contains("q1"));
    assert!(!engine.processed().contains("b1"));

    assert_eq!(engine.run_cycle(&cancel).await.unwrap().items_enqueued, 0);
    assert_eq!(h.pending(BROADCAST), 5);
}

#[tokio::test(start_paused = true)]
async fn unrenderable_item_is_marked_processed() {
    let h = Harness::new(
        MockSource::default().with_account("userA", "100"),
        StaticSubs::broadcast(&["userA"]),
    );
    h.source.set_items("100", &["1"]);

    let templates = MessageTemplates {
        item_title: "{{ item.text | clip('many') }}".into(),
        ..MessageTemplates::default()
    };
    let messages = MessageBuilder::with_templates(Arc::new(TemplateRenderer::new()), templates).unwrap();
    let mut engine = h.engine().with_messages(messages);

    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.items_enqueued, 0);
    assert!(engine.processed().contains("1"));
    assert_eq!(h.store.state.lock().unwrap().processed_ids, vec!["1"]);

    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.items_enqueued, 0);
    assert_eq!(h.pending(BROADCAST), 0);
}
