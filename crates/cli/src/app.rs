//! Component wiring from a loaded [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use feedwatch_connector::XApiClient;
use feedwatch_core::{Config, BROADCAST_CHANNEL, TARGETED_CHANNEL};
use feedwatch_engine::{DetectionEngine, JsonStateStore, Route, SubscriptionFiles};
use feedwatch_notify::{DiscordBotNotifier, DiscordWebhookNotifier};
use feedwatch_queue::Dispatcher;

pub struct App {
    pub dispatcher: Arc<Dispatcher>,
    pub engine: DetectionEngine,
}

pub fn source(config: &Config) -> Result<Arc<XApiClient>> {
    let client = XApiClient::from_config(&config.source)
        .context("content source unavailable (set FEEDWATCH_BEARER_TOKENS)")?;
    Ok(Arc::new(client))
}

fn targeted_route(config: &Config) -> Result<Option<Route>> {
    let (Some(token), Some(channel_id)) = (&config.discord.bot_token, &config.discord.channel_id)
    else {
        warn!("DISCORD_TOKEN or DISCORD_CHANNEL_ID not set, targeted deliveries disabled");
        return Ok(None);
    };
    let notifier = DiscordBotNotifier::from_config(token, channel_id)
        .context("invalid Discord bot configuration")?;
    Ok(Some(Route::new(TARGETED_CHANNEL, Arc::new(notifier))))
}

impl App {
    /// Build every collaborator. Missing content credentials or a missing
    /// webhook are fatal; a missing bot setup only disables targeted delivery.
    pub fn build(config: &Config) -> Result<Self> {
        let source = source(config)?;

        let dispatcher = Arc::new(
            Dispatcher::from_config(&config.channels, config.retry)
                .context("invalid channel configuration")?,
        );

        let webhook_url = config
            .discord
            .webhook_url
            .as_deref()
            .context("DISCORD_WEBHOOK_URL must be set for broadcast deliveries")?;
        let webhook = DiscordWebhookNotifier::new(webhook_url, Some("feedwatch".to_string()))
            .context("invalid webhook configuration")?;
        let broadcast = Route::new(BROADCAST_CHANNEL, Arc::new(webhook));

        let store = Arc::new(JsonStateStore::new(&config.paths.data_dir));
        let subscriptions = Arc::new(SubscriptionFiles::from_paths(&config.paths));

        let mut engine = DetectionEngine::new(
            source,
            dispatcher.clone(),
            store,
            subscriptions,
            broadcast,
            config.detection.clone(),
        );
        if let Some(route) = targeted_route(config)? {
            engine = engine.with_targeted(route);
        }

        info!(channels = ?dispatcher.channel_names(), "components ready");
        Ok(Self { dispatcher, engine })
    }
}
