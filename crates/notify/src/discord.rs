//! Discord bot notifier.
//!
//! Posts messages to one text channel via the REST endpoint
//! `POST /channels/{id}/messages`, authenticated as a bot. Used for targeted
//! deliveries, where the message content mentions the observer.

use crate::traits::{Notification, Notifier, NotifyError};
use crate::webhook::resolve_env_vars;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Parse Discord's 429 body (`{"retry_after": 1.5, ...}`), rounding up.
pub(crate) fn retry_after_secs(body: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("retry_after").and_then(|r| r.as_f64()))
        .map(|secs| secs.max(0.0).ceil() as u64)
        .unwrap_or(5)
}

/// Map a Discord HTTP response to a delivery outcome.
pub(crate) async fn check_response(
    channel: &str,
    response: reqwest::Response,
) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = retry_after_secs(&body);
        tracing::warn!(channel, retry_after_secs, "Discord rate limited the request");
        return Err(NotifyError::RateLimited { retry_after_secs });
    }

    tracing::warn!(channel, %status, body = %body, "Discord returned non-2xx status");
    Err(NotifyError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Sends notifications into a Discord channel as a bot user.
#[derive(Debug)]
pub struct DiscordBotNotifier {
    bot_token: String,
    channel_id: String,
    api_base: String,
    client: reqwest::Client,
}

impl DiscordBotNotifier {
    /// `bot_token` may be a `${VAR}` reference, resolved eagerly.
    pub fn from_config(bot_token: &str, channel_id: &str) -> Result<Self, NotifyError> {
        Self::with_api_base(bot_token, channel_id, DEFAULT_API_BASE)
    }

    pub fn with_api_base(
        bot_token: &str,
        channel_id: &str,
        api_base: &str,
    ) -> Result<Self, NotifyError> {
        let bot_token = resolve_env_vars(bot_token)?;
        if bot_token.is_empty() {
            return Err(NotifyError::Config(
                "Discord bot token must not be empty".to_string(),
            ));
        }
        if channel_id.is_empty() || !channel_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(NotifyError::Config(format!(
                "Discord channel id must be numeric, got '{channel_id}'"
            )));
        }

        Ok(Self {
            bot_token,
            channel_id: channel_id.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/channels/{}/messages", self.api_base, self.channel_id)
    }
}

#[async_trait::async_trait]
impl Notifier for DiscordBotNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::debug!(
            channel_id = %self.channel_id,
            summary = %notification.summary(),
            "Sending Discord bot message"
        );

        let response = self
            .client
            .post(self.messages_url())
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.bot_token))
            .json(notification)
            .send()
            .await?;

        check_response(self.channel_name(), response).await?;
        tracing::info!(channel_id = %self.channel_id, "Discord bot message sent");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "discord_bot"
    }
}
