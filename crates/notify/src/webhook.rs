//! Discord webhook notifier.
//!
//! Broadcast deliveries post the rendered message body straight to a
//! webhook URL. No authentication beyond the URL itself.

use crate::discord::check_response;
use crate::traits::{Notification, Notifier, NotifyError};

/// Delivers notifications as JSON to a Discord webhook.
///
/// Environment variable references (`${VAR_NAME}`) in the URL are
/// resolved at construction time.
#[derive(Debug)]
pub struct DiscordWebhookNotifier {
    /// Target URL (env vars already resolved).
    url: String,
    /// Optional display-name override for the webhook author.
    username: Option<String>,
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

#[derive(serde::Serialize)]
struct WebhookBody<'a> {
    #[serde(flatten)]
    message: &'a Notification,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
}

impl DiscordWebhookNotifier {
    /// Missing env vars or a non-HTTP URL produce [`NotifyError::Config`].
    pub fn new(url: &str, username: Option<String>) -> Result<Self, NotifyError> {
        let url = resolve_env_vars(url)?;
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(NotifyError::Config(format!(
                "webhook URL must be http(s), got '{url}'"
            )));
        }
        Ok(Self {
            url,
            username,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for DiscordWebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body = WebhookBody {
            message: notification,
            username: self.username.as_deref(),
        };

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        check_response(self.channel_name(), response).await?;

        tracing::debug!(%status, summary = %notification.summary(), "webhook notification delivered");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "webhook"
    }
}

/// Expand `${VAR}` references from the process environment.
///
/// A reference to an unset variable, or one missing its closing brace,
/// is a config error.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, NotifyError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| NotifyError::Config(format!("unclosed env var reference in: {input}")))?;
        let name = &after[..end];
        let value = std::env::var(name)
            .map_err(|_| NotifyError::Config(format!("env var not found: {name}")))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Embed;

    #[test]
    fn resolves_env_reference_in_url() {
        std::env::set_var("FEEDWATCH_TEST_HOOK_ID", "123/abc");
        let notifier =
            DiscordWebhookNotifier::new("https://discord.com/api/webhooks/${FEEDWATCH_TEST_HOOK_ID}", None)
                .unwrap();
        assert_eq!(notifier.url, "https://discord.com/api/webhooks/123/abc");
        std::env::remove_var("FEEDWATCH_TEST_HOOK_ID");
    }

    #[test]
    fn missing_env_var_is_config_error() {
        match resolve_env_vars("https://${ABSOLUTELY_NOT_SET_FEEDWATCH}/hook").unwrap_err() {
            NotifyError::Config(msg) => assert!(msg.contains("ABSOLUTELY_NOT_SET_FEEDWATCH")),
            other => panic!("expected Config error, got: {other:?}"),
        }
    }

    #[test]
    fn unclosed_reference_is_config_error() {
        let err = resolve_env_vars("https://${UNCLOSED/hook").unwrap_err();
        assert!(err.to_string().contains("unclosed"));
    }

    #[test]
    fn rejects_non_http_url() {
        assert!(DiscordWebhookNotifier::new("discord://hook", None).is_err());
    }

    #[test]
    fn body_flattens_message_and_username() {
        let n = Notification::embed(Embed::new("t", 1));
        let body = WebhookBody {
            message: &n,
            username: Some("feedwatch"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["username"], "feedwatch");
        assert_eq!(json["embeds"][0]["title"], "t");
    }
}
