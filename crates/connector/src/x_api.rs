//! X (Twitter) v2 API content source.
//!
//! Requests are authenticated with one of several bearer tokens. When a
//! token is throttled (HTTP 429) the client rotates to the next one and
//! retries; once every token has been tried the call fails with
//! [`SourceError::RateLimited`] and the caller decides when to come back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use feedwatch_core::config::SourceConfig;
use feedwatch_core::{AccountInfo, Entity, Item, ItemMetrics};

use crate::source::{ContentSource, SourceError};

const USER_FIELDS: &str = "public_metrics,description,name";
const TWEET_FIELDS: &str = "created_at,public_metrics";
/// Fallback wait when a 429 carries no usable reset header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 900;

// ── Wire format ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<ApiProblem>,
}

#[derive(Debug, Deserialize)]
struct ApiProblem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl ApiProblem {
    fn message(&self) -> String {
        self.detail
            .clone()
            .or_else(|| self.title.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    username: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    public_metrics: WireUserMetrics,
}

#[derive(Debug, Default, Deserialize)]
struct WireUserMetrics {
    #[serde(default)]
    followers_count: u64,
}

#[derive(Debug, Deserialize)]
struct WireTweet {
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    public_metrics: WireTweetMetrics,
}

#[derive(Debug, Default, Deserialize)]
struct WireTweetMetrics {
    #[serde(default)]
    reply_count: u64,
    #[serde(default)]
    retweet_count: u64,
    #[serde(default)]
    like_count: u64,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl From<WireUser> for AccountInfo {
    fn from(user: WireUser) -> Self {
        AccountInfo {
            id: user.id,
            username: user.username,
            name: user.name,
            description: non_empty(user.description),
            followers_count: user.public_metrics.followers_count,
        }
    }
}

impl From<WireUser> for Entity {
    fn from(user: WireUser) -> Self {
        Entity {
            id: user.id,
            username: user.username,
            name: user.name,
            description: non_empty(user.description),
        }
    }
}

impl From<WireTweet> for Item {
    fn from(tweet: WireTweet) -> Self {
        Item {
            id: tweet.id,
            text: tweet.text,
            created_at: tweet.created_at,
            metrics: ItemMetrics {
                reply_count: tweet.public_metrics.reply_count,
                repost_count: tweet.public_metrics.retweet_count,
                like_count: tweet.public_metrics.like_count,
            },
        }
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<Envelope<T>, SourceError> {
    serde_json::from_str(body).map_err(|e| SourceError::Decode(e.to_string()))
}

/// Parse a user lookup body. A body with no `data` is a missing account.
pub(crate) fn parse_account(body: &str, username: &str) -> Result<AccountInfo, SourceError> {
    let envelope: Envelope<WireUser> = decode(body)?;
    match envelope.data {
        Some(user) => Ok(user.into()),
        None => {
            if let Some(problem) = envelope.errors.first() {
                debug!(username, error = %problem.message(), "User lookup returned errors");
            }
            Err(SourceError::NotFound(username.to_string()))
        }
    }
}

/// Parse a timeline body. Accounts with no items omit `data` entirely.
pub(crate) fn parse_items(body: &str) -> Result<Vec<Item>, SourceError> {
    let envelope: Envelope<Vec<WireTweet>> = decode(body)?;
    Ok(envelope
        .data
        .unwrap_or_default()
        .into_iter()
        .map(Item::from)
        .collect())
}

pub(crate) fn parse_entities(body: &str) -> Result<Vec<Entity>, SourceError> {
    let envelope: Envelope<Vec<WireUser>> = decode(body)?;
    Ok(envelope
        .data
        .unwrap_or_default()
        .into_iter()
        .map(Entity::from)
        .collect())
}

/// Seconds until the window resets, from `x-rate-limit-reset` (epoch secs).
fn retry_after(response: &Response) -> u64 {
    let reset = response
        .headers()
        .get("x-rate-limit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    reset_delay(reset, now)
}

fn reset_delay(reset_epoch: Option<u64>, now_epoch: u64) -> u64 {
    match reset_epoch {
        Some(reset) if reset > now_epoch => reset - now_epoch,
        Some(_) => 1,
        None => DEFAULT_RETRY_AFTER_SECS,
    }
}

// ── Token rotation ───────────────────────────────────────────────

/// Round-robin cursor over a fixed credential list.
#[derive(Debug)]
struct TokenRing {
    tokens: Vec<String>,
    current: AtomicUsize,
}

impl TokenRing {
    fn new(tokens: Vec<String>) -> Result<Self, SourceError> {
        if tokens.is_empty() {
            return Err(SourceError::NoCredentials);
        }
        Ok(Self {
            tokens,
            current: AtomicUsize::new(0),
        })
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }

    fn current(&self) -> (usize, &str) {
        let idx = self.current.load(Ordering::Relaxed) % self.tokens.len();
        (idx, &self.tokens[idx])
    }

    /// Advance past `from`. A concurrent caller that already rotated wins.
    fn rotate_from(&self, from: usize) -> usize {
        let next = (from + 1) % self.tokens.len();
        match self
            .current
            .compare_exchange(from, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => next,
            Err(actual) => actual % self.tokens.len(),
        }
    }
}

/// Outcome of probing a single credential.
#[derive(Debug)]
pub enum TokenStatus {
    Valid(AccountInfo),
    Unauthorized(u16),
    RateLimited { retry_after_secs: u64 },
    Failed(String),
}

impl TokenStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, TokenStatus::Valid(_))
    }
}

// ── Client ───────────────────────────────────────────────────────

/// [`ContentSource`] backed by the X v2 REST API.
pub struct XApiClient {
    client: reqwest::Client,
    base_url: String,
    ring: TokenRing,
}

impl XApiClient {
    pub fn new(base_url: impl Into<String>, tokens: Vec<String>) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("feedwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ring: TokenRing::new(tokens)?,
        })
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self, SourceError> {
        Self::new(config.api_base.clone(), config.bearer_tokens.clone())
    }

    pub fn token_count(&self) -> usize {
        self.ring.len()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Response, SourceError> {
        Ok(self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .query(query)
            .send()
            .await?)
    }

    /// GET `path`, rotating credentials on 429 until each was tried once.
    async fn get_body(&self, path: &str, query: &[(&str, String)]) -> Result<String, SourceError> {
        let mut attempts = 0;
        loop {
            let (idx, token) = self.ring.current();
            let response = self.send(token, path, query).await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                attempts += 1;
                let retry_after_secs = retry_after(&response);
                if attempts >= self.ring.len() {
                    warn!(path, retry_after_secs, "All credentials rate limited");
                    return Err(SourceError::RateLimited { retry_after_secs });
                }
                let next = self.ring.rotate_from(idx);
                warn!(path, from = idx, to = next, "Credential rate limited, rotating");
                continue;
            }

            return match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    Err(SourceError::Unauthorized(status.as_u16()))
                }
                StatusCode::NOT_FOUND => Err(SourceError::NotFound(path.to_string())),
                s if !s.is_success() => {
                    let body = response.text().await.unwrap_or_default();
                    Err(SourceError::Api {
                        status: s.as_u16(),
                        body,
                    })
                }
                _ => Ok(response.text().await?),
            };
        }
    }

    /// Probe one specific credential with a known username.
    pub async fn check_token(&self, token: &str, probe_username: &str) -> TokenStatus {
        let path = format!("users/by/username/{probe_username}");
        let query = [("user.fields", USER_FIELDS.to_string())];
        let response = match self.send(token, &path, &query).await {
            Ok(r) => r,
            Err(e) => return TokenStatus::Failed(e.to_string()),
        };

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => TokenStatus::RateLimited {
                retry_after_secs: retry_after(&response),
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                TokenStatus::Unauthorized(response.status().as_u16())
            }
            s if s.is_success() => match response.text().await {
                Ok(body) => match parse_account(&body, probe_username) {
                    Ok(info) => TokenStatus::Valid(info),
                    Err(e) => TokenStatus::Failed(e.to_string()),
                },
                Err(e) => TokenStatus::Failed(e.to_string()),
            },
            s => TokenStatus::Failed(format!("HTTP {s}")),
        }
    }
}

#[async_trait]
impl ContentSource for XApiClient {
    async fn fetch_account(&self, username: &str) -> Result<AccountInfo, SourceError> {
        let username = feedwatch_core::normalize_username(username);
        let path = format!("users/by/username/{username}");
        let query = [("user.fields", USER_FIELDS.to_string())];
        let body = self.get_body(&path, &query).await?;
        parse_account(&body, &username)
    }

    async fn fetch_latest_items(&self, account_id: &str, limit: u32) -> Result<Vec<Item>, SourceError> {
        // The timeline endpoint rejects max_results outside 5..=100.
        let query = [
            ("max_results", limit.clamp(5, 100).to_string()),
            ("tweet.fields", TWEET_FIELDS.to_string()),
            ("exclude", "retweets,replies".to_string()),
        ];
        let body = self
            .get_body(&format!("users/{account_id}/tweets"), &query)
            .await?;
        let mut items = parse_items(&body)?;
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn fetch_relationships(
        &self,
        account_id: &str,
        limit: u32,
    ) -> Result<Vec<Entity>, SourceError> {
        let query = [
            ("max_results", limit.clamp(1, 1000).to_string()),
            ("user.fields", USER_FIELDS.to_string()),
        ];
        let body = self
            .get_body(&format!("users/{account_id}/following"), &query)
            .await?;
        parse_entities(&body)
    }
}
