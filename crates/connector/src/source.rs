//! ContentSource trait definition and shared error types.

use std::sync::Arc;

use async_trait::async_trait;

use feedwatch_core::{AccountInfo, Entity, Item};

/// Errors surfaced by a content source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Every credential is currently throttled.
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("credential rejected (HTTP {0})")]
    Unauthorized(u16),

    #[error("no content-source credentials configured")]
    NoCredentials,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether the same call may succeed later without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::RateLimited { .. } | SourceError::Http(_))
    }
}

/// Read-only view of tracked accounts on the upstream platform.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Resolve a username to its profile.
    async fn fetch_account(&self, username: &str) -> Result<AccountInfo, SourceError>;

    /// Most recent items published by the account, newest first.
    async fn fetch_latest_items(&self, account_id: &str, limit: u32) -> Result<Vec<Item>, SourceError>;

    /// Entities the account currently has an edge to (e.g. follows).
    async fn fetch_relationships(
        &self,
        account_id: &str,
        limit: u32,
    ) -> Result<Vec<Entity>, SourceError>;
}

/// Blanket implementation so `Arc<dyn ContentSource>` can be used directly.
#[async_trait]
impl<T: ContentSource + ?Sized> ContentSource for Arc<T> {
    async fn fetch_account(&self, username: &str) -> Result<AccountInfo, SourceError> {
        (**self).fetch_account(username).await
    }

    async fn fetch_latest_items(&self, account_id: &str, limit: u32) -> Result<Vec<Item>, SourceError> {
        (**self).fetch_latest_items(account_id, limit).await
    }

    async fn fetch_relationships(
        &self,
        account_id: &str,
        limit: u32,
    ) -> Result<Vec<Entity>, SourceError> {
        (**self).fetch_relationships(account_id, limit).await
    }
}
