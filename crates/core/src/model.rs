use serde::{Deserialize, Serialize};

/// Topic keywords recognised in account bios, on top of explicit hashtags.
const TOPIC_KEYWORDS: &[&str] = &[
    "crypto", "ai", "web3", "tech", "nft", "btc", "eth", "solana", "trading",
];

/// Profile of a tracked account as returned by the content source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub followers_count: u64,
}

/// Engagement counters attached to a content item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetrics {
    pub reply_count: u64,
    pub repost_count: u64,
    pub like_count: u64,
}

/// A unit of content published by a tracked account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub metrics: ItemMetrics,
}

/// The far end of a relationship edge (e.g. an account being followed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    #[default]
    Low,
}

impl Priority {
    pub fn from_followers(followers: u64) -> Self {
        if followers > 100_000 {
            Priority::High
        } else if followers > 10_000 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        })
    }
}

/// One entry of a subscription list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedAccount {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    500
}

impl TrackedAccount {
    /// Entry with no metadata, used when the profile cannot be fetched.
    pub fn bare(username: &str) -> Self {
        Self {
            username: normalize_username(username),
            id: None,
            name: None,
            priority: Priority::Low,
            tags: Vec::new(),
            count: default_count(),
        }
    }

    /// Entry with priority and tags derived from the account profile.
    pub fn from_account(info: &AccountInfo) -> Self {
        let priority = Priority::from_followers(info.followers_count);
        Self {
            username: normalize_username(&info.username),
            id: Some(info.id.clone()),
            name: Some(info.name.clone()),
            priority,
            tags: extract_tags(info.description.as_deref().unwrap_or_default()),
            count: if priority == Priority::High { 1000 } else { 500 },
        }
    }

    pub fn matches(&self, username: &str) -> bool {
        self.username.eq_ignore_ascii_case(normalize_username(username).as_str())
    }
}

/// Per-observer subscription list (targeted pass input).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverSubscriptions {
    pub observer_id: String,
    pub accounts: Vec<TrackedAccount>,
}

/// Strip a leading `@` and surrounding whitespace.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_string()
}

/// Hashtags plus known topic keywords found in a bio, deduplicated and sorted.
pub fn extract_tags(description: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();

    for word in description.split_whitespace() {
        for part in word.split('#').skip(1) {
            let tag: String = part
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !tag.is_empty() {
                tags.push(tag);
            }
        }
    }

    let lowered = description.to_lowercase();
    for keyword in TOPIC_KEYWORDS {
        if lowered.contains(keyword) && !tags.iter().any(|t| t == keyword) {
            tags.push((*keyword).to_string());
        }
    }

    tags.sort();
    tags.dedup();
    tags
}
