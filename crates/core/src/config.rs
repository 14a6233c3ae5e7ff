use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Channel carrying broadcast (webhook) deliveries.
pub const BROADCAST_CHANNEL: &str = "webhook_push";

/// Channel carrying targeted (bot mention) deliveries.
pub const TARGETED_CHANNEL: &str = "discord_bot";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.trim().parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub discord: DiscordConfig,
    pub paths: PathsConfig,
    pub detection: DetectionConfig,
    pub retry: RetryPolicy,
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    /// Build the full config: defaults, then the optional settings file,
    /// then environment overrides. Call `load_dotenv()` first.
    pub fn load() -> Result<Self, CoreError> {
        let paths = PathsConfig::from_env();
        let settings = if paths.settings_file.exists() {
            tracing::debug!(path = %paths.settings_file.display(), "loading settings file");
            Settings::from_file(&paths.settings_file)?
        } else {
            Settings::default()
        };

        let mut config = Self::from_parts(paths, settings);
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Assemble a config from explicit paths and settings; credentials
    /// still come from the environment.
    pub fn from_parts(paths: PathsConfig, settings: Settings) -> Self {
        Self {
            source: SourceConfig::from_env(),
            discord: DiscordConfig::from_env(),
            paths,
            detection: settings.detection,
            retry: settings.retry,
            channels: settings.channels,
        }
    }

    /// Env keys override whatever the settings file declared.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("FEEDWATCH_INTERVAL_SECS") {
            self.detection.interval_seconds = v;
        }
        if let Some(v) = env_parse("FEEDWATCH_PACING_SECS") {
            self.detection.pacing_seconds = v;
        }
        if let Some(v) = env_parse("FEEDWATCH_PROCESSED_CAP") {
            self.detection.processed_cap = v;
        }
        if let Some(v) = env_parse("FEEDWATCH_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = env_parse("FEEDWATCH_BACKOFF_BASE_SECS") {
            self.retry.backoff_base_seconds = v;
        }
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.detection.validate()?;
        self.retry.validate()?;

        let mut seen = HashSet::new();
        for channel in &self.channels {
            channel.validate()?;
            if !seen.insert(channel.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "channel '{}' is declared more than once",
                    channel.name
                )));
            }
        }
        for required in [BROADCAST_CHANNEL, TARGETED_CHANNEL] {
            if !seen.contains(required) {
                return Err(CoreError::Config(format!(
                    "channel '{required}' must be declared"
                )));
            }
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  source:     api_base={}, bearer_tokens={}",
            self.source.api_base,
            self.source.bearer_tokens.len()
        );
        tracing::info!(
            "  discord:    bot_token={}, webhook={}, channel_id={}",
            if self.discord.bot_token.is_some() { "set" } else { "(none)" },
            if self.discord.webhook_url.is_some() { "set" } else { "(none)" },
            self.discord.channel_id.as_deref().unwrap_or("(none)")
        );
        tracing::info!(
            "  paths:      config_dir={}, data_dir={}",
            self.paths.config_dir.display(),
            self.paths.data_dir.display()
        );
        tracing::info!(
            "  detection:  interval={}s, pacing={}s, processed_cap={}",
            self.detection.interval_seconds,
            self.detection.pacing_seconds,
            self.detection.processed_cap
        );
        tracing::info!(
            "  retry:      max_retries={}, backoff_base={}s",
            self.retry.max_retries,
            self.retry.backoff_base_seconds
        );
        for channel in &self.channels {
            tracing::info!(
                "  channel:    {} ({} credits / {}s)",
                channel.name,
                channel.max_credits,
                channel.refill_interval_seconds
            );
        }
    }
}

// ── Settings file ─────────────────────────────────────────────

/// Tunables read from `feedwatch.toml`. Every section is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Settings {
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            detection: DetectionConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::new(BROADCAST_CHANNEL, 5, 2.0),
        ChannelConfig::new(TARGETED_CHANNEL, 5, 5.0),
    ]
}

// ── Channels ──────────────────────────────────────────────────

/// A named delivery lane and its token-bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub max_credits: u32,
    pub refill_interval_seconds: f64,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, max_credits: u32, refill_interval_seconds: f64) -> Self {
        Self {
            name: name.into(),
            max_credits,
            refill_interval_seconds,
        }
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs_f64(self.refill_interval_seconds)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Config("channel name must not be empty".into()));
        }
        if self.max_credits == 0 {
            return Err(CoreError::Config(format!(
                "channel '{}': max_credits must be positive",
                self.name
            )));
        }
        if !positive(self.refill_interval_seconds) {
            return Err(CoreError::Config(format!(
                "channel '{}': refill_interval_seconds must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

// ── Detection cycle ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Sleep between two detection cycles.
    #[serde(default = "default_interval")]
    pub interval_seconds: f64,

    /// Pause between two tracked accounts inside one pass.
    #[serde(default = "default_pacing")]
    pub pacing_seconds: f64,

    #[serde(default = "default_item_limit")]
    pub item_limit: u32,

    #[serde(default = "default_relationship_limit")]
    pub relationship_limit: u32,

    /// Most recent item identifiers remembered for dedup.
    #[serde(default = "default_processed_cap")]
    pub processed_cap: usize,
}

fn default_interval() -> f64 {
    300.0
}

fn default_pacing() -> f64 {
    2.0
}

fn default_item_limit() -> u32 {
    5
}

fn default_relationship_limit() -> u32 {
    100
}

fn default_processed_cap() -> usize {
    10_000
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            pacing_seconds: default_pacing(),
            item_limit: default_item_limit(),
            relationship_limit: default_relationship_limit(),
            processed_cap: default_processed_cap(),
        }
    }
}

impl DetectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_seconds)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_secs_f64(self.pacing_seconds)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if !positive(self.interval_seconds) {
            return Err(CoreError::Config("detection interval_seconds must be positive".into()));
        }
        if !(self.pacing_seconds.is_finite() && self.pacing_seconds >= 0.0) {
            return Err(CoreError::Config("detection pacing_seconds must not be negative".into()));
        }
        if self.item_limit == 0 || self.relationship_limit == 0 {
            return Err(CoreError::Config("detection fetch limits must be positive".into()));
        }
        if self.processed_cap == 0 {
            return Err(CoreError::Config("detection processed_cap must be positive".into()));
        }
        Ok(())
    }
}

// ── Retry policy ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total execution attempts allowed per task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_seconds: default_backoff_base(),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-enqueueing a task that has failed `failures` times:
    /// `base * 2^(failures - 1)`.
    pub fn backoff_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(30);
        Duration::from_secs_f64(self.backoff_base_seconds * f64::from(1u32 << exponent))
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.max_retries == 0 {
            return Err(CoreError::Config("retry max_retries must be positive".into()));
        }
        if !positive(self.backoff_base_seconds) {
            return Err(CoreError::Config("retry backoff_base_seconds must be positive".into()));
        }
        Ok(())
    }
}

fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

// ── Content source ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub api_base: String,
    /// Bearer tokens rotated on rate limiting.
    #[serde(skip_serializing)]
    pub bearer_tokens: Vec<String>,
}

impl SourceConfig {
    fn from_env() -> Self {
        let raw = env_opt("FEEDWATCH_BEARER_TOKENS")
            .or_else(|| env_opt("TWITTER_BEARER_TOKEN"))
            .unwrap_or_default();
        Self {
            api_base: env_or("FEEDWATCH_API_BASE", "https://api.twitter.com/2"),
            bearer_tokens: split_tokens(&raw),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.bearer_tokens.is_empty()
    }
}

/// Split a comma-separated credential list, dropping blanks.
pub fn split_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Discord ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(skip_serializing)]
    pub bot_token: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_url: Option<String>,
    /// Channel receiving targeted (mention) deliveries.
    pub channel_id: Option<String>,
}

impl DiscordConfig {
    fn from_env() -> Self {
        Self {
            bot_token: env_opt("DISCORD_TOKEN"),
            webhook_url: env_opt("DISCORD_WEBHOOK_URL"),
            channel_id: env_opt("DISCORD_CHANNEL_ID"),
        }
    }
}

// ── Paths ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Holds `users.json` (broadcast list) and `feedwatch.toml`.
    pub config_dir: PathBuf,
    /// Holds persisted state and per-observer lists.
    pub data_dir: PathBuf,
    pub settings_file: PathBuf,
}

impl PathsConfig {
    pub fn from_env() -> Self {
        let config_dir = PathBuf::from(env_or("FEEDWATCH_CONFIG_DIR", "config"));
        let data_dir = PathBuf::from(env_or("FEEDWATCH_DATA_DIR", "data"));
        let settings_file = env_opt("FEEDWATCH_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.join("feedwatch.toml"));
        Self {
            config_dir,
            data_dir,
            settings_file,
        }
    }

    pub fn under(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            settings_file: root.join("config").join("feedwatch.toml"),
        }
    }
}
