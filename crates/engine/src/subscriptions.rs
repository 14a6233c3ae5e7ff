//! On-disk tracking lists.
//!
//! The broadcast list lives at `<config_dir>/users.json`; each observer's
//! targeted list at `<data_dir>/users_dc_<observer>.json`. Both are JSON
//! arrays of [`TrackedAccount`]. Files are re-read on every cycle, so edits
//! made by the CLI take effect without a restart.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use feedwatch_connector::ContentSource;
use feedwatch_core::config::PathsConfig;
use feedwatch_core::{normalize_username, ObserverSubscriptions, TrackedAccount};

use crate::error::{StateError, SubscriptionError};
use crate::state::write_json_atomic;

const BROADCAST_FILE: &str = "users.json";
const OBSERVER_PREFIX: &str = "users_dc_";

/// Which list an operation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Broadcast,
    Observer(String),
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Broadcast => write!(f, "broadcast"),
            Scope::Observer(id) => write!(f, "observer {id}"),
        }
    }
}

/// Read side used by the detection engine.
pub trait SubscriptionSource: Send + Sync {
    fn broadcast_accounts(&self) -> Result<Vec<TrackedAccount>, SubscriptionError>;

    fn observer_subscriptions(&self) -> Result<Vec<ObserverSubscriptions>, SubscriptionError>;
}

#[derive(Debug, Default, PartialEq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub kept: usize,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionFiles {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

fn valid_observer(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse a plain-text list: one username per line, `#` comments, optional `@`.
pub fn parse_username_list(text: &str) -> Vec<String> {
    let mut names: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| normalize_username(line).to_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}

impl SubscriptionFiles {
    pub fn new(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn from_paths(paths: &PathsConfig) -> Self {
        Self::new(paths.config_dir.clone(), paths.data_dir.clone())
    }

    pub fn path(&self, scope: &Scope) -> Result<PathBuf, SubscriptionError> {
        match scope {
            Scope::Broadcast => Ok(self.config_dir.join(BROADCAST_FILE)),
            Scope::Observer(id) if valid_observer(id) => {
                Ok(self.data_dir.join(format!("{OBSERVER_PREFIX}{id}.json")))
            }
            Scope::Observer(id) => Err(SubscriptionError::InvalidObserver(id.clone())),
        }
    }

    fn read_list(path: &Path) -> Result<Vec<TrackedAccount>, SubscriptionError> {
        match fs::read_to_string(path) {
            Ok(data) => Ok(serde_json::from_str(&data).map_err(StateError::from)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self, scope: &Scope) -> Result<Vec<TrackedAccount>, SubscriptionError> {
        Self::read_list(&self.path(scope)?)
    }

    fn write(&self, scope: &Scope, accounts: &[TrackedAccount]) -> Result<(), SubscriptionError> {
        write_json_atomic(&self.path(scope)?, accounts)?;
        Ok(())
    }

    /// Append an entry. Usernames are unique per list, ignoring case.
    pub fn add(&self, scope: &Scope, entry: TrackedAccount) -> Result<(), SubscriptionError> {
        let mut accounts = self.list(scope)?;
        if accounts.iter().any(|a| a.matches(&entry.username)) {
            return Err(SubscriptionError::Duplicate(entry.username));
        }
        info!(%scope, account = %entry.username, priority = %entry.priority, "subscription added");
        accounts.push(entry);
        self.write(scope, &accounts)
    }

    /// Validate `username` against the source and add it with derived metadata.
    pub async fn add_resolved(
        &self,
        scope: &Scope,
        username: &str,
        source: &dyn ContentSource,
    ) -> Result<TrackedAccount, SubscriptionError> {
        let username = normalize_username(username);
        if self.list(scope)?.iter().any(|a| a.matches(&username)) {
            return Err(SubscriptionError::Duplicate(username));
        }
        let info = source.fetch_account(&username).await?;
        let entry = TrackedAccount::from_account(&info);
        self.add(scope, entry.clone())?;
        Ok(entry)
    }

    /// Returns `false` if no entry matched.
    pub fn remove(&self, scope: &Scope, username: &str) -> Result<bool, SubscriptionError> {
        let mut accounts = self.list(scope)?;
        let before = accounts.len();
        accounts.retain(|a| !a.matches(username));
        if accounts.len() == before {
            return Ok(false);
        }
        self.write(scope, &accounts)?;
        info!(%scope, account = %normalize_username(username), "subscription removed");
        Ok(true)
    }

    /// Observer ids with a list file, sorted.
    pub fn observers(&self) -> Result<Vec<String>, SubscriptionError> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_prefix(OBSERVER_PREFIX)
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                if valid_observer(id) {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Make the broadcast list match a plain-text username list.
    ///
    /// Entries already present keep their metadata; new names are resolved
    /// through `source` when given, falling back to a bare entry on failure.
    /// Names absent from the text list are dropped.
    pub async fn sync_from_text(
        &self,
        text_path: &Path,
        source: Option<&dyn ContentSource>,
    ) -> Result<SyncReport, SubscriptionError> {
        let text = fs::read_to_string(text_path)?;
        let wanted = parse_username_list(&text);

        let existing = self.list(&Scope::Broadcast)?;
        let mut by_name: HashMap<String, TrackedAccount> = existing
            .into_iter()
            .map(|a| (a.username.to_lowercase(), a))
            .collect();

        let mut report = SyncReport::default();
        let mut synced = Vec::with_capacity(wanted.len());
        for name in &wanted {
            if let Some(entry) = by_name.remove(name) {
                report.kept += 1;
                synced.push(entry);
                continue;
            }

            info!(account = %name, "new account in text list");
            let entry = match source {
                Some(source) => match source.fetch_account(name).await {
                    Ok(info) => TrackedAccount::from_account(&info),
                    Err(e) => {
                        warn!(account = %name, error = %e, "lookup failed, using defaults");
                        TrackedAccount::bare(name)
                    }
                },
                None => TrackedAccount::bare(name),
            };
            report.added.push(name.clone());
            synced.push(entry);
        }

        report.removed = by_name.into_values().map(|a| a.username).collect();
        report.removed.sort();

        self.write(&Scope::Broadcast, &synced)?;
        info!(
            total = synced.len(),
            added = report.added.len(),
            removed = report.removed.len(),
            "broadcast list synced"
        );
        Ok(report)
    }
}

impl SubscriptionSource for SubscriptionFiles {
    fn broadcast_accounts(&self) -> Result<Vec<TrackedAccount>, SubscriptionError> {
        self.list(&Scope::Broadcast)
    }

    /// A list that fails to parse is logged and skipped; the rest still load.
    fn observer_subscriptions(&self) -> Result<Vec<ObserverSubscriptions>, SubscriptionError> {
        let mut subs = Vec::new();
        for observer_id in self.observers()? {
            let scope = Scope::Observer(observer_id.clone());
            match self.list(&scope) {
                Ok(accounts) => subs.push(ObserverSubscriptions {
                    observer_id,
                    accounts,
                }),
                Err(e) => error!(observer = %observer_id, error = %e, "cannot read observer list"),
            }
        }
        Ok(subs)
    }
}
