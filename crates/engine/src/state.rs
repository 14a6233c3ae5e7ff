//! Persisted detection state.
//!
//! Two records survive restarts: the processed-item identifiers (a flat
//! list, least recently seen first) and the relationship snapshot (account id to the
//! entity ids last seen). Both are loaded whole and rewritten whole.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::StateError;

pub const PROCESSED_IDS_FILE: &str = "processed_ids.json";
pub const SNAPSHOT_FILE: &str = "following_snapshot.json";

/// Bounded set of already-notified item identifiers.
///
/// Ordered least recently seen first. Identifiers seen during the current
/// cycle (looked up with [`seen`](Self::seen) or inserted) move to the back
/// and are never evicted by [`end_cycle`](Self::end_cycle), so an item that
/// any account still returns stays known however much churn other accounts
/// cause. The set only exceeds `cap` when one cycle sees more than `cap`
/// identifiers.
#[derive(Debug, Clone)]
pub struct ProcessedSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    current: HashSet<String>,
    cap: usize,
}

impl ProcessedSet {
    pub fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            current: HashSet::new(),
            cap: cap.max(1),
        }
    }

    /// Rebuild from a persisted list, least recently seen first.
    /// Duplicates are ignored. Nothing is evicted before the first
    /// [`end_cycle`](Self::end_cycle), so a list saved above the cap
    /// survives a restart intact.
    pub fn from_list(ids: impl IntoIterator<Item = String>, cap: usize) -> Self {
        let mut set = Self::new(cap);
        for id in ids {
            if set.members.insert(id.clone()) {
                set.order.push_back(id);
            }
        }
        set
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Returns `true` if the identifier is known, and marks it as seen in
    /// the current cycle.
    pub fn seen(&mut self, id: &str) -> bool {
        if !self.members.contains(id) {
            return false;
        }
        if let Some(pos) = self.order.iter().position(|known| known == id) {
            if let Some(known) = self.order.remove(pos) {
                self.order.push_back(known);
            }
        }
        self.current.insert(id.to_string());
        true
    }

    /// Returns `false` if the identifier was already present.
    pub fn insert(&mut self, id: String) -> bool {
        if self.seen(&id) {
            return false;
        }
        self.members.insert(id.clone());
        self.current.insert(id.clone());
        self.order.push_back(id);
        true
    }

    /// Evict down to the cap, sparing everything seen this cycle, and
    /// start a new cycle.
    pub fn end_cycle(&mut self) {
        self.evict();
        self.current.clear();
    }

    fn evict(&mut self) {
        while self.order.len() > self.cap {
            match self.order.front() {
                Some(oldest) if !self.current.contains(oldest) => {
                    if let Some(oldest) = self.order.pop_front() {
                        self.members.remove(&oldest);
                    }
                }
                _ => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Least recently seen first.
    pub fn to_list(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

/// Everything the engine persists between runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub processed_ids: Vec<String>,
    /// An entry with an empty list means "observed, no edges"; a missing
    /// entry means "never observed".
    pub relationships: BTreeMap<String, Vec<String>>,
}

/// Load/save seam for [`PersistedState`].
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<PersistedState, StateError>;

    /// Full overwrite of both records.
    fn save(&self, state: &PersistedState) -> Result<(), StateError>;
}

/// Stores each record as a pretty-printed JSON file under one directory.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_record<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, StateError> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "state record missing, starting empty");
                Ok(T::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `value` as JSON next to `path`, then rename over it.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<PersistedState, StateError> {
        Ok(PersistedState {
            processed_ids: self.read_record(PROCESSED_IDS_FILE)?,
            relationships: self.read_record(SNAPSHOT_FILE)?,
        })
    }

    fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        write_json_atomic(&self.dir.join(PROCESSED_IDS_FILE), &state.processed_ids)?;
        write_json_atomic(&self.dir.join(SNAPSHOT_FILE), &state.relationships)?;
        debug!(
            dir = %self.dir.display(),
            processed = state.processed_ids.len(),
            accounts = state.relationships.len(),
            "state saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn processed_set_evicts_least_recently_seen() {
        let mut set = ProcessedSet::new(3);
        for id in ["1", "2", "3"] {
            assert!(set.insert(id.to_string()));
        }
        set.end_cycle();

        assert!(set.seen("1"));
        assert!(!set.insert("2".to_string()));
        assert!(set.insert("4".to_string()));
        set.end_cycle();

        assert!(!set.contains("3"));
        assert_eq!(set.to_list(), vec!["1", "2", "4"]);
    }

    #[test]
    fn identifiers_seen_this_cycle_survive_overflow() {
        let mut set = ProcessedSet::new(2);
        for id in ["a", "b", "c"] {
            set.insert(id.to_string());
        }
        set.end_cycle();
        assert_eq!(set.len(), 3);

        // Next cycle still returns all three: nothing is dropped.
        for id in ["a", "b", "c"] {
            assert!(set.seen(id));
        }
        set.end_cycle();
        assert_eq!(set.len(), 3);

        // Once "a" is no longer returned it goes first.
        set.seen("b");
        set.seen("c");
        set.end_cycle();
        assert_eq!(set.to_list(), vec!["b", "c"]);
    }

    #[test]
    fn from_list_trims_after_first_cycle() {
        let ids = ["1", "2", "3", "2", "4", "5"].map(String::from);
        let mut set = ProcessedSet::from_list(ids, 2);
        assert_eq!(set.len(), 5);
        assert!(set.contains("1"));

        set.end_cycle();
        assert_eq!(set.to_list(), vec!["4", "5"]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn missing_files_load_empty() {
        let tmp = TempDir::new().unwrap();
        let store = JsonStateStore::new(tmp.path().join("data"));
        assert_eq!(store.load().unwrap(), PersistedState::default());
    }

    #[test]
    fn save_then_load_preserves_empty_snapshot_entries() {
        let tmp = TempDir::new().unwrap();
        let store = JsonStateStore::new(tmp.path());
        let mut state = PersistedState {
            processed_ids: vec!["10".into(), "11".into()],
            ..Default::default()
        };
        state.relationships.insert("acct-1".into(), vec!["a".into(), "b".into()]);
        state.relationships.insert("acct-2".into(), Vec::new());

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.relationships.contains_key("acct-2"));
        assert!(!tmp.path().join("processed_ids.json.tmp").exists());
    }

    #[test]
    fn reads_files_in_plain_list_and_map_shape() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(PROCESSED_IDS_FILE), r#"["1","2"]"#).unwrap();
        fs::write(tmp.path().join(SNAPSHOT_FILE), r#"{"99":["7","8"]}"#).unwrap();

        let loaded = JsonStateStore::new(tmp.path()).load().unwrap();
        assert_eq!(loaded.processed_ids, vec!["1", "2"]);
        assert_eq!(loaded.relationships["99"], vec!["7", "8"]);
    }

    #[test]
    fn corrupt_file_is_json_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(PROCESSED_IDS_FILE), "{not json").unwrap();
        let err = JsonStateStore::new(tmp.path()).load().unwrap_err();
        assert!(matches!(err, StateError::Json(_)));
    }
}
