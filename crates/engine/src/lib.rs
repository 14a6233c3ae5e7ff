//! Change detection over tracked accounts.
//!
//! This crate provides:
//! - `DetectionEngine`, the periodic broadcast and targeted passes
//! - `StateStore` and its JSON-file implementation
//! - `SubscriptionFiles`, the on-disk tracking lists

pub mod engine;
pub mod error;
pub mod state;
pub mod subscriptions;

pub use engine::{new_edges, CycleReport, DetectionEngine, Route};
pub use error::{EngineError, StateError, SubscriptionError};
pub use state::{JsonStateStore, PersistedState, ProcessedSet, StateStore};
pub use subscriptions::{Scope, SubscriptionFiles, SubscriptionSource, SyncReport};
