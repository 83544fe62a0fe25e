//! Per-origin capability grants for toolhost callers.
//!
//! Grants come in two lifetimes: persistent decisions stored through a
//! [`PersistentGrantStore`] and TTL-bound once-grants held in a
//! [`TemporaryGrantStore`]. [`PermissionEngine`] merges both at read time.

#![warn(missing_docs, clippy::pedantic)]

mod engine;
mod grant;
mod stores;

pub use engine::{
    DEFAULT_ONCE_TTL, PermissionEngine, PermissionEngineBuilder, PermissionError, PermissionResult,
};
pub use grant::{
    Grant, GrantKind, GrantOptions, GrantStatus, OriginPermissionRecord, PermissionStatus, TabId,
    TemporaryGrant, merge_records,
};
pub use stores::{
    Clock, InMemoryTemporaryGrants, KvGrantStore, ManualClock, PERMISSIONS_KEY,
    PersistentGrantStore, SystemClock, TemporaryGrantStore,
};
