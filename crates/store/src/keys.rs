//! Key namespace constants for the shared [`KvStore`](crate::kv::KvStore).
//!
//! Each component owns one prefix; no key is written by two components.

/// Persisted [`SyncSettings`](lightbox_core::settings::SyncSettings).
pub const SYNC_SETTINGS: &str = "settings:sync";

/// Persisted per-job progress map.
pub const JOB_PROGRESS: &str = "progress:jobs";

/// Bounded interaction history list.
pub const INTERACTION_HISTORY: &str = "interactions:history";
