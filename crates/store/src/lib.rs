//! Persistent local state for the lightbox client engine.
//!
//! A JSON-file-backed key-value store ([`kv::KvStore`]) stands in for the
//! browser-profile storage of the original client. Typed stores sit on top
//! of it: [`settings::SettingsStore`], [`progress::JobProgressStore`], and
//! [`history::InteractionHistory`]. Components share the store but own
//! disjoint key prefixes, so no cross-component locking is needed.

pub mod history;
pub mod keys;
pub mod kv;
pub mod progress;
pub mod settings;

/// Errors from the persistence layer.
///
/// Routine mutation-time write failures are logged and swallowed inside the
/// stores (persistence is best-effort); this type surfaces only from
/// operations the caller explicitly requested, such as opening a store or
/// importing an export file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed data: {0}")]
    Malformed(#[from] serde_json::Error),
}
