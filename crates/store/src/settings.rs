//! Settings persistence and change notification.

use std::sync::Arc;

use tokio::sync::watch;

use lightbox_core::error::CoreError;
use lightbox_core::settings::SyncSettings;

use crate::keys;
use crate::kv::KvStore;

/// Loads and saves [`SyncSettings`] and notifies subscribers on change.
///
/// Dependent timers (the periodic sync loop) hold a watch receiver and
/// restart themselves when a new value is published.
pub struct SettingsStore {
    kv: Arc<KvStore>,
    tx: watch::Sender<SyncSettings>,
}

impl SettingsStore {
    /// Load settings from the store, falling back to defaults when the key
    /// is missing or malformed.
    pub fn new(kv: Arc<KvStore>) -> Self {
        let settings: SyncSettings = kv.get(keys::SYNC_SETTINGS).unwrap_or_default();
        let (tx, _) = watch::channel(settings);
        Self { kv, tx }
    }

    /// The current settings value.
    pub fn current(&self) -> SyncSettings {
        self.tx.borrow().clone()
    }

    /// Validate, persist, and publish a wholesale replacement.
    pub fn save(&self, settings: SyncSettings) -> Result<(), CoreError> {
        settings.validate()?;
        self.kv.set(keys::SYNC_SETTINGS, &settings);
        self.tx.send_replace(settings);
        Ok(())
    }

    /// Subscribe to settings changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncSettings> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn missing_key_yields_defaults() {
        let store = SettingsStore::new(Arc::new(KvStore::in_memory()));
        assert_eq!(store.current(), SyncSettings::default());
    }

    #[test]
    fn save_persists_and_notifies() {
        let kv = Arc::new(KvStore::in_memory());
        let store = SettingsStore::new(Arc::clone(&kv));
        let rx = store.subscribe();

        let edited = SyncSettings {
            sync_interval: 10,
            ..Default::default()
        };
        store.save(edited.clone()).unwrap();

        assert_eq!(rx.borrow().sync_interval, 10);
        assert_eq!(store.current(), edited);

        // A second store over the same kv sees the persisted value.
        let reloaded = SettingsStore::new(kv);
        assert_eq!(reloaded.current().sync_interval, 10);
    }

    #[test]
    fn invalid_settings_are_rejected_and_not_published() {
        let store = SettingsStore::new(Arc::new(KvStore::in_memory()));
        let invalid = SyncSettings {
            sync_interval: 0,
            ..Default::default()
        };

        assert_matches!(store.save(invalid), Err(CoreError::Validation(_)));
        assert_eq!(store.current(), SyncSettings::default());
    }
}
