//! Persisted synchronization settings.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// User-tunable configuration for the interaction sync engine.
///
/// Loaded once at startup, replaced wholesale on edit, and re-read by
/// dependent timers through the settings store's watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Whether interactions are forwarded to the server at all.
    pub enable_server_sync: bool,
    /// Minutes between periodic sync cycles (>= 1).
    pub sync_interval: u64,
    /// Maximum interactions delivered in one batch call (>= 1).
    pub max_batch_size: usize,
    /// Retry budget reported in sync status surfaces.
    pub max_retries: u32,
    /// Keep recording locally when the server is unreachable.
    pub fallback_to_local: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enable_server_sync: true,
            sync_interval: 5,
            max_batch_size: 50,
            max_retries: 3,
            fallback_to_local: true,
        }
    }
}

impl SyncSettings {
    /// Validate field ranges before the settings are persisted.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.sync_interval < 1 {
            return Err(CoreError::Validation(
                "sync_interval must be at least 1 minute".into(),
            ));
        }
        if self.max_batch_size < 1 {
            return Err(CoreError::Validation(
                "max_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The periodic sync interval as a [`std::time::Duration`].
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync_interval * 60)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::error::CoreError;

    #[test]
    fn defaults_are_valid() {
        assert!(SyncSettings::default().validate().is_ok());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let settings = SyncSettings {
            sync_interval: 0,
            ..Default::default()
        };
        assert_matches!(settings.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let settings = SyncSettings {
            max_batch_size: 0,
            ..Default::default()
        };
        assert_matches!(settings.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn interval_converts_to_minutes() {
        let settings = SyncSettings {
            sync_interval: 2,
            ..Default::default()
        };
        assert_eq!(settings.interval(), std::time::Duration::from_secs(120));
    }
}
