//! Durable, bounded interaction history.
//!
//! Every interaction accepted by the sync engine is written here first,
//! regardless of server-sync settings, so telemetry survives offline periods
//! and process restarts. The log keeps the most recent
//! [`MAX_HISTORY_ENTRIES`] records, evicting the oldest first.
//!
//! Export, import, statistics, and retention cleanup mirror the maintenance
//! operations of the companion database plugin the original client shipped
//! with.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use lightbox_core::interaction::Interaction;
use lightbox_core::types::Timestamp;

use crate::keys;
use crate::kv::KvStore;
use crate::StoreError;

/// Upper bound on retained interactions; the oldest are evicted first.
pub const MAX_HISTORY_ENTRIES: usize = 1000;

/// Aggregate statistics over the retained history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryStatistics {
    pub total: usize,
    /// Interaction counts per kind, descending is up to the caller.
    pub by_kind: BTreeMap<String, usize>,
    pub unique_sessions: usize,
    pub unique_entities: usize,
    pub earliest: Option<Timestamp>,
    pub latest: Option<Timestamp>,
}

/// Bounded durable log of interactions, oldest first.
pub struct InteractionHistory {
    kv: Arc<KvStore>,
    entries: Mutex<VecDeque<Interaction>>,
}

impl InteractionHistory {
    /// Load the persisted history, truncating anything beyond the bound.
    pub fn load(kv: Arc<KvStore>) -> Self {
        let mut entries: VecDeque<Interaction> = kv
            .get::<Vec<Interaction>>(keys::INTERACTION_HISTORY)
            .unwrap_or_default()
            .into();

        while entries.len() > MAX_HISTORY_ENTRIES {
            entries.pop_front();
        }

        Self {
            kv,
            entries: Mutex::new(entries),
        }
    }

    /// Append an interaction, evicting the oldest entry at the bound.
    pub fn record(&self, interaction: Interaction) {
        let mut entries = self.entries.lock().expect("history mutex poisoned");
        entries.push_back(interaction);
        while entries.len() > MAX_HISTORY_ENTRIES {
            entries.pop_front();
        }
        self.persist(&entries);
    }

    /// All retained interactions, oldest first.
    pub fn all(&self) -> Vec<Interaction> {
        self.entries
            .lock()
            .expect("history mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Number of retained interactions.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("history mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export the full history to a timestamped JSON file under `dir`.
    ///
    /// Returns the path of the written file.
    pub fn export_to(&self, dir: &Path) -> Result<PathBuf, StoreError> {
        std::fs::create_dir_all(dir)?;
        let stamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
        let path = dir.join(format!("interactions_export_{stamp}.json"));

        let entries = self.all();
        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&path, json)?;

        tracing::info!(count = entries.len(), path = %path.display(), "Exported interaction history");
        Ok(path)
    }

    /// Merge interactions from a previously exported JSON file.
    ///
    /// Entries already present, identified by `(timestamp, session_id)`, are
    /// skipped. Returns the number of newly imported interactions.
    pub fn import_from(&self, path: &Path) -> Result<usize, StoreError> {
        let contents = std::fs::read_to_string(path)?;
        let incoming: Vec<Interaction> = serde_json::from_str(&contents)?;

        let mut entries = self.entries.lock().expect("history mutex poisoned");
        let mut seen: HashSet<(Timestamp, String)> = entries
            .iter()
            .map(|i| (i.timestamp, i.session_id.clone()))
            .collect();

        let mut imported = 0usize;
        for interaction in incoming {
            let key = (interaction.timestamp, interaction.session_id.clone());
            if !seen.insert(key) {
                tracing::debug!(
                    kind = %interaction.kind,
                    timestamp = %interaction.timestamp,
                    "Skipping duplicate interaction",
                );
                continue;
            }
            entries.push_back(interaction);
            imported += 1;
        }

        while entries.len() > MAX_HISTORY_ENTRIES {
            entries.pop_front();
        }
        self.persist(&entries);

        tracing::info!(imported, total = entries.len(), "Imported interactions");
        Ok(imported)
    }

    /// Aggregate statistics over the retained history.
    pub fn statistics(&self) -> HistoryStatistics {
        let entries = self.entries.lock().expect("history mutex poisoned");

        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        let mut sessions: HashSet<&str> = HashSet::new();
        let mut entities: HashSet<&str> = HashSet::new();

        for interaction in entries.iter() {
            *by_kind.entry(interaction.kind.clone()).or_default() += 1;
            sessions.insert(&interaction.session_id);
            if let Some(entity_id) = interaction.entity_id.as_deref() {
                entities.insert(entity_id);
            }
        }

        HistoryStatistics {
            total: entries.len(),
            by_kind,
            unique_sessions: sessions.len(),
            unique_entities: entities.len(),
            earliest: entries.front().map(|i| i.timestamp),
            latest: entries.back().map(|i| i.timestamp),
        }
    }

    /// Drop interactions older than the retention window.
    ///
    /// Returns the number of removed entries.
    pub fn cleanup_older_than(&self, days: i64) -> usize {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days);

        let mut entries = self.entries.lock().expect("history mutex poisoned");
        let before = entries.len();
        entries.retain(|i| i.timestamp >= cutoff);
        let removed = before - entries.len();

        if removed > 0 {
            self.persist(&entries);
            tracing::info!(removed, days, "Cleaned up old interactions");
        }
        removed
    }

    fn persist(&self, entries: &VecDeque<Interaction>) {
        let as_vec: Vec<&Interaction> = entries.iter().collect();
        self.kv.set(keys::INTERACTION_HISTORY, &as_vec);
    }
}
