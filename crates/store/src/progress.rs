//! Persisted per-job progress plus the completion notification set.
//!
//! [`JobProgressStore`] owns the lifetime of every
//! [`ProgressRecord`](lightbox_core::progress::ProgressRecord) and the
//! de-duplicating set of completed-but-unacknowledged job ids. Records are
//! persisted synchronously after every mutation; the notification set is
//! in-memory only and rebuilt from live traffic after a restart.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use lightbox_core::progress::ProgressRecord;
use lightbox_core::types::JobId;

use crate::keys;
use crate::kv::KvStore;

struct ProgressState {
    records: HashMap<JobId, ProgressRecord>,
    notifications: BTreeSet<JobId>,
}

/// Persisted map from job id to progress record.
pub struct JobProgressStore {
    kv: Arc<KvStore>,
    state: Mutex<ProgressState>,
}

impl JobProgressStore {
    /// Load all persisted records, discarding stale and corrupt entries.
    ///
    /// Entries whose message already carries a terminal marker belong to a
    /// finished job from a previous session; entries with internally
    /// inconsistent values come from interrupted writes. Both are dropped.
    pub fn load(kv: Arc<KvStore>) -> Self {
        let persisted: HashMap<JobId, ProgressRecord> =
            kv.get(keys::JOB_PROGRESS).unwrap_or_default();

        let mut records = HashMap::with_capacity(persisted.len());
        let mut stale = 0usize;
        let mut corrupt = 0usize;

        for (job_id, record) in persisted {
            if record.has_terminal_message() {
                stale += 1;
                continue;
            }
            if !record.is_consistent() {
                tracing::warn!(job_id = %job_id, "Dropping corrupt progress record");
                corrupt += 1;
                continue;
            }
            records.insert(job_id, record);
        }

        if stale > 0 || corrupt > 0 {
            tracing::info!(kept = records.len(), stale, corrupt, "Loaded job progress");
        }

        let store = Self {
            kv,
            state: Mutex::new(ProgressState {
                records,
                notifications: BTreeSet::new(),
            }),
        };
        store.persist(&store.state.lock().expect("progress mutex poisoned").records);
        store
    }

    /// The record for one job, if present.
    pub fn get(&self, job_id: &str) -> Option<ProgressRecord> {
        self.state
            .lock()
            .expect("progress mutex poisoned")
            .records
            .get(job_id)
            .cloned()
    }

    /// Insert or replace a record and persist.
    pub fn set(&self, job_id: impl Into<JobId>, record: ProgressRecord) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.records.insert(job_id.into(), record);
        self.persist(&state.records);
    }

    /// Remove a record from the live view and persist.
    pub fn remove(&self, job_id: &str) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        if state.records.remove(job_id).is_some() {
            self.persist(&state.records);
        }
    }

    /// All live records.
    pub fn all(&self) -> HashMap<JobId, ProgressRecord> {
        self.state
            .lock()
            .expect("progress mutex poisoned")
            .records
            .clone()
    }

    /// Record that a job's completion was detected but not yet acknowledged.
    ///
    /// Idempotent: returns `true` only the first time an id is added.
    pub fn notify_completed(&self, job_id: impl Into<JobId>) -> bool {
        self.state
            .lock()
            .expect("progress mutex poisoned")
            .notifications
            .insert(job_id.into())
    }

    /// Clear one notification after the user acknowledged it.
    pub fn clear_notification(&self, job_id: &str) -> bool {
        self.state
            .lock()
            .expect("progress mutex poisoned")
            .notifications
            .remove(job_id)
    }

    /// Job ids with pending completion notifications, in stable order.
    pub fn notifications(&self) -> Vec<JobId> {
        self.state
            .lock()
            .expect("progress mutex poisoned")
            .notifications
            .iter()
            .cloned()
            .collect()
    }

    fn persist(&self, records: &HashMap<JobId, ProgressRecord>) {
        self.kv.set(keys::JOB_PROGRESS, records);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(percentage: f32, message: &str) -> ProgressRecord {
        ProgressRecord {
            current: Some(1),
            total: Some(4),
            percentage,
            message: message.into(),
            evaluation_results: None,
        }
    }

    #[test]
    fn set_persists_across_reload() {
        let kv = Arc::new(KvStore::in_memory());
        let store = JobProgressStore::load(Arc::clone(&kv));
        store.set("job-1", record(25.0, "Running tagger"));

        let reloaded = JobProgressStore::load(kv);
        let loaded = reloaded.get("job-1").expect("record should survive");
        assert_eq!(loaded.percentage, 25.0);
    }

    #[test]
    fn terminal_entries_are_dropped_on_load() {
        let kv = Arc::new(KvStore::in_memory());
        {
            let store = JobProgressStore::load(Arc::clone(&kv));
            store.set("done", record(100.0, "Completed"));
            store.set("live", record(50.0, "Halfway"));
        }

        let reloaded = JobProgressStore::load(kv);
        assert!(reloaded.get("done").is_none(), "stale entry should drop");
        assert!(reloaded.get("live").is_some());
    }

    #[test]
    fn corrupt_entries_are_dropped_on_load() {
        let kv = Arc::new(KvStore::in_memory());
        {
            let store = JobProgressStore::load(Arc::clone(&kv));
            store.set(
                "bad",
                ProgressRecord {
                    current: Some(9),
                    total: Some(3),
                    ..Default::default()
                },
            );
        }

        let reloaded = JobProgressStore::load(kv);
        assert!(reloaded.get("bad").is_none());
    }

    #[test]
    fn notifications_are_idempotent() {
        let store = JobProgressStore::load(Arc::new(KvStore::in_memory()));
        assert!(store.notify_completed("job-1"));
        assert!(!store.notify_completed("job-1"));
        assert_eq!(store.notifications().len(), 1);

        assert!(store.clear_notification("job-1"));
        assert!(store.notifications().is_empty());
    }

    #[test]
    fn notifications_do_not_survive_restart() {
        let kv = Arc::new(KvStore::in_memory());
        {
            let store = JobProgressStore::load(Arc::clone(&kv));
            store.notify_completed("job-1");
        }
        let reloaded = JobProgressStore::load(kv);
        assert!(reloaded.notifications().is_empty());
    }
}
