//! Interaction sync engine.
//!
//! Accepts interaction records, persists them to the durable local history
//! unconditionally, and forwards them to the server on two paths: an
//! immediate attempt for latency-sensitive kinds (with queued retry on
//! failure) and a periodic batch cycle over the pending and failed queues.
//! Every batch cycle is gated on the server's database health; an unhealthy
//! cycle is skipped entirely, never partially sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use lightbox_core::error::CoreError;
use lightbox_core::interaction::Interaction;
use lightbox_core::settings::SyncSettings;
use lightbox_core::types::Timestamp;
use lightbox_store::history::InteractionHistory;
use lightbox_store::settings::SettingsStore;

use crate::api::InteractionTransport;

/// Errors surfaced synchronously to sync engine callers.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A sync cycle is already running; the caller should retry later
    /// rather than interleave two cycles.
    #[error("sync already in progress")]
    AlreadyInProgress,
}

/// What one sync cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The health gate was closed (or unreachable); nothing was attempted.
    Skipped,
    /// Both queues were empty.
    Idle,
    /// A batch of this many interactions was delivered.
    Synced(usize),
    /// Delivery failed; this many interactions moved to the failed queue.
    FailedDelivery(usize),
}

/// Point-in-time counters reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub pending: usize,
    pub failed: usize,
    pub total_synced: u64,
    pub in_progress: bool,
    pub last_sync: Option<Timestamp>,
    pub server_sync_enabled: bool,
}

struct EngineState {
    pending: VecDeque<Interaction>,
    failed: VecDeque<Interaction>,
    total_synced: u64,
    last_sync: Option<Timestamp>,
}

/// Clears the in-progress flag on every exit path.
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Forwards interactions to the server with retry and local durability.
pub struct InteractionSyncEngine {
    transport: Arc<dyn InteractionTransport>,
    history: Arc<InteractionHistory>,
    settings: Arc<SettingsStore>,
    state: Arc<Mutex<EngineState>>,
    in_progress: AtomicBool,
    cancel: CancellationToken,
}

impl InteractionSyncEngine {
    /// Construct the engine without starting the periodic timer.
    pub fn new(
        transport: Arc<dyn InteractionTransport>,
        history: Arc<InteractionHistory>,
        settings: Arc<SettingsStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            history,
            settings,
            state: Arc::new(Mutex::new(EngineState {
                pending: VecDeque::new(),
                failed: VecDeque::new(),
                total_synced: 0,
                last_sync: None,
            })),
            in_progress: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Construct the engine and spawn the periodic sync timer.
    pub fn start(
        transport: Arc<dyn InteractionTransport>,
        history: Arc<InteractionHistory>,
        settings: Arc<SettingsStore>,
    ) -> Arc<Self> {
        let engine = Self::new(transport, history, settings);
        let timer_engine = Arc::clone(&engine);
        tokio::spawn(async move { timer_engine.run_timer().await });
        engine
    }

    /// Accept one interaction.
    ///
    /// The record is written to the durable history regardless of sync
    /// settings. With server sync enabled, latency-sensitive kinds attempt
    /// immediate delivery (queued for batch retry on failure); everything
    /// else waits for the next batch cycle.
    pub fn queue(&self, interaction: Interaction) {
        self.history.record(interaction.clone());

        let settings = self.settings.current();
        if !settings.enable_server_sync {
            return;
        }

        if interaction.is_latency_sensitive() {
            let transport = Arc::clone(&self.transport);
            let state = Arc::clone(&self.state);
            tokio::spawn(async move { send_immediate(transport, state, interaction).await });
        } else {
            self.state
                .lock()
                .expect("sync engine mutex poisoned")
                .pending
                .push_back(interaction);
        }
    }

    /// Run one sync cycle now, outside the timer.
    ///
    /// Rejects concurrent invocation instead of interleaving cycles.
    pub async fn force_sync(&self) -> Result<SyncStatus, SyncError> {
        let outcome = self.perform_sync().await?;
        tracing::info!(?outcome, "Forced sync cycle finished");
        Ok(self.status())
    }

    /// Current queue depths and counters.
    pub fn status(&self) -> SyncStatus {
        let state = self.state.lock().expect("sync engine mutex poisoned");
        SyncStatus {
            pending: state.pending.len(),
            failed: state.failed.len(),
            total_synced: state.total_synced,
            in_progress: self.in_progress.load(Ordering::SeqCst),
            last_sync: state.last_sync,
            server_sync_enabled: self.settings.current().enable_server_sync,
        }
    }

    /// Replace the sync settings.
    ///
    /// The periodic timer restarts with the new interval; an in-flight
    /// cycle is not cancelled.
    pub fn update_settings(&self, settings: SyncSettings) -> Result<(), CoreError> {
        self.settings.save(settings)
    }

    /// Stop the periodic timer.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// One batch cycle: health gate, then a single batched delivery of up
    /// to `max_batch_size` items, failed items first.
    pub async fn perform_sync(&self) -> Result<SyncOutcome, SyncError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyInProgress);
        }
        let _guard = InProgressGuard(&self.in_progress);

        // Health gate: an unhealthy (or unreachable) server skips the
        // whole cycle; queues stay untouched.
        match self.transport.status().await {
            Ok(status) if status.database_healthy => {}
            Ok(_) => {
                tracing::info!("Server database unhealthy, skipping sync cycle");
                return Ok(SyncOutcome::Skipped);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sync status check failed, skipping cycle");
                return Ok(SyncOutcome::Skipped);
            }
        }

        let max_batch_size = self.settings.current().max_batch_size;
        let batch = self.take_batch(max_batch_size);
        if batch.is_empty() {
            return Ok(SyncOutcome::Idle);
        }

        match self.transport.sync_batch(&batch).await {
            Ok(response) if response.failed_count == 0 => {
                let delivered = batch.len();
                let mut state = self.state.lock().expect("sync engine mutex poisoned");
                state.total_synced += delivered as u64;
                state.last_sync = Some(chrono::Utc::now());
                tracing::info!(delivered, "Sync batch delivered");
                Ok(SyncOutcome::Synced(delivered))
            }
            Ok(response) => {
                // The server accepted the call but rejected records; retry
                // the whole batch next cycle rather than guessing which.
                tracing::warn!(
                    failed_count = response.failed_count,
                    "Server rejected part of the batch, requeueing",
                );
                Ok(self.requeue_failed(batch))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sync batch delivery failed, requeueing");
                Ok(self.requeue_failed(batch))
            }
        }
    }

    // ---- private helpers ----

    /// Pop up to `max` items for one batch, failed queue first.
    fn take_batch(&self, max: usize) -> Vec<Interaction> {
        let mut state = self.state.lock().expect("sync engine mutex poisoned");
        let mut batch = Vec::with_capacity(max.min(state.failed.len() + state.pending.len()));

        while batch.len() < max {
            let Some(item) = state.failed.pop_front() else {
                break;
            };
            batch.push(item);
        }
        while batch.len() < max {
            let Some(item) = state.pending.pop_front() else {
                break;
            };
            batch.push(item);
        }
        batch
    }

    fn requeue_failed(&self, batch: Vec<Interaction>) -> SyncOutcome {
        let count = batch.len();
        self.state
            .lock()
            .expect("sync engine mutex poisoned")
            .failed
            .extend(batch);
        SyncOutcome::FailedDelivery(count)
    }

    /// Periodic timer loop; restarts whenever the settings change.
    async fn run_timer(self: Arc<Self>) {
        let mut settings_rx = self.settings.subscribe();

        loop {
            let interval = settings_rx.borrow_and_update().interval();
            let sleep = tokio::time::sleep(interval);
            tokio::pin!(sleep);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Sync timer stopped");
                    return;
                }
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    tracing::info!("Sync settings changed, restarting timer");
                    continue;
                }
                _ = &mut sleep => {
                    match self.perform_sync().await {
                        Ok(outcome) => tracing::debug!(?outcome, "Periodic sync cycle finished"),
                        Err(SyncError::AlreadyInProgress) => {
                            tracing::debug!("Skipping periodic cycle, sync already running");
                        }
                    }
                }
            }
        }
    }
}

/// Attempt the low-latency delivery of one interaction.
///
/// A failure is never dropped: the record joins the pending queue for the
/// next batch cycle.
async fn send_immediate(
    transport: Arc<dyn InteractionTransport>,
    state: Arc<Mutex<EngineState>>,
    interaction: Interaction,
) {
    match transport.track(&interaction).await {
        Ok(()) => {
            let mut state = state.lock().expect("sync engine mutex poisoned");
            state.total_synced += 1;
            state.last_sync = Some(chrono::Utc::now());
        }
        Err(e) => {
            tracing::warn!(
                kind = %interaction.kind,
                error = %e,
                "Immediate delivery failed, queueing for batch retry",
            );
            state
                .lock()
                .expect("sync engine mutex poisoned")
                .pending
                .push_back(interaction);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use lightbox_store::kv::KvStore;

    use crate::api::{BatchSyncResponse, ServerSyncStatus, SyncApiError};

    use super::*;

    /// Programmable in-memory transport.
    struct FakeTransport {
        healthy: std::sync::atomic::AtomicBool,
        fail_batches: std::sync::atomic::AtomicBool,
        fail_track: std::sync::atomic::AtomicBool,
        status_delay: Mutex<Option<Duration>>,
        batches: Mutex<Vec<Vec<Interaction>>>,
        tracked: Mutex<Vec<Interaction>>,
        status_calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                healthy: std::sync::atomic::AtomicBool::new(true),
                fail_batches: std::sync::atomic::AtomicBool::new(false),
                fail_track: std::sync::atomic::AtomicBool::new(false),
                status_delay: Mutex::new(None),
                batches: Mutex::new(Vec::new()),
                tracked: Mutex::new(Vec::new()),
                status_calls: AtomicUsize::new(0),
            })
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        fn set_fail_batches(&self, fail: bool) {
            self.fail_batches.store(fail, Ordering::SeqCst);
        }

        fn batches(&self) -> Vec<Vec<Interaction>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InteractionTransport for FakeTransport {
        async fn track(&self, interaction: &Interaction) -> Result<(), SyncApiError> {
            if self.fail_track.load(Ordering::SeqCst) {
                return Err(SyncApiError::Api {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            self.tracked.lock().unwrap().push(interaction.clone());
            Ok(())
        }

        async fn sync_batch(
            &self,
            batch: &[Interaction],
        ) -> Result<BatchSyncResponse, SyncApiError> {
            if self.fail_batches.load(Ordering::SeqCst) {
                return Err(SyncApiError::Api {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(BatchSyncResponse {
                synced_count: batch.len(),
                failed_count: 0,
            })
        }

        async fn status(&self) -> Result<ServerSyncStatus, SyncApiError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.status_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(ServerSyncStatus {
                database_healthy: self.healthy.load(Ordering::SeqCst),
                sync_enabled: true,
            })
        }
    }

    fn engine_with(
        transport: Arc<FakeTransport>,
    ) -> (Arc<InteractionSyncEngine>, Arc<InteractionHistory>) {
        let kv = Arc::new(KvStore::in_memory());
        let history = Arc::new(InteractionHistory::load(Arc::clone(&kv)));
        let settings = Arc::new(SettingsStore::new(kv));
        let engine =
            InteractionSyncEngine::new(transport, Arc::clone(&history), settings);
        (engine, history)
    }

    fn batchable(n: usize) -> Vec<Interaction> {
        (0..n)
            .map(|i| Interaction::new("session", format!("scene_play_{i}")))
            .collect()
    }

    #[tokio::test]
    async fn batch_accounting_takes_oldest_and_counts() {
        let transport = FakeTransport::new();
        let (engine, _) = engine_with(Arc::clone(&transport));
        engine
            .update_settings(SyncSettings {
                max_batch_size: 3,
                ..Default::default()
            })
            .unwrap();

        for interaction in batchable(5) {
            engine.queue(interaction);
        }
        assert_eq!(engine.status().pending, 5);

        let outcome = engine.perform_sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Synced(3));

        let status = engine.status();
        assert_eq!(status.pending, 2);
        assert_eq!(status.total_synced, 3);

        // Exactly the first three, in order.
        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        let kinds: Vec<&str> = batches[0].iter().map(|i| i.kind.as_str()).collect();
        assert_eq!(kinds, vec!["scene_play_0", "scene_play_1", "scene_play_2"]);
    }

    #[tokio::test]
    async fn unhealthy_database_skips_cycle_with_unchanged_counts() {
        let transport = FakeTransport::new();
        transport.set_healthy(false);
        let (engine, _) = engine_with(Arc::clone(&transport));

        for interaction in batchable(4) {
            engine.queue(interaction);
        }

        let outcome = engine.perform_sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped);

        let status = engine.status();
        assert_eq!(status.pending, 4);
        assert_eq!(status.failed, 0);
        assert_eq!(status.total_synced, 0);
        assert!(transport.batches().is_empty(), "no delivery may be attempted");
    }

    #[tokio::test]
    async fn failed_batch_moves_to_failed_queue_and_retries_first() {
        let transport = FakeTransport::new();
        let (engine, _) = engine_with(Arc::clone(&transport));
        engine
            .update_settings(SyncSettings {
                max_batch_size: 2,
                ..Default::default()
            })
            .unwrap();

        for interaction in batchable(3) {
            engine.queue(interaction);
        }

        transport.set_fail_batches(true);
        let outcome = engine.perform_sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::FailedDelivery(2));
        let status = engine.status();
        assert_eq!(status.failed, 2);
        assert_eq!(status.pending, 1);

        // Next cycle drains the failed queue before the pending one.
        transport.set_fail_batches(false);
        engine.perform_sync().await.unwrap();
        let batches = transport.batches();
        let kinds: Vec<&str> = batches[0].iter().map(|i| i.kind.as_str()).collect();
        assert_eq!(kinds, vec!["scene_play_0", "scene_play_1"]);

        engine.perform_sync().await.unwrap();
        let status = engine.status();
        assert_eq!(status.pending, 0);
        assert_eq!(status.failed, 0);
        assert_eq!(status.total_synced, 3);
    }

    #[tokio::test]
    async fn local_durability_is_independent_of_sync() {
        let transport = FakeTransport::new();
        let (engine, history) = engine_with(transport);
        engine
            .update_settings(SyncSettings {
                enable_server_sync: false,
                ..Default::default()
            })
            .unwrap();

        engine.queue(Interaction::new("session", "scene_play"));

        assert_eq!(history.len(), 1, "history records regardless of settings");
        assert_eq!(engine.status().pending, 0, "nothing queued for the server");
    }

    #[tokio::test]
    async fn immediate_path_failure_queues_for_batch_retry() {
        let transport = FakeTransport::new();
        transport.fail_track.store(true, Ordering::SeqCst);
        let (engine, _) = engine_with(Arc::clone(&transport));

        engine.queue(Interaction::new("session", "error"));
        // Let the spawned immediate attempt run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let status = engine.status();
        assert_eq!(status.pending, 1, "failed immediate send must not drop");
        assert_eq!(status.total_synced, 0);
    }

    #[tokio::test]
    async fn immediate_path_success_counts() {
        let transport = FakeTransport::new();
        let (engine, _) = engine_with(Arc::clone(&transport));

        engine.queue(Interaction::new("session", "error"));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(engine.status().total_synced, 1);
        assert_eq!(transport.tracked.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_force_sync_is_rejected() {
        let transport = FakeTransport::new();
        *transport.status_delay.lock().unwrap() = Some(Duration::from_secs(1));
        let (engine, _) = engine_with(transport);

        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.force_sync().await })
        };
        tokio::task::yield_now().await;

        assert_matches!(
            engine.perform_sync().await,
            Err(SyncError::AlreadyInProgress)
        );

        // The first cycle finishes and clears the flag.
        first.await.unwrap().unwrap();
        assert!(!engine.status().in_progress);
        assert_matches!(engine.perform_sync().await, Ok(SyncOutcome::Idle));
    }

    #[tokio::test]
    async fn in_progress_flag_clears_after_failure() {
        let transport = FakeTransport::new();
        transport.set_fail_batches(true);
        let (engine, _) = engine_with(transport);
        engine.queue(Interaction::new("session", "scene_play"));

        let _ = engine.perform_sync().await.unwrap();
        assert!(!engine.status().in_progress);
    }
}
