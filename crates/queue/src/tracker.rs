//! Job tracking service wiring the channel, reconciler, and poller.
//!
//! [`QueueTracker`] is constructed once by the application root via
//! [`QueueTracker::start`] and handed around as an `Arc`. It owns the
//! channel task (connect -> process -> reconnect), a janitor task that
//! expires stale local state, and one poll task per REST-submitted job.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use lightbox_core::job::{EntityType, LocalTaskStatus};
use lightbox_core::types::{JobId, LocalId};
use lightbox_store::progress::JobProgressStore;

use crate::api::{QueueApi, QueueApiError};
use crate::channel::{ChannelConfig, ChannelEvent, TransportChannel};
use crate::events::QueueEvent;
use crate::messages::QueueUpdateEvent;
use crate::poller::{PollOutcome, PollingConfig, PollingFallback};
use crate::reconcile::{QueueReconciler, QueueView, ReconcilerConfig, ReconcilerError};

/// Buffer between the channel task and the message consumer.
const CHANNEL_EVENT_BUFFER: usize = 64;

/// Errors surfaced by tracker operations.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The server rejected the submission.
    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Api(#[from] QueueApiError),

    #[error(transparent)]
    Reconcile(#[from] ReconcilerError),
}

/// Construction-time configuration for the tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub channel: ChannelConfig,
    /// REST base URL, e.g. `http://host:9999`.
    pub api_url: String,
    pub reconciler: ReconcilerConfig,
    pub polling: PollingConfig,
    /// Cadence of the janitor that expires stale local state.
    pub sweep_interval: Duration,
}

impl TrackerConfig {
    pub fn new(ws_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            channel: ChannelConfig::new(ws_url),
            api_url: api_url.into(),
            reconciler: ReconcilerConfig::default(),
            polling: PollingConfig::default(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Application-root service for job tracking.
pub struct QueueTracker {
    reconciler: Arc<QueueReconciler>,
    progress: Arc<JobProgressStore>,
    api: Arc<QueueApi>,
    polling: PollingConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl QueueTracker {
    /// Spawn the channel and janitor tasks and return the shared handle.
    pub fn start(config: TrackerConfig, progress: Arc<JobProgressStore>) -> Arc<Self> {
        let reconciler = Arc::new(QueueReconciler::new(
            Arc::clone(&progress),
            config.reconciler.clone(),
        ));
        let api = Arc::new(QueueApi::new(&config.api_url));
        let cancel = CancellationToken::new();

        let (events_tx, events_rx) = mpsc::channel(CHANNEL_EVENT_BUFFER);

        let channel = TransportChannel::new(config.channel.clone());
        let channel_cancel = cancel.child_token();
        let channel_task = tokio::spawn(async move {
            channel.run(events_tx, channel_cancel).await;
            tracing::info!("Queue channel task exited");
        });

        let consumer_task = tokio::spawn(consume_channel_events(
            events_rx,
            Arc::clone(&reconciler),
            Arc::clone(&api),
        ));

        let janitor_reconciler = Arc::clone(&reconciler);
        let janitor_cancel = cancel.child_token();
        let sweep_interval = config.sweep_interval;
        let janitor_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = janitor_cancel.cancelled() => return,
                    _ = ticker.tick() => janitor_reconciler.sweep(chrono::Utc::now()),
                }
            }
        });

        Arc::new(Self {
            reconciler,
            progress,
            api,
            polling: config.polling,
            cancel,
            tasks: Mutex::new(vec![channel_task, consumer_task, janitor_task]),
        })
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.reconciler.subscribe()
    }

    /// The current reconciled view.
    pub fn view(&self) -> QueueView {
        self.reconciler.view()
    }

    /// Shared progress store, for reading per-job progress records.
    pub fn progress(&self) -> &Arc<JobProgressStore> {
        &self.progress
    }

    /// Acknowledge a completion notification.
    pub fn clear_notification(&self, job_id: &str) -> bool {
        self.progress.clear_notification(job_id)
    }

    /// Submit a job through the synchronous REST call.
    ///
    /// Creates the optimistic local task first so the view updates
    /// immediately, then spawns the polling fallback to track the job to a
    /// terminal state; such jobs are not discovered through the channel.
    pub async fn submit(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        entity_name: &str,
        options: serde_json::Value,
    ) -> Result<LocalId, TrackerError> {
        let kind = format!("{entity_type}_analysis");
        let local_id = self
            .reconciler
            .submit(kind, format!("Analyze {entity_name}"));

        let response = match self.api.submit_job(entity_type, entity_id, &options).await {
            Ok(response) => response,
            Err(e) => {
                self.reconciler
                    .set_task_status(&local_id, LocalTaskStatus::Failed);
                return Err(e.into());
            }
        };

        let Some(job_id) = response.job_id.filter(|_| response.success) else {
            self.reconciler
                .set_task_status(&local_id, LocalTaskStatus::Failed);
            return Err(TrackerError::Rejected(
                response.message.unwrap_or_else(|| "no job id returned".into()),
            ));
        };

        self.reconciler.acknowledge(&local_id, job_id.clone())?;
        self.spawn_poll(local_id.clone(), job_id);
        Ok(local_id)
    }

    /// Request cancellation over the push channel.
    ///
    /// Fails synchronously when the channel is not connected; cancellation
    /// has no REST fallback.
    pub fn cancel(&self, job_id: &str) -> Result<(), TrackerError> {
        self.reconciler.cancel(job_id)?;
        Ok(())
    }

    /// Stop all timers and close the channel with the normal code.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down queue tracker");
        self.cancel.cancel();

        let tasks = std::mem::take(
            &mut *self.tasks.lock().expect("tracker mutex poisoned"),
        );
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }

        tracing::info!("Queue tracker shut down complete");
    }

    // ---- private helpers ----

    /// Track one REST-submitted job through the polling fallback.
    fn spawn_poll(&self, local_id: LocalId, job_id: JobId) {
        let poller = PollingFallback::new(Arc::clone(&self.api), self.polling.clone());
        let reconciler = Arc::clone(&self.reconciler);
        let cancel = self.cancel.child_token();

        let task = tokio::spawn(async move {
            let Some(outcome) = poller.poll(&job_id, &cancel).await else {
                return; // shutdown
            };
            match outcome {
                PollOutcome::Completed(_) => {
                    reconciler.apply_update(
                        QueueUpdateEvent::JobCompleted,
                        &job_id,
                        serde_json::Value::Null,
                    );
                }
                PollOutcome::Failed(error) => {
                    let data = match error {
                        Some(error) => serde_json::json!({ "error": error }),
                        None => serde_json::Value::Null,
                    };
                    reconciler.apply_update(QueueUpdateEvent::JobFailed, &job_id, data);
                }
                PollOutcome::Cancelled => {
                    reconciler.apply_update(
                        QueueUpdateEvent::JobCancelled,
                        &job_id,
                        serde_json::Value::Null,
                    );
                }
                PollOutcome::TimedOut => {
                    reconciler.set_task_status(&local_id, LocalTaskStatus::Timeout);
                }
            }
        });

        self.tasks
            .lock()
            .expect("tracker mutex poisoned")
            .push(task);
    }
}

/// Consume channel lifecycle events and feed the reconciler.
async fn consume_channel_events(
    mut events_rx: mpsc::Receiver<ChannelEvent>,
    reconciler: Arc<QueueReconciler>,
    api: Arc<QueueApi>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            ChannelEvent::Connected { outbound } => {
                reconciler.set_outbound(Some(outbound));
            }
            ChannelEvent::Message(message) => {
                reconciler.apply_message(message);
            }
            ChannelEvent::Disconnected { reconnecting } => {
                reconciler.set_outbound(None);
                if reconnecting {
                    // Degraded mode: the health probe piggybacks a queue
                    // snapshot, keeping the view fresh until reconnect.
                    refresh_from_health(&reconciler, &api).await;
                }
            }
        }
    }
    tracing::info!("Channel event consumer exited");
}

/// Fetch a snapshot over REST while the push channel is down.
async fn refresh_from_health(reconciler: &QueueReconciler, api: &QueueApi) {
    match api.health().await {
        Ok(health) => {
            if let Some(snapshot) = health.queue_status {
                reconciler.apply_snapshot(snapshot);
            } else {
                tracing::debug!(status = %health.status, "Health probe carried no snapshot");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health probe failed while channel is down");
        }
    }
}
