//! Reconciliation of optimistic local tasks with server queue state.
//!
//! [`QueueReconciler`] merges three inputs into one consistent view: local
//! tasks created at submit time, incremental lifecycle events, and full
//! queue snapshots. Completion is detected by set-difference of active job
//! ids between consecutive snapshots; event-tagged terminal transitions
//! take precedence over snapshot inference, and a snapshot that disagrees
//! with an already-applied terminal event is treated as stale.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use lightbox_core::job::{Job, JobStatus, LocalTask, LocalTaskStatus, QueueSnapshot, TaskView};
use lightbox_core::progress::ProgressRecord;
use lightbox_core::types::{JobId, LocalId, Timestamp};
use lightbox_store::progress::JobProgressStore;

use crate::channel::Outbound;
use crate::events::QueueEvent;
use crate::messages::{
    ClientMessage, FailurePayload, ProgressPayload, QueueUpdateEvent, ServerMessage,
};

/// Broadcast capacity for queue events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunable lifetimes for reconciled state.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long terminal tasks and progress records stay in the live view
    /// so the UI can show the final state.
    pub terminal_grace: Duration,
    /// Absolute ceiling after which a task with no observed terminal
    /// status is forced to `timeout`.
    pub task_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            terminal_grace: Duration::from_secs(3),
            task_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Errors surfaced synchronously to reconciler callers.
#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    /// Cancellation needs a live push channel; there is no REST fallback.
    #[error("Cannot cancel job {0}: channel not connected")]
    CannotCancel(JobId),

    /// No local task with the given id exists.
    #[error("Local task {0} not found")]
    TaskNotFound(LocalId),
}

struct ReconcilerState {
    snapshot: QueueSnapshot,
    previous_active: HashSet<JobId>,
    local_tasks: HashMap<LocalId, LocalTask>,
    /// When each terminal task entered its terminal state.
    terminal_since: HashMap<LocalId, Timestamp>,
    /// Jobs terminated by an explicit event; a later snapshot still listing
    /// them as active is stale and must not resurrect them.
    event_terminated: HashMap<JobId, JobStatus>,
    /// Progress records scheduled to leave the live view at the given time.
    progress_removals: Vec<(JobId, Timestamp)>,
}

/// Read-only view consumed by callers.
#[derive(Debug, Clone)]
pub struct QueueView {
    pub active_jobs: Vec<Job>,
    pub local_tasks: Vec<LocalTask>,
    /// Per-job reconciled union of local and server truth.
    pub tasks: Vec<TaskView>,
    pub notifications: Vec<JobId>,
}

/// Merges local optimistic state with authoritative server state.
pub struct QueueReconciler {
    progress: Arc<JobProgressStore>,
    state: Mutex<ReconcilerState>,
    events_tx: broadcast::Sender<QueueEvent>,
    /// Outbound frame sender while the channel is connected.
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    config: ReconcilerConfig,
}

impl QueueReconciler {
    pub fn new(progress: Arc<JobProgressStore>, config: ReconcilerConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            progress,
            state: Mutex::new(ReconcilerState {
                snapshot: QueueSnapshot::default(),
                previous_active: HashSet::new(),
                local_tasks: HashMap::new(),
                terminal_since: HashMap::new(),
                event_terminated: HashMap::new(),
                progress_removals: Vec::new(),
            }),
            events_tx,
            outbound: Mutex::new(None),
            config,
        }
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }

    /// Install (or clear) the outbound sender for the push channel.
    ///
    /// The tracker calls this on connect and disconnect.
    pub(crate) fn set_outbound(&self, sender: Option<mpsc::Sender<Outbound>>) {
        let connected = sender.is_some();
        *self.outbound.lock().expect("reconciler mutex poisoned") = sender;
        self.emit(if connected {
            QueueEvent::ChannelConnected
        } else {
            QueueEvent::ChannelDisconnected
        });
    }

    /// Create an optimistic local task; the caller shows it immediately.
    pub fn submit(&self, kind: impl Into<String>, title: impl Into<String>) -> LocalId {
        let task = LocalTask::new(kind, title);
        let local_id = task.local_id.clone();

        self.state
            .lock()
            .expect("reconciler mutex poisoned")
            .local_tasks
            .insert(local_id.clone(), task);

        self.emit(QueueEvent::TaskSubmitted {
            local_id: local_id.clone(),
        });
        local_id
    }

    /// Attach the server-assigned job id to a local task.
    pub fn acknowledge(&self, local_id: &str, job_id: impl Into<JobId>) -> Result<(), ReconcilerError> {
        let mut state = self.state.lock().expect("reconciler mutex poisoned");
        let task = state
            .local_tasks
            .get_mut(local_id)
            .ok_or_else(|| ReconcilerError::TaskNotFound(local_id.to_string()))?;

        task.job_id = Some(job_id.into());
        task.status = LocalTaskStatus::QueuedOnServer;
        let status = task.status;
        drop(state);

        self.emit(QueueEvent::TaskUpdated {
            local_id: local_id.to_string(),
            status,
        });
        Ok(())
    }

    /// Request cancellation of a job over the push channel.
    ///
    /// Fire-and-forget: the result arrives later as a `cancel_response` or
    /// `job_cancelled` event. Fails when the channel is not connected —
    /// there is no REST fallback for cancellation.
    pub fn cancel(&self, job_id: &str) -> Result<(), ReconcilerError> {
        let outbound = self.outbound.lock().expect("reconciler mutex poisoned");
        let sender = outbound
            .as_ref()
            .filter(|sender| !sender.is_closed())
            .ok_or_else(|| ReconcilerError::CannotCancel(job_id.to_string()))?;

        let message = ClientMessage::CancelJob {
            job_id: job_id.to_string(),
        };
        let json = serde_json::to_string(&message)
            .expect("ClientMessage is always serialisable");

        sender
            .try_send(Outbound::Text(json))
            .map_err(|_| ReconcilerError::CannotCancel(job_id.to_string()))?;

        tracing::info!(job_id, "Requested job cancellation");
        Ok(())
    }

    /// Update the status of a local task directly.
    ///
    /// Used by the polling fallback, which observes terminal transitions
    /// outside the push channel.
    pub fn set_task_status(&self, local_id: &str, status: LocalTaskStatus) {
        let mut state = self.state.lock().expect("reconciler mutex poisoned");
        let Some(task) = state.local_tasks.get_mut(local_id) else {
            return;
        };
        if task.status == status {
            return;
        }
        task.status = status;
        if status.is_terminal() {
            let now = chrono::Utc::now();
            state.terminal_since.insert(local_id.to_string(), now);
        }
        drop(state);

        self.emit(QueueEvent::TaskUpdated {
            local_id: local_id.to_string(),
            status,
        });
    }

    /// The local task with the given id, if still tracked.
    pub fn task(&self, local_id: &str) -> Option<LocalTask> {
        self.state
            .lock()
            .expect("reconciler mutex poisoned")
            .local_tasks
            .get(local_id)
            .cloned()
    }

    /// Dispatch one parsed inbound message.
    pub fn apply_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::QueueStatus { queue_status } => self.apply_snapshot(queue_status),
            ServerMessage::QueueUpdate {
                event,
                job_id,
                data,
            } => self.apply_update(event, &job_id, data),
            ServerMessage::CancelResponse {
                job_id,
                success,
                message,
            } => {
                if success {
                    tracing::info!(job_id = %job_id, "Cancellation accepted");
                } else {
                    tracing::warn!(
                        job_id = %job_id,
                        message = message.as_deref().unwrap_or(""),
                        "Cancellation rejected",
                    );
                }
            }
        }
    }

    /// Replace the previous snapshot wholesale and diff for completions.
    pub fn apply_snapshot(&self, snapshot: QueueSnapshot) {
        let now = chrono::Utc::now();
        let current_ids = snapshot.active_ids();

        let mut guard = self.state.lock().expect("reconciler mutex poisoned");
        let state = &mut *guard;

        // Jobs that were active and no longer are, completed by inference,
        // unless an explicit terminal event already handled them.
        let completed: Vec<JobId> = state
            .previous_active
            .difference(&current_ids)
            .filter(|id| !state.event_terminated.contains_key(*id))
            .cloned()
            .collect();

        for job_id in &completed {
            self.mark_progress_terminal(job_id, "Completed", None);
            state
                .progress_removals
                .push((job_id.clone(), now + chrono::Duration::from_std(self.config.terminal_grace).unwrap_or_default()));

            // Local task, if any, follows the inferred completion.
            let local_id = state
                .local_tasks
                .iter()
                .find(|(_, task)| task.job_id.as_deref() == Some(job_id.as_str()))
                .map(|(id, _)| id.clone());
            if let Some(local_id) = local_id {
                if let Some(task) = state.local_tasks.get_mut(&local_id) {
                    task.status = LocalTaskStatus::Completed;
                }
                state.terminal_since.insert(local_id.clone(), now);
                self.emit(QueueEvent::TaskUpdated {
                    local_id,
                    status: LocalTaskStatus::Completed,
                });
            }

            if self.progress.notify_completed(job_id.clone()) {
                self.emit(QueueEvent::NotificationAdded {
                    job_id: job_id.clone(),
                });
            }
            self.emit(QueueEvent::JobCompleted {
                job_id: job_id.clone(),
            });
        }

        // Confirm local tasks the snapshot now lists as active.
        let mut task_updates: Vec<(LocalId, LocalTaskStatus)> = Vec::new();
        for (local_id, task) in state.local_tasks.iter_mut() {
            let Some(job_id) = task.job_id.as_deref() else {
                continue;
            };
            // An event already decided this job; the snapshot is stale.
            if state.event_terminated.contains_key(job_id) {
                continue;
            }
            let Some(job) = snapshot.active_job(job_id) else {
                continue;
            };
            let status = match job.status {
                JobStatus::Processing => LocalTaskStatus::ProcessingOnServer,
                _ => LocalTaskStatus::QueuedOnServer,
            };
            if task.status != status && !task.status.is_terminal() {
                task.status = status;
                task_updates.push((local_id.clone(), status));
            }
        }

        // The server no longer lists event-terminated jobs: agreement
        // reached, the stale-snapshot guard can forget them.
        state
            .event_terminated
            .retain(|job_id, _| current_ids.contains(job_id));

        state.previous_active = current_ids;
        let active = snapshot.active_jobs.len();
        state.snapshot = snapshot;
        drop(guard);

        for (local_id, status) in task_updates {
            self.emit(QueueEvent::TaskUpdated { local_id, status });
        }
        self.emit(QueueEvent::SnapshotApplied { active, completed });
    }

    /// Apply one incremental lifecycle event.
    ///
    /// Terminal events apply immediately and win over any snapshot.
    pub fn apply_update(&self, event: QueueUpdateEvent, job_id: &str, data: serde_json::Value) {
        match event {
            QueueUpdateEvent::JobSubmitted => {
                self.update_task_for_job(job_id, LocalTaskStatus::QueuedOnServer);
            }
            QueueUpdateEvent::JobStarted => {
                if self.progress.get(job_id).is_none() {
                    self.progress.set(
                        job_id,
                        ProgressRecord {
                            message: "Processing".into(),
                            ..Default::default()
                        },
                    );
                }
                self.update_task_for_job(job_id, LocalTaskStatus::ProcessingOnServer);
            }
            QueueUpdateEvent::JobProgress => {
                self.apply_progress(job_id, data);
            }
            QueueUpdateEvent::JobCompleted => {
                self.apply_terminal_event(job_id, JobStatus::Completed, None);
            }
            QueueUpdateEvent::JobFailed => {
                let error = serde_json::from_value::<FailurePayload>(data)
                    .ok()
                    .and_then(|payload| payload.error);
                self.apply_terminal_event(job_id, JobStatus::Failed, error);
            }
            QueueUpdateEvent::JobCancelled => {
                self.apply_terminal_event(job_id, JobStatus::Cancelled, None);
            }
        }
    }

    /// Remove expired terminal tasks, expire stale ones, and retire
    /// progress records whose grace period elapsed.
    ///
    /// Driven by the tracker on a short interval; takes `now` explicitly so
    /// lifetimes are deterministic under test.
    pub fn sweep(&self, now: Timestamp) {
        let grace = chrono::Duration::from_std(self.config.terminal_grace).unwrap_or_default();
        let timeout = chrono::Duration::from_std(self.config.task_timeout).unwrap_or_default();

        let mut timed_out: Vec<LocalId> = Vec::new();
        let mut due_removals: Vec<JobId> = Vec::new();

        {
            let mut state = self.state.lock().expect("reconciler mutex poisoned");

            // Force-timeout tasks that never reached a terminal status.
            for (local_id, task) in state.local_tasks.iter_mut() {
                if !task.status.is_terminal() && now - task.started_at >= timeout {
                    task.status = LocalTaskStatus::Timeout;
                    timed_out.push(local_id.clone());
                }
            }
            for local_id in &timed_out {
                state.terminal_since.insert(local_id.clone(), now);
            }

            // Remove terminal tasks whose grace period elapsed.
            let expired: Vec<LocalId> = state
                .terminal_since
                .iter()
                .filter(|(_, since)| now - **since >= grace)
                .map(|(id, _)| id.clone())
                .collect();
            for local_id in expired {
                state.local_tasks.remove(&local_id);
                state.terminal_since.remove(&local_id);
            }

            // Retire progress records from the live view.
            state.progress_removals.retain(|(job_id, due)| {
                if now >= *due {
                    due_removals.push(job_id.clone());
                    false
                } else {
                    true
                }
            });
        }

        for job_id in due_removals {
            self.progress.remove(&job_id);
        }
        for local_id in timed_out {
            tracing::warn!(local_id = %local_id, "Task timed out without terminal status");
            self.emit(QueueEvent::TaskUpdated {
                local_id,
                status: LocalTaskStatus::Timeout,
            });
        }
    }

    /// The current reconciled view.
    pub fn view(&self) -> QueueView {
        let state = self.state.lock().expect("reconciler mutex poisoned");

        // Event-terminated jobs in the snapshot are stale; filter them out.
        let active_jobs: Vec<Job> = state
            .snapshot
            .active_jobs
            .iter()
            .filter(|job| !state.event_terminated.contains_key(&job.job_id))
            .cloned()
            .collect();

        let local_tasks: Vec<LocalTask> = state.local_tasks.values().cloned().collect();

        let mut claimed: HashSet<&str> = HashSet::new();
        let mut tasks: Vec<TaskView> = Vec::new();
        for task in &local_tasks {
            let job = task
                .job_id
                .as_deref()
                .and_then(|job_id| active_jobs.iter().find(|job| job.job_id == job_id));
            match job {
                Some(job) => {
                    claimed.insert(job.job_id.as_str());
                    tasks.push(TaskView::Reconciled {
                        task: task.clone(),
                        job: job.clone(),
                    });
                }
                None => tasks.push(TaskView::Local { task: task.clone() }),
            }
        }
        for job in &active_jobs {
            if !claimed.contains(job.job_id.as_str()) {
                tasks.push(TaskView::Server { job: job.clone() });
            }
        }

        QueueView {
            active_jobs,
            local_tasks,
            tasks,
            notifications: self.progress.notifications(),
        }
    }

    // ---- private helpers ----

    fn apply_progress(&self, job_id: &str, data: serde_json::Value) {
        let payload: ProgressPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Malformed progress payload");
                return;
            }
        };

        let mut record = self.progress.get(job_id).unwrap_or_default();
        record.current = payload.current.or(record.current);
        record.total = payload.total.or(record.total);
        if let Some(message) = payload.message {
            record.message = message;
        }
        if let Some(results) = payload.evaluation_results {
            record.evaluation_results = Some(results);
        }
        record.percentage = match payload.percentage {
            // Server-supplied percentage is authoritative.
            Some(percentage) => percentage,
            None => match (record.current, record.total) {
                (Some(current), Some(total)) if total > 0 => {
                    (current as f32 / total as f32) * 100.0
                }
                _ => record.percentage,
            },
        };

        let percentage = record.percentage;
        self.progress.set(job_id, record);
        self.emit(QueueEvent::JobProgress {
            job_id: job_id.to_string(),
            percentage,
        });
    }

    fn apply_terminal_event(&self, job_id: &str, status: JobStatus, error: Option<String>) {
        let now = chrono::Utc::now();
        let grace = chrono::Duration::from_std(self.config.terminal_grace).unwrap_or_default();

        let (marker, task_status) = match status {
            JobStatus::Completed => ("Completed", LocalTaskStatus::Completed),
            JobStatus::Failed => ("Failed", LocalTaskStatus::Failed),
            // Local task statuses have no cancelled arm; a cancelled job is
            // a failed task from the submitter's point of view.
            _ => ("Cancelled", LocalTaskStatus::Failed),
        };

        self.mark_progress_terminal(job_id, marker, error.as_deref());

        {
            let mut state = self.state.lock().expect("reconciler mutex poisoned");
            state.event_terminated.insert(job_id.to_string(), status);
            state.progress_removals.push((job_id.to_string(), now + grace));

            let local_id = state
                .local_tasks
                .iter()
                .find(|(_, task)| task.job_id.as_deref() == Some(job_id))
                .map(|(id, _)| id.clone());
            if let Some(local_id) = local_id {
                if let Some(task) = state.local_tasks.get_mut(&local_id) {
                    task.status = task_status;
                }
                state.terminal_since.insert(local_id.clone(), now);
                self.emit(QueueEvent::TaskUpdated {
                    local_id,
                    status: task_status,
                });
            }
        }

        match status {
            JobStatus::Completed => {
                // Completions notify even with no matching local task:
                // jobs submitted by another session stay visible here.
                if self.progress.notify_completed(job_id.to_string()) {
                    self.emit(QueueEvent::NotificationAdded {
                        job_id: job_id.to_string(),
                    });
                }
                self.emit(QueueEvent::JobCompleted {
                    job_id: job_id.to_string(),
                });
            }
            JobStatus::Failed => self.emit(QueueEvent::JobFailed {
                job_id: job_id.to_string(),
                error,
            }),
            _ => self.emit(QueueEvent::JobCancelled {
                job_id: job_id.to_string(),
            }),
        }
    }

    fn mark_progress_terminal(&self, job_id: &str, marker: &str, detail: Option<&str>) {
        let mut record = self.progress.get(job_id).unwrap_or_default();
        record.set_terminal(marker, detail);
        if marker == "Completed" {
            record.percentage = 100.0;
        }
        self.progress.set(job_id, record);
    }

    fn update_task_for_job(&self, job_id: &str, status: LocalTaskStatus) {
        let mut state = self.state.lock().expect("reconciler mutex poisoned");
        let local_id = state
            .local_tasks
            .iter()
            .find(|(_, task)| task.job_id.as_deref() == Some(job_id))
            .map(|(id, _)| id.clone());
        let Some(local_id) = local_id else {
            return;
        };
        let Some(task) = state.local_tasks.get_mut(&local_id) else {
            return;
        };
        if task.status == status || task.status.is_terminal() {
            return;
        }
        task.status = status;
        drop(state);

        self.emit(QueueEvent::TaskUpdated { local_id, status });
    }

    fn emit(&self, event: QueueEvent) {
        // SendError only means there are zero subscribers.
        let _ = self.events_tx.send(event);
    }
}
