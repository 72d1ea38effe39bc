//! Job and queue data model.
//!
//! [`Job`] is the server-authoritative record of one AI processing job.
//! [`LocalTask`] is the client-side optimistic placeholder created at submit
//! time, before the server has acknowledged anything. [`QueueSnapshot`] is
//! the full authoritative queue state pushed (or polled) from the server and
//! always replaces the previous snapshot wholesale.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::{JobId, LocalId, Timestamp};

/// Kind of library entity a job operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Image,
    Gallery,
    Scene,
}

impl EntityType {
    /// Lowercase wire form, also used in REST paths
    /// (e.g. `POST /queue/submit/scene`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Image => "image",
            EntityType::Gallery => "gallery",
            EntityType::Scene => "scene",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side lifecycle status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Submitted,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// One sub-unit of work within a job, with its own status and confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTest {
    pub name: String,
    pub status: JobStatus,
    /// Model confidence for this test's result, when reported (0.0-1.0).
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Server-authoritative record of one AI processing job.
///
/// Immutable once `status` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: String,
    pub status: JobStatus,
    /// Ordered sub-units, as scheduled by the server.
    #[serde(default)]
    pub tests: Vec<JobTest>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

/// Full authoritative queue state from the server.
///
/// Always replaces the previous snapshot wholesale; it is never patched
/// field-by-field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub active_jobs: Vec<Job>,
    #[serde(default)]
    pub total_active_tests: u32,
    #[serde(default)]
    pub completed_tests: u32,
    #[serde(default)]
    pub failed_tests: u32,
    /// Bounded ring of the most recently completed jobs, newest first.
    #[serde(default)]
    pub recent_completed_jobs: Vec<Job>,
}

impl QueueSnapshot {
    /// Identifiers of all currently active jobs.
    pub fn active_ids(&self) -> HashSet<JobId> {
        self.active_jobs
            .iter()
            .map(|job| job.job_id.clone())
            .collect()
    }

    /// Look up an active job by id.
    pub fn active_job(&self, job_id: &str) -> Option<&Job> {
        self.active_jobs.iter().find(|job| job.job_id == job_id)
    }
}

/// Client-side status of a [`LocalTask`].
///
/// `QueuedOnServer` / `ProcessingOnServer` mean the server has confirmed the
/// job; `Timeout` is the forced terminal state when no terminal status was
/// ever observed within the polling ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalTaskStatus {
    Pending,
    Processing,
    QueuedOnServer,
    ProcessingOnServer,
    Completed,
    Failed,
    Timeout,
}

impl LocalTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LocalTaskStatus::Completed | LocalTaskStatus::Failed | LocalTaskStatus::Timeout
        )
    }
}

/// Client-only optimistic placeholder for a job.
///
/// Created at submit time so the queue view can show the task immediately,
/// before the server has assigned a `job_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTask {
    /// Client-generated id, unique per process.
    pub local_id: LocalId,
    /// Server job id, `None` until the server acknowledges the submission.
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub kind: String,
    pub title: String,
    pub status: LocalTaskStatus,
    pub started_at: Timestamp,
}

impl LocalTask {
    /// Create a pending task with a fresh UUID and the current time.
    pub fn new(kind: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            job_id: None,
            kind: kind.into(),
            title: title.into(),
            status: LocalTaskStatus::Pending,
            started_at: chrono::Utc::now(),
        }
    }
}

/// Per-job visible state after reconciling local and server truth.
///
/// `Local` is an optimistic task the server has not confirmed yet, `Server`
/// is a job with no local submission record (e.g. submitted by another
/// session), and `Reconciled` pairs a confirmed local task with its
/// authoritative server job.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskView {
    Local { task: LocalTask },
    Server { job: Job },
    Reconciled { task: LocalTask, job: Job },
}

impl TaskView {
    /// The server job id, when one is known.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            TaskView::Local { task } => task.job_id.as_deref(),
            TaskView::Server { job } => Some(&job.job_id),
            TaskView::Reconciled { job, .. } => Some(&job.job_id),
        }
    }
}
