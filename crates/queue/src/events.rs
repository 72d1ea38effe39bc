//! Events emitted by the queue tracker.
//!
//! The UI layer subscribes to these through a [`tokio::sync::broadcast`]
//! channel instead of observing internal state; events fire only on
//! meaningful transitions (status change, snapshot diff, notification),
//! never on every tick.

use serde::Serialize;

use lightbox_core::job::LocalTaskStatus;
use lightbox_core::types::{JobId, LocalId};

/// A state transition worth presenting to the user.
#[derive(Debug, Clone, Serialize)]
pub enum QueueEvent {
    /// The push channel connected (or reconnected).
    ChannelConnected,

    /// The push channel dropped; a reconnect may follow.
    ChannelDisconnected,

    /// An optimistic local task was created at submit time.
    TaskSubmitted { local_id: LocalId },

    /// A local task changed status.
    TaskUpdated {
        local_id: LocalId,
        status: LocalTaskStatus,
    },

    /// A job reported step-level progress.
    JobProgress { job_id: JobId, percentage: f32 },

    /// A job finished successfully (event- or snapshot-detected).
    JobCompleted { job_id: JobId },

    /// A job failed.
    JobFailed {
        job_id: JobId,
        error: Option<String>,
    },

    /// A job was cancelled.
    JobCancelled { job_id: JobId },

    /// A fresh authoritative snapshot replaced the previous one.
    SnapshotApplied {
        active: usize,
        completed: Vec<JobId>,
    },

    /// A completion joined the notification set.
    NotificationAdded { job_id: JobId },
}
