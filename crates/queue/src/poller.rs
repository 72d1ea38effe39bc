//! Per-job REST polling fallback.
//!
//! Jobs submitted through the synchronous REST call return only a job id;
//! with no push channel tracking them, [`PollingFallback`] polls
//! `GET /queue/status/{job_id}` every 2 seconds until a terminal status
//! arrives or the 5-minute wall-clock ceiling forces a `timeout`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::api::{JobStatusResponse, QueueApi, QueueApiError};

/// Seam for the status endpoint, so the poll loop can run against an
/// in-memory fake under test.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, QueueApiError>;
}

#[async_trait]
impl JobStatusSource for QueueApi {
    async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, QueueApiError> {
        QueueApi::job_status(self, job_id).await
    }
}

/// Tunable parameters for the poll loop.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Delay between status requests.
    pub poll_interval: Duration,
    /// Hard wall-clock ceiling, after which the job is force-timed-out.
    pub ceiling: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            ceiling: Duration::from_secs(5 * 60),
        }
    }
}

/// Terminal outcome observed (or forced) by the poll loop.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Completed(Option<serde_json::Value>),
    Failed(Option<String>),
    Cancelled,
    /// The ceiling elapsed without a terminal status.
    TimedOut,
}

/// Polls one job at a time until it reaches a terminal outcome.
pub struct PollingFallback<S> {
    source: Arc<S>,
    config: PollingConfig,
}

impl<S: JobStatusSource> PollingFallback<S> {
    pub fn new(source: Arc<S>, config: PollingConfig) -> Self {
        Self { source, config }
    }

    /// Poll until terminal, timed out, or cancelled.
    ///
    /// Transport errors are assumed transient: the loop logs them and keeps
    /// polling until the ceiling. Returns `None` only when `cancel` fires;
    /// otherwise the terminal outcome is returned exactly once and no
    /// further requests are issued.
    pub async fn poll(&self, job_id: &str, cancel: &CancellationToken) -> Option<PollOutcome> {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            if started.elapsed() >= self.config.ceiling {
                tracing::warn!(job_id, "Polling ceiling reached, forcing timeout");
                return Some(PollOutcome::TimedOut);
            }

            match self.source.job_status(job_id).await {
                Ok(response) => {
                    if let Some(outcome) = terminal_outcome(response) {
                        tracing::info!(job_id, ?outcome, "Job reached terminal status");
                        return Some(outcome);
                    }
                }
                Err(e) => {
                    // Transient by assumption; the next tick retries.
                    tracing::warn!(job_id, error = %e, "Status poll failed, retrying");
                }
            }
        }
    }
}

/// Extract the terminal outcome from a status response, if any.
fn terminal_outcome(response: JobStatusResponse) -> Option<PollOutcome> {
    use lightbox_core::job::JobStatus;

    match response.status {
        JobStatus::Completed => Some(PollOutcome::Completed(response.result)),
        JobStatus::Failed => Some(PollOutcome::Failed(response.error)),
        JobStatus::Cancelled => Some(PollOutcome::Cancelled),
        _ => None,
    }
}
