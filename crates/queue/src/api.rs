//! REST client for the server's queue endpoints.
//!
//! Wraps job submission, per-job status polling, cancellation, and the
//! health probe using [`reqwest`].

use serde::Deserialize;

use lightbox_core::job::{EntityType, JobStatus, QueueSnapshot};
use lightbox_core::types::JobId;

/// HTTP client for the queue REST surface.
pub struct QueueApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response of `POST /queue/submit/{entity-type}`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Response of `GET /queue/status/{job_id}`.
#[derive(Debug, Deserialize)]
pub struct JobStatusResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of `GET /health`.
///
/// Besides the service/dependency status strings, the server piggybacks the
/// current queue snapshot so clients without a live push channel can still
/// refresh their view.
#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub services: serde_json::Value,
    #[serde(default)]
    pub queue_status: Option<QueueSnapshot>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy" || self.status == "ok"
    }
}

/// Errors from the queue REST layer.
#[derive(Debug, thiserror::Error)]
pub enum QueueApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("Queue API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl QueueApi {
    /// Create an API client for the given base URL (e.g. `http://host:9999`).
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }

    /// Submit a job for one entity.
    ///
    /// `POST /queue/submit/{entity-type}`. The response carries only a job
    /// id; callers track such jobs through the polling fallback rather than
    /// the push channel.
    pub async fn submit_job(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        options: &serde_json::Value,
    ) -> Result<SubmitResponse, QueueApiError> {
        let body = serde_json::json!({
            "entity_id": entity_id,
            "options": options,
        });

        let response = self
            .client
            .post(format!("{}/queue/submit/{}", self.api_url, entity_type))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Poll the status of one job. `GET /queue/status/{job_id}`.
    pub async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, QueueApiError> {
        let response = self
            .client
            .get(format!("{}/queue/status/{}", self.api_url, job_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Request cancellation of a job. `POST /jobs/{job_id}/cancel`.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), QueueApiError> {
        let response = self
            .client
            .post(format!("{}/jobs/{}/cancel", self.api_url, job_id))
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Probe service health. `GET /health`.
    pub async fn health(&self) -> Result<HealthResponse, QueueApiError> {
        let response = self
            .client
            .get(format!("{}/health", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the response
    /// unchanged on success, or a [`QueueApiError::Api`] with the status and
    /// body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, QueueApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(QueueApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, QueueApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), QueueApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_response_tolerates_missing_fields() {
        let response: SubmitResponse =
            serde_json::from_str(r#"{"success": false, "message": "queue full"}"#).unwrap();
        assert!(!response.success);
        assert!(response.job_id.is_none());
        assert_eq!(response.message.as_deref(), Some("queue full"));
    }

    #[test]
    fn job_status_response_parses_terminal_shapes() {
        let completed: JobStatusResponse =
            serde_json::from_str(r#"{"status": "completed", "result": {"tests": 3}}"#).unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(completed.result.is_some());

        let failed: JobStatusResponse =
            serde_json::from_str(r#"{"status": "failed", "error": "model crashed"}"#).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("model crashed"));
    }

    #[test]
    fn health_response_detects_healthy_states() {
        let health: HealthResponse =
            serde_json::from_str(r#"{"status": "healthy", "services": {"db": "up"}}"#).unwrap();
        assert!(health.is_healthy());
        assert!(health.queue_status.is_none());

        let degraded: HealthResponse =
            serde_json::from_str(r#"{"status": "degraded"}"#).unwrap();
        assert!(!degraded.is_healthy());
    }
}
