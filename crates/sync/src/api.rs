//! REST client for the interaction endpoints.
//!
//! [`InteractionTransport`] is the seam the sync engine talks through;
//! [`InteractionApi`] is the production implementation over [`reqwest`].
//! Tests substitute an in-memory fake.

use async_trait::async_trait;
use serde::Deserialize;

use lightbox_core::interaction::Interaction;

/// Response of `POST /interactions/sync`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSyncResponse {
    pub synced_count: usize,
    pub failed_count: usize,
}

/// Response of `GET /interactions/status`.
///
/// `database_healthy` gates every batch cycle: an unhealthy database skips
/// the cycle entirely, with no partial sends.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSyncStatus {
    pub database_healthy: bool,
    pub sync_enabled: bool,
}

/// Errors from the interaction REST layer.
#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("Interaction API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// Server-side delivery operations used by the sync engine.
#[async_trait]
pub trait InteractionTransport: Send + Sync {
    /// Low-latency single-record delivery. `POST /interactions/track`.
    async fn track(&self, interaction: &Interaction) -> Result<(), SyncApiError>;

    /// Batched delivery. `POST /interactions/sync`, body is an array.
    async fn sync_batch(&self, batch: &[Interaction]) -> Result<BatchSyncResponse, SyncApiError>;

    /// Health/readiness probe. `GET /interactions/status`.
    async fn status(&self) -> Result<ServerSyncStatus, SyncApiError>;
}

/// HTTP client for the interaction REST surface.
pub struct InteractionApi {
    client: reqwest::Client,
    api_url: String,
}

impl InteractionApi {
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

    // ---- private helpers ----

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, SyncApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(SyncApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SyncApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl InteractionTransport for InteractionApi {
    async fn track(&self, interaction: &Interaction) -> Result<(), SyncApiError> {
        let response = self
            .client
            .post(format!("{}/interactions/track", self.api_url))
            .json(interaction)
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn sync_batch(&self, batch: &[Interaction]) -> Result<BatchSyncResponse, SyncApiError> {
        let response = self
            .client
            .post(format!("{}/interactions/sync", self.api_url))
            .json(&batch)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn status(&self) -> Result<ServerSyncStatus, SyncApiError> {
        let response = self
            .client
            .get(format!("{}/interactions/status", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }
}
