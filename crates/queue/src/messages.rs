//! Queue channel wire messages and parser.
//!
//! The server sends JSON messages over the push channel with a top-level
//! `"type"` discriminator. This module deserializes them into a
//! strongly-typed [`ServerMessage`] enum and serializes the small set of
//! outbound frames.

use serde::{Deserialize, Serialize};

use lightbox_core::job::QueueSnapshot;
use lightbox_core::types::JobId;

/// Plain liveness token sent every ping interval while the channel is open.
pub const OUTBOUND_PING: &str = "ping";

/// Plain request for a full status snapshot, sent immediately on open.
pub const OUTBOUND_GET_STATUS: &str = "get_status";

/// All known inbound message types on the queue channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full queue state. Always replaces the previous snapshot wholesale.
    QueueStatus { queue_status: QueueSnapshot },

    /// Incremental per-job lifecycle event.
    QueueUpdate {
        event: QueueUpdateEvent,
        job_id: JobId,
        /// Event-specific payload; shape depends on `event`.
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Reply to an outbound [`ClientMessage::CancelJob`].
    CancelResponse {
        job_id: JobId,
        success: bool,
        #[serde(default)]
        message: Option<String>,
    },
}

/// The `event` field of a `queue_update` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueUpdateEvent {
    JobSubmitted,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

/// Structured outbound messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CancelJob { job_id: JobId },
}

/// Payload of a `job_progress` event's `data` field.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressPayload {
    #[serde(default)]
    pub current: Option<u32>,
    #[serde(default)]
    pub total: Option<u32>,
    /// Authoritative when supplied; never recomputed from current/total.
    #[serde(default)]
    pub percentage: Option<f32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub evaluation_results: Option<serde_json::Value>,
}

/// Payload of a `job_failed` event's `data` field.
#[derive(Debug, Clone, Deserialize)]
pub struct FailurePayload {
    #[serde(default)]
    pub error: Option<String>,
}

/// Parse an inbound text frame into a typed message.
///
/// Returns `Err` for malformed JSON or unknown `type` values. Callers log
/// and drop these; a malformed frame never closes the channel.
pub fn parse_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_queue_status_message() {
        let json = r#"{
            "type": "queue_status",
            "queue_status": {
                "active_jobs": [],
                "total_active_tests": 4,
                "completed_tests": 2,
                "failed_tests": 1,
                "recent_completed_jobs": []
            }
        }"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ServerMessage::QueueStatus { queue_status } => {
                assert_eq!(queue_status.total_active_tests, 4);
                assert_eq!(queue_status.failed_tests, 1);
            }
            other => panic!("Expected QueueStatus, got {other:?}"),
        }
    }

    #[test]
    fn parse_queue_update_progress() {
        let json = r#"{
            "type": "queue_update",
            "event": "job_progress",
            "job_id": "job-7",
            "data": {"current": 3, "total": 10, "percentage": 30.0, "message": "tagging"}
        }"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ServerMessage::QueueUpdate {
                event,
                job_id,
                data,
            } => {
                assert_eq!(event, QueueUpdateEvent::JobProgress);
                assert_eq!(job_id, "job-7");
                let payload: ProgressPayload = serde_json::from_value(data).unwrap();
                assert_eq!(payload.percentage, Some(30.0));
                assert_eq!(payload.message.as_deref(), Some("tagging"));
            }
            other => panic!("Expected QueueUpdate, got {other:?}"),
        }
    }

    #[test]
    fn parse_queue_update_without_data() {
        let json = r#"{"type":"queue_update","event":"job_started","job_id":"job-1"}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ServerMessage::QueueUpdate { event, data, .. } => {
                assert_eq!(event, QueueUpdateEvent::JobStarted);
                assert!(data.is_null());
            }
            other => panic!("Expected QueueUpdate, got {other:?}"),
        }
    }

    #[test]
    fn parse_cancel_response() {
        let json = r#"{"type":"cancel_response","job_id":"job-2","success":false,"message":"already finished"}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ServerMessage::CancelResponse {
                job_id,
                success,
                message,
            } => {
                assert_eq!(job_id, "job-2");
                assert!(!success);
                assert_eq!(message.as_deref(), Some("already finished"));
            }
            other => panic!("Expected CancelResponse, got {other:?}"),
        }
    }

    #[test]
    fn serialize_cancel_job() {
        let msg = ClientMessage::CancelJob {
            job_id: "job-9".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "cancel_job");
        assert_eq!(json["job_id"], "job-9");
    }

    #[test]
    fn parse_unknown_type_returns_error() {
        assert!(parse_message(r#"{"type":"mystery","data":{}}"#).is_err());
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_message("not json at all").is_err());
    }
}
