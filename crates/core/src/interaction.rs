//! Interaction telemetry records.
//!
//! An [`Interaction`] describes one user or system action (a submission, a
//! playback event, an error report). Interactions are immutable once
//! created; they are never edited, only superseded by newer records.

use serde::{Deserialize, Serialize};

use crate::job::EntityType;
use crate::types::Timestamp;

/// Interaction kinds that take the low-latency immediate delivery path
/// instead of waiting for the next batch cycle.
pub const LATENCY_SENSITIVE_KINDS: &[&str] = &["error", "job_submitted", "job_completed"];

/// Delivery/processing status recorded on an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionStatus {
    Success,
    Error,
    Pending,
}

/// One telemetry record, queued for best-effort durable delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub timestamp: Timestamp,
    pub session_id: String,
    /// Free-form kind, e.g. `"scene_play"`, `"job_submitted"`, `"error"`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub status: InteractionStatus,
    /// Open map of kind-specific fields.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Interaction {
    /// Create a new record stamped with a fresh UUID and the current time.
    pub fn new(session_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            session_id: session_id.into(),
            kind: kind.into(),
            entity_type: None,
            entity_id: None,
            status: InteractionStatus::Pending,
            metadata: serde_json::Map::new(),
        }
    }

    /// Attach the entity the interaction refers to.
    pub fn with_entity(mut self, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type);
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Set the recorded status.
    pub fn with_status(mut self, status: InteractionStatus) -> Self {
        self.status = status;
        self
    }

    /// Merge a metadata field into the open map.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether this interaction should attempt immediate delivery.
    pub fn is_latency_sensitive(&self) -> bool {
        LATENCY_SENSITIVE_KINDS.contains(&self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_entity_and_metadata() {
        let interaction = Interaction::new("session-1", "scene_play")
            .with_entity(EntityType::Scene, "42")
            .with_status(InteractionStatus::Success)
            .with_metadata("duration", serde_json::json!(12.5));

        assert_eq!(interaction.kind, "scene_play");
        assert_eq!(interaction.entity_type, Some(EntityType::Scene));
        assert_eq!(interaction.entity_id.as_deref(), Some("42"));
        assert_eq!(interaction.status, InteractionStatus::Success);
        assert_eq!(interaction.metadata["duration"], 12.5);
    }

    #[test]
    fn latency_sensitive_kinds_take_immediate_path() {
        assert!(Interaction::new("s", "error").is_latency_sensitive());
        assert!(Interaction::new("s", "job_submitted").is_latency_sensitive());
        assert!(!Interaction::new("s", "scene_play").is_latency_sensitive());
    }

    #[test]
    fn kind_serializes_under_the_type_key() {
        let interaction = Interaction::new("s", "scene_play");
        let value = serde_json::to_value(&interaction).unwrap();
        assert_eq!(value["type"], "scene_play");
        assert!(value.get("kind").is_none());
    }
}
