//! Per-job progress records.
//!
//! A [`ProgressRecord`] tracks step-level progress for one job. The server's
//! `percentage` is authoritative when supplied and is never recomputed from
//! `current`/`total` on the client, even if the two disagree.

use serde::{Deserialize, Serialize};

/// Messages written into a record when its job reaches a terminal state.
///
/// Records carrying one of these markers are stale leftovers from a previous
/// session and are dropped when the store is loaded.
pub const TERMINAL_MESSAGES: &[&str] = &["Completed", "Failed", "Cancelled", "Timed out"];

/// Progress state for a single job, keyed by `job_id` in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Steps finished so far, when the server reports step counts.
    #[serde(default)]
    pub current: Option<u32>,
    /// Total steps, when the server reports step counts.
    #[serde(default)]
    pub total: Option<u32>,
    /// Completion percentage (0-100), authoritative when server-supplied.
    #[serde(default)]
    pub percentage: f32,
    /// Human-readable status line.
    #[serde(default)]
    pub message: String,
    /// Per-test evaluation summary attached near completion.
    #[serde(default)]
    pub evaluation_results: Option<serde_json::Value>,
}

impl ProgressRecord {
    /// Whether the record's message marks a terminal state.
    pub fn has_terminal_message(&self) -> bool {
        TERMINAL_MESSAGES
            .iter()
            .any(|marker| self.message.starts_with(marker))
    }

    /// Whether the record's values are internally consistent.
    ///
    /// Inconsistent records come from interrupted writes in old sessions:
    /// `current > total`, a percentage outside 0-100, or the known-bad
    /// sentinel of a 100% record with zero steps on both sides.
    pub fn is_consistent(&self) -> bool {
        if let (Some(current), Some(total)) = (self.current, self.total) {
            if current > total {
                return false;
            }
            // Known-bad sentinel left behind by crashed sessions.
            if current == 0 && total == 0 && self.percentage >= 100.0 {
                return false;
            }
        }
        (0.0..=100.0).contains(&self.percentage)
    }

    /// Replace the message with a terminal marker, optionally with detail.
    pub fn set_terminal(&mut self, marker: &str, detail: Option<&str>) {
        self.message = match detail {
            Some(detail) => format!("{marker}: {detail}"),
            None => marker.to_string(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_consistent() {
        let record = ProgressRecord {
            current: Some(3),
            total: Some(10),
            percentage: 30.0,
            message: "Running face detection".into(),
            evaluation_results: None,
        };
        assert!(record.is_consistent());
        assert!(!record.has_terminal_message());
    }

    #[test]
    fn current_beyond_total_is_inconsistent() {
        let record = ProgressRecord {
            current: Some(11),
            total: Some(10),
            ..Default::default()
        };
        assert!(!record.is_consistent());
    }

    #[test]
    fn zero_step_full_percentage_sentinel_is_inconsistent() {
        let record = ProgressRecord {
            current: Some(0),
            total: Some(0),
            percentage: 100.0,
            ..Default::default()
        };
        assert!(!record.is_consistent());
    }

    #[test]
    fn percentage_out_of_range_is_inconsistent() {
        let record = ProgressRecord {
            percentage: 120.0,
            ..Default::default()
        };
        assert!(!record.is_consistent());
    }

    #[test]
    fn terminal_message_detection() {
        let mut record = ProgressRecord::default();
        record.set_terminal("Completed", None);
        assert!(record.has_terminal_message());

        let mut failed = ProgressRecord::default();
        failed.set_terminal("Failed", Some("out of memory"));
        assert_eq!(failed.message, "Failed: out of memory");
        assert!(failed.has_terminal_message());
    }
}
