// src/incident/record.rs

use crate::types::BBox;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    EnrichmentPending,
    EnrichmentCompleted,
    EnrichmentFailed,
    EnrichmentSkipped,
    Notified,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnrichmentPending => "enrichment_pending",
            Self::EnrichmentCompleted => "enrichment_completed",
            Self::EnrichmentFailed => "enrichment_failed",
            Self::EnrichmentSkipped => "enrichment_skipped",
            Self::Notified => "notified",
        }
    }

    pub fn is_enrichment_terminal(&self) -> bool {
        matches!(
            self,
            Self::EnrichmentCompleted | Self::EnrichmentFailed | Self::EnrichmentSkipped
        )
    }

    /// Pending moves to exactly one enrichment outcome; an outcome may
    /// move on to `Notified`. Nothing ever returns to pending.
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        match (self, next) {
            (Self::EnrichmentPending, n) => n.is_enrichment_terminal(),
            (s, Self::Notified) => s.is_enrichment_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub incident_id: String,
    pub camera_id: String,
    pub frame_id: u64,
    pub timestamp: f64,
    pub overlap_ratio: f32,
    pub bbox: BBox,
    /// Empty when the screenshot could not be written.
    pub screenshot_path: String,
    pub status: IncidentStatus,
    pub summary: Option<String>,
    pub confidence: Option<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use IncidentStatus::*;

    #[test]
    fn test_pending_moves_to_any_outcome() {
        for next in [EnrichmentCompleted, EnrichmentFailed, EnrichmentSkipped] {
            assert!(EnrichmentPending.can_transition_to(next));
        }
        assert!(!EnrichmentPending.can_transition_to(Notified));
        assert!(!EnrichmentPending.can_transition_to(EnrichmentPending));
    }

    #[test]
    fn test_never_back_to_pending() {
        for from in [EnrichmentCompleted, EnrichmentFailed, EnrichmentSkipped, Notified] {
            assert!(!from.can_transition_to(EnrichmentPending));
        }
    }

    #[test]
    fn test_notified_follows_outcomes_only() {
        assert!(EnrichmentCompleted.can_transition_to(Notified));
        assert!(EnrichmentFailed.can_transition_to(Notified));
        assert!(EnrichmentSkipped.can_transition_to(Notified));
        assert!(!Notified.can_transition_to(Notified));
        assert!(!EnrichmentCompleted.can_transition_to(EnrichmentFailed));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&EnrichmentSkipped).unwrap();
        assert_eq!(json, "\"enrichment_skipped\"");
    }
}
