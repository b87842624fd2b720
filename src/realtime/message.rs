// src/realtime/message.rs
//
// Events pushed to live observers, serialized as JSON objects tagged by
// `type`.

use crate::pipeline::SessionStatistics;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameDetections {
    pub person_detected: bool,
    pub overlap_ratio: f32,
    pub warning_active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RealtimeMessage {
    Frame {
        frame_id: u64,
        timestamp: f64,
        /// JPEG data URL; None when encoding failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        detections: FrameDetections,
    },
    Alert {
        severity: String,
        message: String,
        incident_id: String,
        overlap_ratio: f32,
        camera_id: String,
        timestamp: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    Status {
        status: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        statistics: Option<SessionStatistics>,
    },
    Error {
        error: String,
        details: Option<String>,
    },
}

impl RealtimeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Frame { .. } => "frame",
            Self::Alert { .. } => "alert",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
        }
    }

    pub fn status(status: &str, message: impl Into<String>) -> Self {
        Self::Status {
            status: status.to_string(),
            message: message.into(),
            statistics: None,
        }
    }

    pub fn error(error: impl Into<String>, details: Option<String>) -> Self {
        Self::Error {
            error: error.into(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_messages_are_tagged_by_type() {
        let frame = RealtimeMessage::Frame {
            frame_id: 3,
            timestamp: 12.5,
            image: None,
            detections: FrameDetections {
                person_detected: true,
                overlap_ratio: 0.5,
                warning_active: false,
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "frame",
                "frame_id": 3,
                "timestamp": 12.5,
                "detections": {
                    "person_detected": true,
                    "overlap_ratio": 0.5,
                    "warning_active": false
                }
            })
        );

        let error = RealtimeMessage::error("Detection failed", None);
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({ "type": "error", "error": "Detection failed", "details": null })
        );
    }

    #[test]
    fn test_status_omits_missing_statistics() {
        let value = serde_json::to_value(RealtimeMessage::status("running", "started")).unwrap();
        assert_eq!(value["type"], "status");
        assert!(value.get("statistics").is_none());
    }
}
