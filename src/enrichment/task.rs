// src/enrichment/task.rs

use crate::error::EnrichmentError;
use crate::types::BBox;
use image::RgbImage;
use std::collections::BTreeMap;

/// One unit of work for the enrichment worker: the person crop of a
/// freshly created incident plus the context the prompt is built from.
#[derive(Debug, Clone)]
pub struct EnrichmentTask {
    pub incident_id: String,
    pub frame_id: u64,
    pub timestamp: f64,
    pub camera_id: String,
    pub overlap_ratio: f32,
    pub bbox: BBox,
    pub image: RgbImage,
    pub metadata: BTreeMap<String, String>,
}

impl EnrichmentTask {
    /// Metadata handed to the provider, with the camera id and the rounded
    /// overlap ratio merged in.
    pub fn request_metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = self.metadata.clone();
        metadata.insert("camera_id".to_string(), self.camera_id.clone());
        metadata.insert(
            "overlap_ratio".to_string(),
            format!("{}", (self.overlap_ratio as f64 * 1000.0).round() / 1000.0),
        );
        metadata
    }
}

/// Normalized provider answer.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentResponse {
    pub summary: String,
    /// Always within [0, 1].
    pub confidence: f32,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    pub incident_id: String,
    pub frame_id: u64,
    pub camera_id: String,
    pub outcome: Result<EnrichmentResponse, EnrichmentError>,
}

impl EnrichmentResult {
    pub fn from_task(task: &EnrichmentTask, outcome: Result<EnrichmentResponse, EnrichmentError>) -> Self {
        Self {
            incident_id: task.incident_id.clone(),
            frame_id: task.frame_id,
            camera_id: task.camera_id.clone(),
            outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_metadata_merges_context() {
        let mut metadata = BTreeMap::new();
        metadata.insert("is_webcam".to_string(), "false".to_string());
        let task = EnrichmentTask {
            incident_id: "abc".into(),
            frame_id: 7,
            timestamp: 1.0,
            camera_id: "pool.mp4".into(),
            overlap_ratio: 0.93456,
            bbox: BBox::new(0, 0, 2, 2),
            image: RgbImage::new(2, 2),
            metadata,
        };

        let merged = task.request_metadata();
        assert_eq!(merged["camera_id"], "pool.mp4");
        assert_eq!(merged["overlap_ratio"], "0.935");
        assert_eq!(merged["is_webcam"], "false");
    }
}
