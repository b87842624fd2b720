// src/pipeline/frame_context.rs
//
// Everything the loop decided about one frame, handed to every sink so
// they all see the same detections, overlap and warning state.

use crate::detection::state_machine::WarningUpdate;
use crate::detection::{DetectionResult, OverlapMeasurement};
use crate::types::Frame;

#[derive(Debug, Clone, Copy)]
pub struct FrameReport<'a> {
    pub frame: &'a Frame,
    pub detections: &'a DetectionResult,
    pub overlap: OverlapMeasurement,
    pub qualifying: bool,
    pub warning_active: bool,
    pub update: WarningUpdate,
    pub incident_id: Option<&'a str>,
    /// Wall-clock seconds at which the frame was evaluated.
    pub now: f64,
}

impl FrameReport<'_> {
    pub fn person_detected(&self) -> bool {
        !self.detections.persons.is_empty()
    }
}
