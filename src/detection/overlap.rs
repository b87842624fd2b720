// src/detection/overlap.rs
//
// Per-frame danger score: how much of each tracked person's silhouette
// sits inside the hazard (water) region.

use super::types::{DetectionResult, Mask, OverlapMeasurement};

pub const DEFAULT_DANGER_THRESHOLD: f32 = 0.90;

/// area(person ∩ hazard) / area(person), 0 for an empty person mask.
pub fn overlap_ratio(person: &Mask, hazard: &Mask) -> f32 {
    let person_area = person.area();
    if person_area == 0 {
        return 0.0;
    }
    person.intersection_area(hazard) as f32 / person_area as f32
}

#[derive(Debug, Clone, Copy)]
pub struct OverlapEvaluator {
    threshold: f32,
}

impl Default for OverlapEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_DANGER_THRESHOLD)
    }
}

impl OverlapEvaluator {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Maximum ratio over all persons. Ties keep the first one in
    /// detector order; persons with no overlap never claim the bbox.
    pub fn evaluate(&self, detections: &DetectionResult) -> OverlapMeasurement {
        let mut best = OverlapMeasurement::none();
        for person in &detections.persons {
            let ratio = overlap_ratio(&person.mask, &detections.hazard_mask);
            if ratio > best.ratio {
                best = OverlapMeasurement {
                    ratio,
                    bbox: Some(person.bbox),
                };
            }
        }
        best
    }

    pub fn is_qualifying(&self, measurement: &OverlapMeasurement) -> bool {
        measurement.bbox.is_some() && measurement.ratio > self.threshold
    }
}
