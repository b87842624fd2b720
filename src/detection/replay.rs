// src/detection/replay.rs
//
// Detector that replays pre-computed annotations from a JSONL file, one
// line per frame:
//
//   {"frame": 12, "persons": [{"bbox": [x1, y1, x2, y2], "track_id": 3}],
//    "hazards": [[[x, y], [x, y], [x, y], ...]]}
//
// Person silhouettes are the filled boxes; hazard polygons are rasterized
// into the frame-sized hazard mask. Frames without a line detect nothing.

use super::types::{DetectionResult, Detector, Mask, PersonRegion};
use crate::types::{BBox, Frame};
use anyhow::{Context, Result};
use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
struct PersonAnnotation {
    bbox: [i32; 4],
    #[serde(default)]
    track_id: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct FrameAnnotation {
    frame: u64,
    #[serde(default)]
    persons: Vec<PersonAnnotation>,
    #[serde(default)]
    hazards: Vec<Vec<[i32; 2]>>,
}

pub struct ReplayDetector {
    annotations: HashMap<u64, FrameAnnotation>,
}

impl ReplayDetector {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read detections file {}", path.display()))?;
        let detector = Self::parse(&contents)?;
        info!(
            "Loaded replay detections for {} frames from {}",
            detector.annotations.len(),
            path.display()
        );
        Ok(detector)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut annotations = HashMap::new();
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let annotation: FrameAnnotation = serde_json::from_str(line)
                .with_context(|| format!("Invalid detection record on line {}", line_no + 1))?;
            annotations.insert(annotation.frame, annotation);
        }
        Ok(Self { annotations })
    }
}

impl Detector for ReplayDetector {
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let Some(annotation) = self.annotations.get(&frame.index) else {
            return Ok(DetectionResult::empty(frame.width, frame.height));
        };

        let persons = annotation
            .persons
            .iter()
            .map(|p| {
                let bbox = BBox::new(p.bbox[0], p.bbox[1], p.bbox[2], p.bbox[3]);
                PersonRegion {
                    bbox,
                    track_id: p.track_id,
                    mask: Mask::from_bbox(frame.width, frame.height, &bbox),
                }
            })
            .collect();

        let hazard_mask = rasterize_polygons(&annotation.hazards, frame.width, frame.height)?;
        debug!(
            "Replay frame {}: {} person(s), {} hazard polygon(s)",
            frame.index,
            annotation.persons.len(),
            annotation.hazards.len()
        );

        Ok(DetectionResult {
            persons,
            hazard_mask,
        })
    }
}

fn rasterize_polygons(polygons: &[Vec<[i32; 2]>], width: usize, height: usize) -> Result<Mask> {
    let mut canvas = GrayImage::new(width as u32, height as u32);
    for polygon in polygons {
        let mut points: Vec<Point<i32>> = polygon.iter().map(|p| Point::new(p[0], p[1])).collect();
        // drawing rejects explicitly closed polygons
        if points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        if points.len() < 3 {
            continue;
        }
        draw_polygon_mut(&mut canvas, &points, Luma([255u8]));
    }
    let data = canvas.pixels().map(|p| p.0[0] > 0).collect();
    Mask::from_data(width, height, data)
}
