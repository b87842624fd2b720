// src/detection/types.rs

use crate::types::{BBox, Frame};
use anyhow::Result;

/// Binary pixel mask, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    width: usize,
    height: usize,
    data: Vec<bool>,
}

impl Mask {
    pub fn empty(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![false; width * height],
        }
    }

    pub fn from_data(width: usize, height: usize, data: Vec<bool>) -> Result<Self> {
        anyhow::ensure!(
            data.len() == width * height,
            "mask buffer has {} pixels, expected {}x{}",
            data.len(),
            width,
            height
        );
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Mask with the (clamped) rectangle filled in.
    pub fn from_bbox(width: usize, height: usize, bbox: &BBox) -> Self {
        let mut mask = Self::empty(width, height);
        if let Some(b) = bbox.clamp_to(width, height) {
            for y in b.y1..b.y2 {
                for x in b.x1..b.x2 {
                    mask.set(x as usize, y as usize, true);
                }
            }
        }
        mask
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Out-of-range coordinates read as unset.
    pub fn get(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height && self.data[y * self.width + x]
    }

    pub fn set(&mut self, x: usize, y: usize, value: bool) {
        if x < self.width && y < self.height {
            self.data[y * self.width + x] = value;
        }
    }

    pub fn area(&self) -> usize {
        self.data.iter().filter(|&&p| p).count()
    }

    /// Number of pixels set in both masks, indexed by this mask's extent.
    pub fn intersection_area(&self, other: &Mask) -> usize {
        let mut count = 0;
        for y in 0..self.height {
            let row = &self.data[y * self.width..(y + 1) * self.width];
            for (x, &set) in row.iter().enumerate() {
                if set && other.get(x, y) {
                    count += 1;
                }
            }
        }
        count
    }
}

/// One tracked person as reported by the detector.
#[derive(Debug, Clone)]
pub struct PersonRegion {
    pub bbox: BBox,
    pub track_id: Option<u32>,
    pub mask: Mask,
}

/// Everything the detector reports for a single frame.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub persons: Vec<PersonRegion>,
    pub hazard_mask: Mask,
}

impl DetectionResult {
    pub fn empty(width: usize, height: usize) -> Self {
        Self {
            persons: Vec::new(),
            hazard_mask: Mask::empty(width, height),
        }
    }
}

/// Best person/hazard overlap found in a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapMeasurement {
    pub ratio: f32,
    pub bbox: Option<BBox>,
}

impl OverlapMeasurement {
    pub fn none() -> Self {
        Self {
            ratio: 0.0,
            bbox: None,
        }
    }
}

/// Segmentation/tracking backend. Errors abort the session.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult>;
}

/// Builds one detector per session, so tracker state never leaks
/// between sessions.
pub trait DetectorFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Detector>>;
}

impl<F> DetectorFactory for F
where
    F: Fn() -> Result<Box<dyn Detector>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Detector>> {
        self()
    }
}
