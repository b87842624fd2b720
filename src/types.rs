// src/types.rs
//
// Frame and geometry primitives shared by the pipeline, the incident
// lifecycle and the enrichment worker.

use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};

/// One decoded frame. `data` is tightly packed RGB8, row-major.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    /// Capture time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(index: u64, timestamp: f64, width: usize, height: usize, data: Vec<u8>) -> Self {
        Self {
            index,
            timestamp,
            width,
            height,
            data,
        }
    }

    pub fn from_image(index: u64, timestamp: f64, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            index,
            timestamp,
            width: width as usize,
            height: height as usize,
            data: image.into_raw(),
        }
    }

    /// View the buffer as an `RgbImage`. None when the buffer does not
    /// match the declared dimensions.
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width as u32, self.height as u32, self.data.clone())
    }

    /// Copy out the pixels inside `bbox`. The box must already be clamped.
    pub fn crop(&self, bbox: &BBox) -> Option<RgbImage> {
        if bbox.is_empty() {
            return None;
        }
        let image = self.to_image()?;
        let view = imageops::crop_imm(
            &image,
            bbox.x1 as u32,
            bbox.y1 as u32,
            bbox.width() as u32,
            bbox.height() as u32,
        );
        Some(view.to_image())
    }
}

/// Axis-aligned box in pixel coordinates, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2.saturating_sub(self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        self.y2.saturating_sub(self.y1).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Clamp into a `width` x `height` frame. Returns None when nothing of
    /// the box is left inside the frame.
    pub fn clamp_to(&self, width: usize, height: usize) -> Option<BBox> {
        let (w, h) = (width as i32, height as i32);
        if w == 0 || h == 0 {
            return None;
        }
        let clamped = BBox {
            x1: self.x1.clamp(0, w - 1),
            y1: self.y1.clamp(0, h - 1),
            x2: self.x2.clamp(0, w),
            y2: self.y2.clamp(0, h),
        };
        if clamped.x2 <= clamped.x1 || clamped.y2 <= clamped.y1 {
            return None;
        }
        Some(clamped)
    }
}

impl std::fmt::Display for BBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}
