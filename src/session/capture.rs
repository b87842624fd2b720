// src/session/capture.rs
//
// OpenCV capture for video files and cameras, built with the `video`
// feature. Frames arrive as BGR and are converted to RGB before they
// enter the pipeline.

use super::source::{FrameRead, FrameSource};
use crate::clock::Clock;
use crate::types::Frame;

use anyhow::{Context, Result};
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct VideoCaptureSource {
    cap: VideoCapture,
    live: bool,
    next_index: u64,
    clock: Arc<dyn Clock>,
}

impl VideoCaptureSource {
    pub fn open_file(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let name = path
            .to_str()
            .with_context(|| format!("Video path is not valid UTF-8: {}", path.display()))?;
        let cap = VideoCapture::from_file(name, videoio::CAP_ANY)
            .with_context(|| format!("Failed to open video {}", path.display()))?;
        Self::from_capture(cap, false, &path.display().to_string(), clock)
    }

    pub fn open_camera(index: u32, clock: Arc<dyn Clock>) -> Result<Self> {
        let cap = VideoCapture::new(index as i32, videoio::CAP_ANY)
            .with_context(|| format!("Failed to open camera {}", index))?;
        Self::from_capture(cap, true, &format!("camera {}", index), clock)
    }

    fn from_capture(cap: VideoCapture, live: bool, label: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        if !cap.is_opened()? {
            anyhow::bail!("Failed to open {}", label);
        }

        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
        if live {
            info!("📹 Camera {}: {}x{} @ {:.1} fps", label, width, height, fps);
        } else {
            let total_frames = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)? as i64;
            info!(
                "📹 Video {}: {}x{} @ {:.1} fps, {} frames",
                label, width, height, fps, total_frames
            );
        }

        Ok(Self {
            cap,
            live,
            next_index: 0,
            clock,
        })
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut mat = Mat::default();
        if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }

        let mut rgb = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
        let (width, height) = (rgb.cols() as usize, rgb.rows() as usize);
        let data = rgb.data_bytes()?.to_vec();

        let frame = Frame::new(self.next_index, self.clock.now(), width, height, data);
        self.next_index += 1;
        Ok(Some(frame))
    }
}

impl FrameSource for VideoCaptureSource {
    fn next_frame(&mut self) -> FrameRead {
        match self.read_frame() {
            Ok(Some(frame)) => FrameRead::Frame(frame),
            Ok(None) if self.live => FrameRead::TransientError("camera returned no frame".into()),
            Ok(None) => FrameRead::EndOfStream,
            Err(e) => FrameRead::TransientError(format!("{:#}", e)),
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_missing_video_fails_to_open() {
        let clock = Arc::new(ManualClock::new(0.0));
        let err = VideoCaptureSource::open_file(Path::new("/definitely/not/here.mp4"), clock)
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("here.mp4"));
    }
}
