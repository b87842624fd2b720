// src/session/source.rs
//
// Frame sources. Frame directories and single images are read here, which
// is also what the replay tooling produces. Video files and cameras go
// through the OpenCV capture when the `video` feature is enabled.

#[cfg(feature = "video")]
use super::capture::VideoCaptureSource;
use crate::clock::Clock;
use crate::error::SessionError;
use crate::types::Frame;

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

pub enum FrameRead {
    Frame(Frame),
    EndOfStream,
    /// Worth retrying on a live source.
    TransientError(String),
}

pub trait FrameSource: Send {
    fn next_frame(&mut self) -> FrameRead;

    /// Live sources retry transient errors instead of ending.
    fn is_live(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    File(PathBuf),
    Webcam(u32),
}

impl VideoSource {
    /// `source` is a path, or a camera index when `is_webcam` is set.
    pub fn parse(source: &str, is_webcam: bool) -> Result<Self> {
        if is_webcam {
            let index = source
                .trim()
                .parse()
                .with_context(|| format!("Invalid camera index: {}", source))?;
            Ok(Self::Webcam(index))
        } else {
            Ok(Self::File(PathBuf::from(source)))
        }
    }

    pub fn is_webcam(&self) -> bool {
        matches!(self, Self::Webcam(_))
    }

    pub fn camera_index(&self) -> Option<u32> {
        match self {
            Self::Webcam(index) => Some(*index),
            Self::File(_) => None,
        }
    }

    /// Identifier recorded on incidents: file name or `webcam_<n>`.
    pub fn camera_id(&self) -> String {
        match self {
            Self::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Webcam(index) => format!("webcam_{}", index),
        }
    }
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Webcam(index) => write!(f, "camera {}", index),
        }
    }
}

/// Opens sources for the orchestrator. Called before a session is
/// committed, so failures surface as start errors.
pub trait SourceOpener: Send + Sync {
    fn open(&self, source: &VideoSource) -> Result<Box<dyn FrameSource>, SessionError>;
}

// ============================================================================
// FRAME DIRECTORY
// ============================================================================

/// Reads a sorted sequence of still images, one frame each. A single image
/// file is a one-frame sequence. Undecodable files are skipped.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
    index: u64,
    clock: Arc<dyn Clock>,
}

impl ImageSequenceSource {
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let paths = find_image_files(path)?;
        anyhow::ensure!(!paths.is_empty(), "no image frames under {}", path.display());
        info!("Found {} frames in {}", paths.len(), path.display());
        Ok(Self {
            paths,
            next: 0,
            index: 0,
            clock,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> FrameRead {
        while let Some(path) = self.paths.get(self.next) {
            self.next += 1;
            match image::open(path) {
                Ok(img) => {
                    let frame = Frame::from_image(self.index, self.clock.now(), img.to_rgb8());
                    self.index += 1;
                    return FrameRead::Frame(frame);
                }
                Err(e) => warn!("Skipping unreadable frame {}: {}", path.display(), e),
            }
        }
        FrameRead::EndOfStream
    }

    fn is_live(&self) -> bool {
        false
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn find_image_files(root: &Path) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        anyhow::ensure!(
            is_image(root),
            "{} is not a frame image (supported: {})",
            root.display(),
            IMAGE_EXTENSIONS.join(", ")
        );
        return Ok(vec![root.to_path_buf()]);
    }

    let mut frames: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    frames.sort();
    Ok(frames)
}

/// Directories and image files become frame-directory readers. Other
/// files and webcams need the `video` feature and are unavailable without it.
pub struct DefaultSourceOpener {
    clock: Arc<dyn Clock>,
}

impl DefaultSourceOpener {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, source: &VideoSource) -> Result<Box<dyn FrameSource>, SessionError> {
        match source {
            VideoSource::File(path) if !path.exists() => Err(SessionError::SourceNotFound(path.clone())),
            VideoSource::File(path) if is_frame_sequence(path) => {
                let reader = ImageSequenceSource::open(path, Arc::clone(&self.clock))
                    .map_err(|e| unavailable(source, e))?;
                Ok(Box::new(reader))
            }
            _ => self.open_capture(source),
        }
    }
}

impl DefaultSourceOpener {
    #[cfg(feature = "video")]
    fn open_capture(&self, source: &VideoSource) -> Result<Box<dyn FrameSource>, SessionError> {
        let clock = Arc::clone(&self.clock);
        let opened = match source {
            VideoSource::File(path) => VideoCaptureSource::open_file(path, clock),
            VideoSource::Webcam(index) => VideoCaptureSource::open_camera(*index, clock),
        };
        match opened {
            Ok(capture) => Ok(Box::new(capture)),
            Err(e) => Err(unavailable(source, e)),
        }
    }

    #[cfg(not(feature = "video"))]
    fn open_capture(&self, source: &VideoSource) -> Result<Box<dyn FrameSource>, SessionError> {
        Err(SessionError::SourceUnavailable {
            target: source.to_string(),
            reason: "video files and cameras need a build with the `video` feature".to_string(),
        })
    }
}

/// Directories and still images are read frame by frame without a decoder.
pub fn is_frame_sequence(path: &Path) -> bool {
    path.is_dir() || is_image(path)
}

fn unavailable(source: &VideoSource, e: anyhow::Error) -> SessionError {
    SessionError::SourceUnavailable {
        target: source.to_string(),
        reason: format!("{:#}", e),
    }
}
