// src/session/mod.rs

pub mod camera;
#[cfg(feature = "video")]
pub mod capture;
pub mod orchestrator;
pub mod source;

pub use camera::{CameraPreviewRegistry, PreviewHandle};
#[cfg(feature = "video")]
pub use capture::VideoCaptureSource;
pub use orchestrator::{SessionOrchestrator, SessionServices, SessionSnapshot, SessionStatus};
pub use source::{DefaultSourceOpener, FrameRead, FrameSource, ImageSequenceSource, SourceOpener, VideoSource};
