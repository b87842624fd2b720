// src/realtime/mod.rs

pub mod broadcaster;
pub mod message;

pub use broadcaster::{ChannelObserver, Observer, ObserverId, RealtimeBroadcaster};
pub use message::{FrameDetections, RealtimeMessage};
