// src/pipeline/mod.rs

pub mod frame_context;
pub mod frame_loop;
pub mod metrics;
pub mod sink;

pub use frame_context::FrameReport;
pub use frame_loop::{FramePipeline, PipelineExit};
pub use metrics::{FpsMeter, SessionMetrics, SessionStatistics};
pub use sink::{BroadcastSink, FrameSink, StatsSink};
