// src/pipeline/frame_loop.rs
//
// The per-session frame loop: read -> detect -> evaluate -> warning state
// -> incident/enrichment -> sinks. Runs on its own thread and checks the
// cancellation flag once per iteration.

use super::frame_context::FrameReport;
use super::metrics::SessionMetrics;
use super::sink::FrameSink;
use crate::clock::Clock;
use crate::detection::{
    DetectionResult, Detector, OverlapEvaluator, OverlapMeasurement, WarningStateMachine, WarningUpdate,
};
use crate::incident::IncidentLifecycle;
use crate::session::source::{FrameRead, FrameSource};
use crate::types::Frame;

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const LIVE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    EndOfStream,
    Cancelled,
}

pub struct FramePipeline {
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    evaluator: OverlapEvaluator,
    warning: WarningStateMachine,
    lifecycle: IncidentLifecycle,
    sinks: Vec<Box<dyn FrameSink>>,
    metrics: Arc<SessionMetrics>,
    clock: Arc<dyn Clock>,
    cancel: Arc<AtomicBool>,
    retry_delay: Duration,
}

impl FramePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        evaluator: OverlapEvaluator,
        warning: WarningStateMachine,
        lifecycle: IncidentLifecycle,
        metrics: Arc<SessionMetrics>,
        clock: Arc<dyn Clock>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            detector,
            evaluator,
            warning,
            lifecycle,
            sinks: Vec::new(),
            metrics,
            clock,
            cancel,
            retry_delay: LIVE_RETRY_DELAY,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Process frames until the source ends or cancellation is observed.
    /// A detector error aborts the loop.
    pub fn run(mut self) -> Result<PipelineExit> {
        info!("🎬 Frame processing started");
        let exit = loop {
            if self.cancel.load(Ordering::SeqCst) {
                break PipelineExit::Cancelled;
            }
            match self.source.next_frame() {
                FrameRead::Frame(frame) => self.process(frame)?,
                FrameRead::EndOfStream => break PipelineExit::EndOfStream,
                FrameRead::TransientError(reason) if self.source.is_live() => {
                    debug!("Frame read failed, retrying: {}", reason);
                    thread::sleep(self.retry_delay);
                }
                FrameRead::TransientError(reason) => {
                    warn!("Frame read failed on file source, ending stream: {}", reason);
                    break PipelineExit::EndOfStream;
                }
            }
        };

        info!(
            "🏁 Frame processing finished ({:?}): {} frames, {} incidents",
            exit,
            self.metrics.frames(),
            self.metrics.get(&self.metrics.incidents_created)
        );
        Ok(exit)
    }

    fn process(&mut self, frame: Frame) -> Result<()> {
        let now = self.clock.now();
        let detections = self
            .detector
            .detect(&frame)
            .with_context(|| format!("Detector failed on frame {}", frame.index))?;
        self.metrics.inc(&self.metrics.total_frames);

        let overlap = self.evaluator.evaluate(&detections);
        let qualifying = self.evaluator.is_qualifying(&overlap);

        // A frame arriving after the detection window has lapsed only closes
        // the stale episode. It is not attributed to it and does not open a
        // new one.
        if let Some(reason) = self.warning.expire_lapsed(now) {
            if qualifying {
                self.metrics.inc(&self.metrics.qualifying_frames);
            }
            self.lifecycle.reset_episode_tracking();
            let update = WarningUpdate {
                cleared: Some(reason),
                ..WarningUpdate::default()
            };
            self.report(&frame, &detections, overlap, qualifying, update, None, now);
            return Ok(());
        }

        // The incident belongs to the episode this frame opens or extends,
        // so it is settled before the state machine can close that episode.
        let warning_active = self.warning.is_active();
        let mut incident_id = None;
        if qualifying {
            self.metrics.inc(&self.metrics.qualifying_frames);
            incident_id = self
                .lifecycle
                .ensure_incident(&frame, overlap.bbox, overlap.ratio, now);
            self.lifecycle.maybe_dispatch_enrichment(
                &frame,
                overlap.bbox,
                overlap.ratio,
                now,
                incident_id.as_deref(),
                warning_active,
            );
        }

        let update = self.warning.observe(qualifying, overlap.ratio, now);
        if update.started {
            self.metrics.inc(&self.metrics.warning_episodes);
        }
        if update.cleared.is_some() {
            self.lifecycle.reset_episode_tracking();
        }

        self.report(&frame, &detections, overlap, qualifying, update, incident_id.as_deref(), now);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &mut self,
        frame: &Frame,
        detections: &DetectionResult,
        overlap: OverlapMeasurement,
        qualifying: bool,
        update: WarningUpdate,
        incident_id: Option<&str>,
        now: f64,
    ) {
        let report = FrameReport {
            frame,
            detections,
            overlap,
            qualifying,
            warning_active: self.warning.is_active(),
            update,
            incident_id,
            now,
        };
        for sink in &mut self.sinks {
            if let Err(e) = sink.on_frame(&report) {
                warn!("Frame sink failed on frame {}: {:#}", frame.index, e);
            }
        }
    }
}
