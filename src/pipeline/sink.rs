// src/pipeline/sink.rs
//
// Per-frame consumers plugged into the frame loop. A failing sink is
// logged by the loop and never stops processing.

use super::frame_context::FrameReport;
use super::metrics::{FpsMeter, SessionMetrics};
use crate::clock::Clock;
use crate::realtime::{FrameDetections, RealtimeBroadcaster};
use crate::types::Frame;

use anyhow::{Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use std::sync::Arc;
use tracing::{debug, info};

pub trait FrameSink: Send {
    fn on_frame(&mut self, report: &FrameReport<'_>) -> Result<()>;
}

// ============================================================================
// LIVE PREVIEW
// ============================================================================

/// Sends throttled frame previews to realtime observers. The throttle is
/// on wall-clock time, independent of the detection frame rate.
pub struct BroadcastSink {
    broadcaster: Arc<RealtimeBroadcaster>,
    clock: Arc<dyn Clock>,
    interval_secs: f64,
    max_width: u32,
    jpeg_quality: u8,
    last_sent: Option<f64>,
}

impl BroadcastSink {
    pub fn new(
        broadcaster: Arc<RealtimeBroadcaster>,
        clock: Arc<dyn Clock>,
        interval_secs: f64,
        max_width: u32,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            broadcaster,
            clock,
            interval_secs,
            max_width,
            jpeg_quality,
            last_sent: None,
        }
    }

    fn due(&self, now: f64) -> bool {
        self.last_sent
            .map_or(true, |last| now - last >= self.interval_secs)
    }
}

impl FrameSink for BroadcastSink {
    fn on_frame(&mut self, report: &FrameReport<'_>) -> Result<()> {
        let now = self.clock.now();
        if !self.due(now) {
            return Ok(());
        }
        self.last_sent = Some(now);
        if self.broadcaster.observer_count() == 0 {
            return Ok(());
        }

        let image = match encode_preview(report.frame, self.max_width, self.jpeg_quality) {
            Ok(url) => Some(url),
            Err(e) => {
                debug!("Preview encoding failed: {:#}", e);
                None
            }
        };
        self.broadcaster.send_frame(
            report.frame.index,
            report.frame.timestamp,
            image,
            FrameDetections {
                person_detected: report.person_detected(),
                overlap_ratio: report.overlap.ratio,
                warning_active: report.warning_active,
            },
        );
        Ok(())
    }
}

/// JPEG data URL of `frame`, downscaled to at most `max_width` pixels wide.
pub fn encode_preview(frame: &Frame, max_width: u32, quality: u8) -> Result<String> {
    let mut image = frame
        .to_image()
        .context("frame buffer does not match its dimensions")?;
    if max_width > 0 && image.width() > max_width {
        let height = (image.height() as f64 * max_width as f64 / image.width() as f64)
            .round()
            .max(1.0) as u32;
        image = imageops::resize(&image, max_width, height, FilterType::Triangle);
    }

    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    image
        .write_with_encoder(encoder)
        .context("JPEG encoding failed")?;

    Ok(format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(buf)
    ))
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Keeps the session's fps current and logs progress periodically. The
/// session clock starts when the sink is built.
pub struct StatsSink {
    metrics: Arc<SessionMetrics>,
    clock: Arc<dyn Clock>,
    meter: FpsMeter,
    log_every: u64,
}

impl StatsSink {
    pub fn new(metrics: Arc<SessionMetrics>, clock: Arc<dyn Clock>, interval_secs: f64) -> Self {
        let meter = FpsMeter::new(interval_secs, clock.now());
        Self {
            metrics,
            clock,
            meter,
            log_every: 300,
        }
    }
}

impl FrameSink for StatsSink {
    fn on_frame(&mut self, report: &FrameReport<'_>) -> Result<()> {
        let frames = self.metrics.frames();
        if let Some(fps) = self.meter.tick(self.clock.now(), frames) {
            self.metrics.set_fps(fps);
        }

        if self.log_every > 0 && frames % self.log_every == 0 {
            info!(
                "📊 Frame {} | {:.1} fps | overlap {:.2} | warning {}",
                report.frame.index,
                self.metrics.fps(),
                report.overlap.ratio,
                if report.warning_active { "ACTIVE" } else { "idle" }
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::detection::state_machine::WarningUpdate;
    use crate::detection::{DetectionResult, OverlapMeasurement};
    use crate::realtime::ChannelObserver;

    fn report<'a>(frame: &'a Frame, detections: &'a DetectionResult) -> FrameReport<'a> {
        FrameReport {
            frame,
            detections,
            overlap: OverlapMeasurement::none(),
            qualifying: false,
            warning_active: false,
            update: WarningUpdate::default(),
            incident_id: None,
            now: 0.0,
        }
    }

    #[test]
    fn test_preview_is_throttled_by_wall_clock() {
        let broadcaster = Arc::new(RealtimeBroadcaster::new());
        let (observer, rx) = ChannelObserver::new(64);
        broadcaster.subscribe(Arc::new(observer));
        let clock = Arc::new(ManualClock::new(0.0));
        let mut sink = BroadcastSink::new(broadcaster, clock.clone(), 0.2, 640, 70);

        let frame = Frame::new(0, 0.0, 4, 4, vec![128u8; 48]);
        let detections = DetectionResult::empty(4, 4);
        // 30 fps for one second
        for _ in 0..30 {
            sink.on_frame(&report(&frame, &detections)).unwrap();
            clock.advance(1.0 / 30.0);
        }

        assert_eq!(rx.len(), 5);
        let first: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["type"], "frame");
        assert!(first["image"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
        assert_eq!(first["detections"]["person_detected"], false);
    }

    #[test]
    fn test_preview_downscales_wide_frames() {
        let frame = Frame::new(0, 0.0, 1280, 720, vec![0u8; 1280 * 720 * 3]);
        let url = encode_preview(&frame, 640, 70).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(url.trim_start_matches("data:image/jpeg;base64,"))
            .unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
    }

    #[test]
    fn test_stats_sink_updates_fps() {
        let metrics = Arc::new(SessionMetrics::new());
        let clock = Arc::new(ManualClock::new(10.0));
        let mut sink = StatsSink::new(metrics.clone(), clock.clone(), 1.0);
        let frame = Frame::new(0, 0.0, 2, 2, vec![0u8; 12]);
        let detections = DetectionResult::empty(2, 2);

        for _ in 0..20 {
            clock.advance(0.1);
            metrics.inc(&metrics.total_frames);
            sink.on_frame(&report(&frame, &detections)).unwrap();
        }
        assert!((metrics.fps() - 10.0).abs() < 0.5, "fps {}", metrics.fps());
    }

    #[test]
    fn test_stats_sink_fps_averages_from_session_start() {
        let metrics = Arc::new(SessionMetrics::new());
        let clock = Arc::new(ManualClock::new(10.0));
        let mut sink = StatsSink::new(metrics.clone(), clock.clone(), 1.0);
        let frame = Frame::new(0, 0.0, 2, 2, vec![0u8; 12]);
        let detections = DetectionResult::empty(2, 2);

        for _ in 0..10 {
            clock.advance(0.1);
            metrics.inc(&metrics.total_frames);
            sink.on_frame(&report(&frame, &detections)).unwrap();
        }
        // one slow frame: 11 frames over 2.5s overall
        clock.advance(1.5);
        metrics.inc(&metrics.total_frames);
        sink.on_frame(&report(&frame, &detections)).unwrap();
        assert!((metrics.fps() - 4.4).abs() < 0.01, "fps {}", metrics.fps());
    }
}
