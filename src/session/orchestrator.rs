// src/session/orchestrator.rs
//
// The single detection-session slot. `start` validates the source before
// committing, `stop` cancels cooperatively with a bounded wait, and
// `status` reads live or frozen numbers. The slot mutex is held only to
// read or swap the handle, never across I/O or joins.

use super::camera::CameraPreviewRegistry;
use super::source::{SourceOpener, VideoSource};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::detection::state_machine::Config as WarningConfig;
use crate::detection::{DetectorFactory, OverlapEvaluator, WarningStateMachine};
use crate::enrichment::{EnrichmentQueue, VisionAnalyzer};
use crate::error::SessionError;
use crate::incident::{IncidentLifecycle, IncidentManager};
use crate::pipeline::{
    BroadcastSink, FramePipeline, PipelineExit, SessionMetrics, SessionStatistics, StatsSink,
};
use crate::realtime::RealtimeBroadcaster;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopping,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Collaborators shared by every session, built once by the entry point.
#[derive(Clone)]
pub struct SessionServices {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub detectors: Arc<dyn DetectorFactory>,
    pub sources: Arc<dyn SourceOpener>,
    pub incidents: Arc<IncidentManager>,
    /// None disables enrichment.
    pub analyzer: Option<Arc<dyn VisionAnalyzer>>,
    pub broadcaster: Arc<RealtimeBroadcaster>,
    pub cameras: Arc<CameraPreviewRegistry>,
}

/// Session data read by status queries while the worker runs.
struct SessionShared {
    id: String,
    source: VideoSource,
    start_time: f64,
    status: AtomicU8,
    end_time_bits: AtomicU64,
    metrics: Arc<SessionMetrics>,
    statistics: Mutex<Option<SessionStatistics>>,
}

impl SessionShared {
    fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn transition(&self, from: SessionStatus, to: SessionStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn end_time(&self) -> Option<f64> {
        match self.end_time_bits.load(Ordering::SeqCst) {
            0 => None,
            bits => Some(f64::from_bits(bits)),
        }
    }
}

struct SessionHandle {
    shared: Arc<SessionShared>,
    cancel: Arc<AtomicBool>,
    /// Disconnects when the worker thread exits.
    done: Receiver<()>,
    queue: Option<Arc<EnrichmentQueue>>,
}

/// What `status()` reports. Idle when no session was ever started.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub status: String,
    pub session_id: Option<String>,
    pub video_source: Option<String>,
    pub is_webcam: bool,
    pub camera_index: Option<u32>,
    pub current_frame: u64,
    pub fps: f64,
    pub elapsed_time: f64,
    pub incidents_detected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<SessionStatistics>,
}

impl SessionSnapshot {
    fn idle() -> Self {
        Self {
            status: "idle".to_string(),
            session_id: None,
            video_source: None,
            is_webcam: false,
            camera_index: None,
            current_frame: 0,
            fps: 0.0,
            elapsed_time: 0.0,
            incidents_detected: 0,
            statistics: None,
        }
    }
}

pub struct SessionOrchestrator {
    services: SessionServices,
    slot: Mutex<Option<SessionHandle>>,
}

impl SessionOrchestrator {
    pub fn new(services: SessionServices) -> Self {
        Self {
            services,
            slot: Mutex::new(None),
        }
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    fn running_session_id(&self) -> Option<String> {
        self.slot
            .lock()
            .as_ref()
            .filter(|h| h.shared.status() == SessionStatus::Running)
            .map(|h| h.shared.id.clone())
    }

    // ========================================================================
    // START
    // ========================================================================

    pub fn start(&self, source: VideoSource) -> Result<String, SessionError> {
        if let Some(session_id) = self.running_session_id() {
            return Err(SessionError::Conflict { session_id });
        }

        // Validation happens before anything is committed.
        if let Some(index) = source.camera_index() {
            if self.services.cameras.stop_preview(index) {
                thread::sleep(Duration::from_millis(self.services.config.session.camera_settle_ms));
            }
        } else if let VideoSource::File(path) = &source {
            if !path.exists() {
                return Err(SessionError::SourceNotFound(path.clone()));
            }
        }
        let frame_source = self.services.sources.open(&source)?;
        let detector = self.services.detectors.create()?;

        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let metrics = Arc::new(SessionMetrics::new());
        let shared = Arc::new(SessionShared {
            id: session_id.clone(),
            source: source.clone(),
            start_time: self.services.clock.now(),
            status: AtomicU8::new(SessionStatus::Running as u8),
            end_time_bits: AtomicU64::new(0),
            metrics: Arc::clone(&metrics),
            statistics: Mutex::new(None),
        });
        let cancel = Arc::new(AtomicBool::new(false));

        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            if existing.shared.status() == SessionStatus::Running {
                return Err(SessionError::Conflict {
                    session_id: existing.shared.id.clone(),
                });
            }
        }

        let queue = self.start_enrichment_queue()?;
        let pipeline = self.build_pipeline(
            &source,
            frame_source,
            detector,
            queue.clone(),
            Arc::clone(&metrics),
            Arc::clone(&cancel),
        );

        let (done_tx, done_rx) = bounded::<()>(0);
        let worker_shared = Arc::clone(&shared);
        let worker_queue = queue.clone();
        let worker_cancel = Arc::clone(&cancel);
        let broadcaster = Arc::clone(&self.services.broadcaster);
        let clock = Arc::clone(&self.services.clock);
        let enrichment_stop = secs(self.services.config.enrichment.stop_timeout_secs);

        let spawned = thread::Builder::new()
            .name(format!("session-{}", &session_id[..8]))
            .spawn(move || {
                let _done = done_tx;
                let exit = match pipeline.run() {
                    Ok(exit) => exit,
                    Err(e) => {
                        error!("❌ Detection error: {:#}", e);
                        broadcaster.send_error("Detection failed", Some(format!("{:#}", e)));
                        PipelineExit::EndOfStream
                    }
                };
                if exit == PipelineExit::Cancelled || worker_cancel.load(Ordering::SeqCst) {
                    return;
                }
                // Ended on its own: close the session unless a stop is already
                // doing it.
                if worker_shared.transition(SessionStatus::Running, SessionStatus::Stopping) {
                    let stats = finish_session(
                        &worker_shared,
                        worker_queue.as_deref(),
                        clock.as_ref(),
                        enrichment_stop,
                    );
                    broadcaster.send_status_with_statistics(
                        "stopped",
                        "Video processing completed",
                        stats,
                    );
                }
            });

        if let Err(e) = spawned {
            if let Some(queue) = &queue {
                queue.stop(enrichment_stop);
            }
            return Err(SessionError::Internal(
                anyhow::Error::new(e).context("Failed to spawn session worker"),
            ));
        }

        *slot = Some(SessionHandle {
            shared,
            cancel,
            done: done_rx,
            queue,
        });
        drop(slot);

        info!(
            "▶️  Detection session {} started on {} (webcam={})",
            session_id,
            source,
            source.is_webcam()
        );
        self.services
            .broadcaster
            .send_status("running", format!("Detection started for {}", source));
        Ok(session_id)
    }

    fn start_enrichment_queue(&self) -> Result<Option<Arc<EnrichmentQueue>>, SessionError> {
        let Some(analyzer) = &self.services.analyzer else {
            return Ok(None);
        };
        let config = &self.services.config.enrichment;
        let queue = Arc::new(EnrichmentQueue::new(
            Arc::clone(analyzer),
            config.prompt_template.clone(),
            config.queue_capacity,
        ));
        let incidents = Arc::clone(&self.services.incidents);
        queue.subscribe(move |result| {
            incidents.handle_enrichment_result(result);
            Ok(())
        });
        queue.start()?;
        Ok(Some(queue))
    }

    fn build_pipeline(
        &self,
        source: &VideoSource,
        frame_source: Box<dyn super::source::FrameSource>,
        detector: Box<dyn crate::detection::Detector>,
        queue: Option<Arc<EnrichmentQueue>>,
        metrics: Arc<SessionMetrics>,
        cancel: Arc<AtomicBool>,
    ) -> FramePipeline {
        let config = &self.services.config;
        let clock = Arc::clone(&self.services.clock);

        let lifecycle = IncidentLifecycle::new(
            Arc::clone(&self.services.incidents),
            queue,
            source.camera_id(),
            source.is_webcam(),
            Arc::clone(&metrics),
        );
        let warning = WarningStateMachine::new(WarningConfig {
            warning_duration_secs: config.danger.warning_duration_secs,
            detection_window_secs: config.danger.detection_window_secs,
        });

        FramePipeline::new(
            frame_source,
            detector,
            OverlapEvaluator::new(config.danger.overlap_threshold),
            warning,
            lifecycle,
            Arc::clone(&metrics),
            Arc::clone(&clock),
            cancel,
        )
        .with_sink(Box::new(BroadcastSink::new(
            Arc::clone(&self.services.broadcaster),
            Arc::clone(&clock),
            config.realtime.frame_interval_secs,
            config.realtime.max_frame_width,
            config.realtime.jpeg_quality,
        )))
        .with_sink(Box::new(StatsSink::new(
            metrics,
            clock,
            config.session.fps_update_interval_secs,
        )))
    }

    // ========================================================================
    // STOP / STATUS
    // ========================================================================

    pub fn stop(&self) -> Result<SessionStatistics, SessionError> {
        let (shared, cancel, done, queue) = {
            let slot = self.slot.lock();
            let handle = slot.as_ref().ok_or(SessionError::NotFound)?;
            if !handle
                .shared
                .transition(SessionStatus::Running, SessionStatus::Stopping)
            {
                return Err(SessionError::NotFound);
            }
            (
                Arc::clone(&handle.shared),
                Arc::clone(&handle.cancel),
                handle.done.clone(),
                handle.queue.clone(),
            )
        };

        cancel.store(true, Ordering::SeqCst);
        let timeout = secs(self.services.config.session.stop_timeout_secs);
        if let Err(RecvTimeoutError::Timeout) = done.recv_timeout(timeout) {
            warn!(
                "Detection worker did not stop within {:.1}s, continuing cleanup",
                timeout.as_secs_f64()
            );
        }

        let stats = finish_session(
            &shared,
            queue.as_deref(),
            self.services.clock.as_ref(),
            secs(self.services.config.enrichment.stop_timeout_secs),
        );
        self.services
            .broadcaster
            .send_status_with_statistics("stopped", "Detection stopped", stats);
        Ok(stats)
    }

    pub fn status(&self) -> SessionSnapshot {
        let Some(shared) = self.slot.lock().as_ref().map(|h| Arc::clone(&h.shared)) else {
            return SessionSnapshot::idle();
        };

        let elapsed = shared
            .end_time()
            .unwrap_or_else(|| self.services.clock.now())
            - shared.start_time;
        let statistics = *shared.statistics.lock();
        SessionSnapshot {
            status: shared.status().as_str().to_string(),
            session_id: Some(shared.id.clone()),
            video_source: Some(shared.source.to_string()),
            is_webcam: shared.source.is_webcam(),
            camera_index: shared.source.camera_index(),
            current_frame: shared.metrics.frames(),
            fps: statistics
                .map(|s| s.average_fps)
                .unwrap_or_else(|| shared.metrics.fps()),
            elapsed_time: elapsed.max(0.0),
            incidents_detected: shared.metrics.get(&shared.metrics.incidents_created),
            statistics,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_session_id().is_some()
    }

    /// Stop any running session and release held cameras.
    pub fn shutdown(&self) {
        if self.is_running() {
            match self.stop() {
                Ok(stats) => info!(
                    "Session stopped on shutdown: {} frames in {:.1}s",
                    stats.total_frames, stats.processing_time
                ),
                Err(e) => warn!("Shutdown stop failed: {}", e),
            }
        }
        self.services.cameras.cleanup();
    }
}

/// Freeze timing, compute statistics, stop enrichment and mark the session
/// stopped. The caller must have moved the status to `Stopping`.
fn finish_session(
    shared: &SessionShared,
    queue: Option<&EnrichmentQueue>,
    clock: &dyn Clock,
    enrichment_stop: Duration,
) -> SessionStatistics {
    let end_time = clock.now();
    shared.end_time_bits.store(end_time.to_bits(), Ordering::SeqCst);
    let stats = shared.metrics.statistics(end_time - shared.start_time);
    *shared.statistics.lock() = Some(stats);

    if let Some(queue) = queue {
        queue.stop(enrichment_stop);
    }
    shared.transition(SessionStatus::Stopping, SessionStatus::Stopped);

    info!(
        "⏹️  Detection session {} stopped: {} frames in {:.1}s ({:.1} fps, {} incidents)",
        shared.id,
        stats.total_frames,
        stats.processing_time,
        stats.average_fps,
        stats.incidents_detected
    );
    stats
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::detection::{DetectionResult, Detector};
    use crate::incident::MemoryIncidentStore;
    use crate::notification::LogOnlyNotifier;
    use crate::realtime::ChannelObserver;
    use crate::session::source::{FrameRead, FrameSource};
    use crate::types::Frame;
    use std::time::Instant;

    /// Either a fixed number of frames, or a camera that never delivers.
    struct FakeSource {
        remaining: Option<u64>,
        next: u64,
    }

    impl FrameSource for FakeSource {
        fn next_frame(&mut self) -> FrameRead {
            match self.remaining.as_mut() {
                None => FrameRead::TransientError("no signal".into()),
                Some(0) => FrameRead::EndOfStream,
                Some(left) => {
                    *left -= 1;
                    self.next += 1;
                    FrameRead::Frame(Frame::new(self.next - 1, 0.0, 4, 4, vec![0u8; 48]))
                }
            }
        }

        fn is_live(&self) -> bool {
            self.remaining.is_none()
        }
    }

    struct FakeOpener {
        frames: Option<u64>,
    }

    impl SourceOpener for FakeOpener {
        fn open(&self, source: &VideoSource) -> Result<Box<dyn FrameSource>, SessionError> {
            if source.is_webcam() && self.frames.is_some() {
                return Err(SessionError::SourceUnavailable {
                    target: source.to_string(),
                    reason: "busy".into(),
                });
            }
            Ok(Box::new(FakeSource {
                remaining: self.frames,
                next: 0,
            }))
        }
    }

    struct Nothing;

    impl Detector for Nothing {
        fn detect(&mut self, frame: &Frame) -> anyhow::Result<DetectionResult> {
            Ok(DetectionResult::empty(frame.width, frame.height))
        }
    }

    fn orchestrator(frames: Option<u64>) -> (SessionOrchestrator, tempfile::TempDir, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000.0));
        let broadcaster = Arc::new(RealtimeBroadcaster::new());
        let incidents = Arc::new(
            IncidentManager::new(
                dir.path().join("incidents"),
                Arc::new(MemoryIncidentStore::new()),
                Arc::new(LogOnlyNotifier),
                Some(Arc::clone(&broadcaster)),
            )
            .unwrap(),
        );
        let detectors: Arc<dyn DetectorFactory> =
            Arc::new(|| -> anyhow::Result<Box<dyn Detector>> { Ok(Box::new(Nothing)) });
        let services = SessionServices {
            config: AppConfig::default(),
            clock: clock.clone(),
            detectors,
            sources: Arc::new(FakeOpener { frames }),
            incidents,
            analyzer: None,
            broadcaster,
            cameras: Arc::new(CameraPreviewRegistry::new()),
        };
        (SessionOrchestrator::new(services), dir, clock)
    }

    fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_status_idle_before_any_session() {
        let (orch, _dir, _clock) = orchestrator(None);
        let snapshot = orch.status();
        assert_eq!(snapshot.status, "idle");
        assert!(snapshot.session_id.is_none());
        assert!(matches!(orch.stop(), Err(SessionError::NotFound)));
    }

    #[test]
    fn test_second_start_conflicts() {
        let (orch, _dir, _clock) = orchestrator(None);
        let first = orch.start(VideoSource::Webcam(0)).unwrap();

        match orch.start(VideoSource::Webcam(1)) {
            Err(SessionError::Conflict { session_id }) => assert_eq!(session_id, first),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
        assert_eq!(orch.status().session_id.as_deref(), Some(first.as_str()));
        orch.stop().unwrap();
    }

    #[test]
    fn test_missing_file_rejected_without_session() {
        let (orch, _dir, _clock) = orchestrator(Some(3));
        let err = orch
            .start(VideoSource::File("/no/such/video.mp4".into()))
            .unwrap_err();
        assert!(matches!(err, SessionError::SourceNotFound(_)));
        assert_eq!(orch.status().status, "idle");
    }

    #[test]
    fn test_unopenable_source_leaves_slot_empty() {
        let (orch, _dir, _clock) = orchestrator(Some(3));
        assert!(matches!(
            orch.start(VideoSource::Webcam(0)),
            Err(SessionError::SourceUnavailable { .. })
        ));
        assert!(!orch.is_running());
    }

    #[test]
    fn test_stop_returns_statistics_and_freezes_elapsed() {
        let (orch, _dir, clock) = orchestrator(None);
        let (observer, rx) = ChannelObserver::new(16);
        orch.services().broadcaster.subscribe(Arc::new(observer));

        orch.start(VideoSource::Webcam(0)).unwrap();
        assert!(rx.recv().unwrap().contains("Detection started for camera 0"));
        clock.advance(4.0);
        assert_eq!(orch.status().elapsed_time, 4.0);

        let stats = orch.stop().unwrap();
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.processing_time, 4.0);
        assert_eq!(stats.incidents_detected, 0);

        clock.advance(10.0);
        let snapshot = orch.status();
        assert_eq!(snapshot.status, "stopped");
        assert_eq!(snapshot.elapsed_time, 4.0);
        assert!(snapshot.is_webcam);
        assert_eq!(snapshot.camera_index, Some(0));

        let stopped = rx.recv().unwrap();
        assert!(stopped.contains("\"stopped\"") && stopped.contains("total_frames"));
        assert!(matches!(orch.stop(), Err(SessionError::NotFound)));
    }

    #[test]
    fn test_start_releases_camera_preview() {
        let (orch, _dir, _clock) = orchestrator(None);
        let preview = orch.services().cameras.register(2);
        orch.start(VideoSource::Webcam(2)).unwrap();
        assert!(preview.should_stop());
        orch.shutdown();
        assert!(!orch.is_running());
    }

    #[test]
    fn test_end_of_file_closes_session() {
        let (orch, dir, _clock) = orchestrator(Some(5));
        let video = dir.path().join("pool.mp4");
        std::fs::write(&video, b"").unwrap();

        orch.start(VideoSource::File(video)).unwrap();
        wait_until(|| orch.status().status == "stopped");

        let snapshot = orch.status();
        assert_eq!(snapshot.current_frame, 5);
        assert_eq!(snapshot.statistics.map(|s| s.total_frames), Some(5));
        assert!(matches!(orch.stop(), Err(SessionError::NotFound)));

        // The slot is free again.
        let video = dir.path().join("pool.mp4");
        assert!(orch.start(VideoSource::File(video)).is_ok());
    }
}
