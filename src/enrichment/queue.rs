// src/enrichment/queue.rs
//
// Bounded single-consumer queue between the frame loop and the vision
// provider. Producers never block: a full queue drops the task. One
// background worker drains tasks in submission order and fans every
// result out to the registered subscribers.

use super::client::VisionAnalyzer;
use super::task::{EnrichmentResult, EnrichmentTask};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// How often an idle worker re-checks the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub type ResultSubscriber = Arc<dyn Fn(&EnrichmentResult) -> anyhow::Result<()> + Send + Sync>;

enum QueueItem {
    Task(Box<EnrichmentTask>),
    Shutdown,
}

#[derive(Debug, Default)]
pub struct QueueStats {
    pub submitted: AtomicU64,
    pub dropped: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStatsSnapshot {
    pub submitted: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
}

struct Worker {
    handle: JoinHandle<()>,
    /// Disconnects when the worker thread exits, however it exits.
    done: Receiver<()>,
}

pub struct EnrichmentQueue {
    sender: Sender<QueueItem>,
    receiver: Receiver<QueueItem>,
    analyzer: Arc<dyn VisionAnalyzer>,
    prompt: String,
    subscribers: Arc<RwLock<Vec<ResultSubscriber>>>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
    stats: Arc<QueueStats>,
}

impl EnrichmentQueue {
    pub fn new(analyzer: Arc<dyn VisionAnalyzer>, prompt: impl Into<String>, capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            analyzer,
            prompt: prompt.into(),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            stats: Arc::new(QueueStats::default()),
        }
    }

    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&EnrichmentResult) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(subscriber));
    }

    /// Spawn the worker. Calling it again while a worker exists is a no-op.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        if self.stopped.load(Ordering::SeqCst) {
            anyhow::bail!("enrichment queue already stopped");
        }

        let (done_tx, done_rx) = bounded::<()>(0);
        let receiver = self.receiver.clone();
        let analyzer = Arc::clone(&self.analyzer);
        let prompt = self.prompt.clone();
        let subscribers = Arc::clone(&self.subscribers);
        let stopped = Arc::clone(&self.stopped);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name("enrichment-worker".to_string())
            .spawn(move || {
                let _done = done_tx;
                run_worker(receiver, analyzer.as_ref(), &prompt, &subscribers, &stopped, &stats);
            })?;

        *worker = Some(Worker {
            handle,
            done: done_rx,
        });
        info!("🧠 Enrichment worker started");
        Ok(())
    }

    /// Queue a task. With `blocking == false` this never waits: a full
    /// queue drops the task and returns false.
    pub fn submit(&self, task: EnrichmentTask, blocking: bool) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("Enrichment queue stopped; dropping task for incident {}", task.incident_id);
            return false;
        }
        let incident_id = task.incident_id.clone();
        let item = QueueItem::Task(Box::new(task));

        let sent = if blocking {
            self.sender.send(item).is_ok()
        } else {
            match self.sender.try_send(item) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Enrichment queue full; dropping task for incident {}", incident_id);
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        };

        if sent {
            self.stats.submitted.fetch_add(1, Ordering::Relaxed);
            debug!("Queued enrichment for incident {}", incident_id);
        } else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Stop the worker. The shutdown marker is best-effort; the worker also
    /// watches the stop flag. Returns whether the worker exited in time.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(TrySendError::Full(_)) = self.sender.try_send(QueueItem::Shutdown) {
            debug!("Enrichment queue full; worker will see the stop flag");
        }

        let Some(worker) = self.worker.lock().take() else {
            return true;
        };

        match worker.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if worker.handle.join().is_err() {
                    error!("Enrichment worker panicked");
                }
                info!("🧠 Enrichment worker stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Enrichment worker did not exit within {:.1}s; detaching",
                    timeout.as_secs_f64()
                );
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(0)
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EnrichmentQueue {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.sender.try_send(QueueItem::Shutdown);
    }
}

// ============================================================================
// WORKER
// ============================================================================

fn run_worker(
    receiver: Receiver<QueueItem>,
    analyzer: &dyn VisionAnalyzer,
    prompt: &str,
    subscribers: &RwLock<Vec<ResultSubscriber>>,
    stopped: &AtomicBool,
    stats: &QueueStats,
) {
    while !stopped.load(Ordering::SeqCst) {
        let task = match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(QueueItem::Task(task)) => task,
            Ok(QueueItem::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        };

        let result = process_task(&task, analyzer, prompt);
        match &result.outcome {
            Ok(response) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    "🧠 Enrichment completed for incident {} (confidence {:.2})",
                    result.incident_id, response.confidence
                );
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("🧠 Enrichment failed for incident {}: {}", result.incident_id, e);
            }
        }

        deliver(subscribers, &result);
    }
}

fn process_task(task: &EnrichmentTask, analyzer: &dyn VisionAnalyzer, prompt: &str) -> EnrichmentResult {
    let metadata = task.request_metadata();
    let outcome = analyzer.analyze(&task.image, prompt, &metadata);
    EnrichmentResult::from_task(task, outcome)
}

/// Each subscriber is isolated: an error or panic in one is logged and
/// the rest still receive the result.
fn deliver(subscribers: &RwLock<Vec<ResultSubscriber>>, result: &EnrichmentResult) {
    let snapshot: Vec<ResultSubscriber> = subscribers.read().clone();
    for subscriber in snapshot {
        match panic::catch_unwind(AssertUnwindSafe(|| subscriber(result))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                "Enrichment subscriber failed for incident {}: {:#}",
                result.incident_id, e
            ),
            Err(_) => error!(
                "Enrichment subscriber panicked for incident {}",
                result.incident_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::task::EnrichmentResponse;
    use crate::error::EnrichmentError;
    use crate::types::BBox;
    use image::RgbImage;
    use std::collections::BTreeMap;
    use std::time::Instant;

    struct EchoAnalyzer {
        seen: Mutex<Vec<String>>,
    }

    impl VisionAnalyzer for EchoAnalyzer {
        fn analyze(
            &self,
            _image: &RgbImage,
            _prompt: &str,
            metadata: &BTreeMap<String, String>,
        ) -> Result<EnrichmentResponse, EnrichmentError> {
            let camera = metadata["camera_id"].clone();
            self.seen.lock().push(camera.clone());
            if camera == "broken" {
                return Err(EnrichmentError::Rejected {
                    status: 400,
                    body: "bad image".into(),
                });
            }
            Ok(EnrichmentResponse {
                summary: format!("seen {}", camera),
                confidence: 0.5,
                raw: serde_json::Value::Null,
            })
        }
    }

    /// Blocks inside `analyze` until the gate is dropped.
    struct GatedAnalyzer {
        gate: Receiver<()>,
    }

    impl VisionAnalyzer for GatedAnalyzer {
        fn analyze(
            &self,
            _image: &RgbImage,
            _prompt: &str,
            _metadata: &BTreeMap<String, String>,
        ) -> Result<EnrichmentResponse, EnrichmentError> {
            let _ = self.gate.recv();
            Err(EnrichmentError::Timeout("gated".into()))
        }
    }

    fn task(id: &str, camera: &str) -> EnrichmentTask {
        EnrichmentTask {
            incident_id: id.to_string(),
            frame_id: 0,
            timestamp: 0.0,
            camera_id: camera.to_string(),
            overlap_ratio: 0.95,
            bbox: BBox::new(0, 0, 1, 1),
            image: RgbImage::new(1, 1),
            metadata: BTreeMap::new(),
        }
    }

    fn echo_queue(capacity: usize) -> (EnrichmentQueue, Arc<EchoAnalyzer>) {
        let analyzer = Arc::new(EchoAnalyzer {
            seen: Mutex::new(Vec::new()),
        });
        let queue = EnrichmentQueue::new(analyzer.clone(), "describe", capacity);
        (queue, analyzer)
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let (queue, _) = echo_queue(2);
        assert!(queue.submit(task("a", "cam"), false));
        assert!(queue.submit(task("b", "cam"), false));

        let started = Instant::now();
        assert!(!queue.submit(task("c", "cam"), false));
        assert!(started.elapsed() < Duration::from_millis(100));

        let stats = queue.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_tasks_processed_in_submission_order() {
        let (queue, analyzer) = echo_queue(8);
        let (tx, rx) = crossbeam_channel::unbounded();
        queue.subscribe(move |r: &EnrichmentResult| {
            tx.send(r.incident_id.clone())?;
            Ok(())
        });

        for i in 0..5 {
            assert!(queue.submit(task(&format!("i{}", i), &format!("c{}", i)), false));
        }
        queue.start().unwrap();

        let order: Vec<String> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["i0", "i1", "i2", "i3", "i4"]);
        assert_eq!(*analyzer.seen.lock(), vec!["c0", "c1", "c2", "c3", "c4"]);
        assert!(queue.stop(Duration::from_secs(2)));
    }

    #[test]
    fn test_failing_subscriber_does_not_starve_others() {
        let (queue, _) = echo_queue(8);
        queue.subscribe(|_r: &EnrichmentResult| anyhow::bail!("subscriber down"));
        queue.subscribe(|_r: &EnrichmentResult| -> anyhow::Result<()> { panic!("subscriber bug") });
        let (tx, rx) = crossbeam_channel::unbounded();
        queue.subscribe(move |r: &EnrichmentResult| {
            tx.send(r.is_success())?;
            Ok(())
        });
        queue.start().unwrap();

        assert!(queue.submit(task("ok", "cam"), false));
        assert!(queue.submit(task("bad", "broken"), false));

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(queue.stop(Duration::from_secs(2)));

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_stop_is_bounded_when_worker_is_busy() {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let queue = EnrichmentQueue::new(Arc::new(GatedAnalyzer { gate: gate_rx }), "describe", 4);
        queue.start().unwrap();
        assert!(queue.submit(task("stuck", "cam"), false));
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(!queue.stop(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!queue.submit(task("late", "cam"), false));
        drop(gate_tx);
    }

    #[test]
    fn test_stop_without_start_is_clean() {
        let (queue, _) = echo_queue(1);
        assert!(queue.stop(Duration::from_millis(10)));
        assert!(queue.start().is_err());
    }
}
