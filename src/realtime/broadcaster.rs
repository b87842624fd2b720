// src/realtime/broadcaster.rs
//
// Fan-out of realtime events to every connected observer. A failed send
// unsubscribes that observer only; the rest of the broadcast continues.
// Observers are snapshotted under the lock and sent to outside it.

use super::message::{FrameDetections, RealtimeMessage};
use crate::config::RealtimeConfig;
use crate::incident::IncidentRecord;
use crate::pipeline::SessionStatistics;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub type ObserverId = u64;

/// One connected client. `send` must not block for long.
pub trait Observer: Send + Sync {
    fn send(&self, message: &str) -> anyhow::Result<()>;
}

const DEFAULT_MAILBOX_CAPACITY: usize = 64;

pub struct RealtimeBroadcaster {
    observers: Mutex<Vec<(ObserverId, Arc<dyn Observer>)>>,
    next_id: AtomicU64,
    /// Mailbox size for observers made by `subscribe_channel`.
    mailbox_capacity: usize,
}

impl Default for RealtimeBroadcaster {
    fn default() -> Self {
        Self::with_mailbox_capacity(DEFAULT_MAILBOX_CAPACITY)
    }
}

impl RealtimeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailbox_capacity(capacity: usize) -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            mailbox_capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::with_mailbox_capacity(config.observer_buffer)
    }

    pub fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity
    }

    /// Subscribe a `ChannelObserver` sized by the configured buffer and
    /// hand back its receiving end.
    pub fn subscribe_channel(&self) -> (ObserverId, Receiver<String>) {
        let (observer, receiver) = ChannelObserver::new(self.mailbox_capacity);
        (self.subscribe(Arc::new(observer)), receiver)
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut observers = self.observers.lock();
        observers.push((id, observer));
        info!("Observer {} connected. Total observers: {}", id, observers.len());
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        let removed = observers.len() != before;
        if removed {
            info!("Observer {} disconnected. Total observers: {}", id, observers.len());
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Send to every observer; returns how many accepted the message.
    pub fn broadcast(&self, message: &RealtimeMessage) -> usize {
        let snapshot: Vec<(ObserverId, Arc<dyn Observer>)> = self.observers.lock().clone();
        if snapshot.is_empty() {
            return 0;
        }

        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize {} message: {}", message.kind(), e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, observer) in snapshot {
            match observer.send(&payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Failed to send {} message to observer {}: {:#}", message.kind(), id, e);
                    failed.push(id);
                }
            }
        }

        for id in failed {
            self.unsubscribe(id);
        }
        delivered
    }

    pub fn send_status(&self, status: &str, message: impl Into<String>) {
        self.broadcast(&RealtimeMessage::status(status, message));
    }

    pub fn send_status_with_statistics(
        &self,
        status: &str,
        message: impl Into<String>,
        statistics: SessionStatistics,
    ) {
        self.broadcast(&RealtimeMessage::Status {
            status: status.to_string(),
            message: message.into(),
            statistics: Some(statistics),
        });
    }

    pub fn send_error(&self, error: impl Into<String>, details: Option<String>) {
        self.broadcast(&RealtimeMessage::error(error, details));
    }

    pub fn send_alert(&self, incident: &IncidentRecord, message: impl Into<String>) {
        self.broadcast(&RealtimeMessage::Alert {
            severity: "warning".to_string(),
            message: message.into(),
            incident_id: incident.incident_id.clone(),
            overlap_ratio: incident.overlap_ratio,
            camera_id: incident.camera_id.clone(),
            timestamp: incident.timestamp,
            summary: incident.summary.clone(),
            confidence: incident.confidence,
        });
    }

    pub fn send_frame(
        &self,
        frame_id: u64,
        timestamp: f64,
        image: Option<String>,
        detections: FrameDetections,
    ) {
        self.broadcast(&RealtimeMessage::Frame {
            frame_id,
            timestamp,
            image,
            detections,
        });
    }
}

/// Observer backed by a bounded mailbox. A full mailbox drops the message
/// and keeps the observer; a dropped receiver unsubscribes it.
pub struct ChannelObserver {
    sender: Sender<String>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, Receiver<String>) {
        let (sender, receiver) = bounded(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl Observer for ChannelObserver {
    fn send(&self, message: &str) -> anyhow::Result<()> {
        match self.sender.try_send(message.to_string()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Observer mailbox full; dropping message");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => anyhow::bail!("observer disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenObserver;

    impl Observer for BrokenObserver {
        fn send(&self, _message: &str) -> anyhow::Result<()> {
            anyhow::bail!("socket closed")
        }
    }

    #[test]
    fn test_failing_observer_removed_others_still_delivered() {
        let broadcaster = RealtimeBroadcaster::new();
        let (first, first_rx) = ChannelObserver::new(8);
        let (last, last_rx) = ChannelObserver::new(8);
        broadcaster.subscribe(Arc::new(first));
        broadcaster.subscribe(Arc::new(BrokenObserver));
        broadcaster.subscribe(Arc::new(last));

        broadcaster.send_status("running", "Detection started");

        assert_eq!(broadcaster.observer_count(), 2);
        let first_msg: serde_json::Value =
            serde_json::from_str(&first_rx.try_recv().unwrap()).unwrap();
        assert_eq!(first_msg["status"], "running");
        assert!(last_rx.try_recv().is_ok());
    }

    #[test]
    fn test_full_mailbox_keeps_observer() {
        let broadcaster = RealtimeBroadcaster::new();
        let (slow, slow_rx) = ChannelObserver::new(1);
        broadcaster.subscribe(Arc::new(slow));

        broadcaster.send_error("a", None);
        broadcaster.send_error("b", None);

        assert_eq!(broadcaster.observer_count(), 1);
        assert_eq!(slow_rx.len(), 1);
    }

    #[test]
    fn test_disconnected_receiver_unsubscribes() {
        let broadcaster = RealtimeBroadcaster::new();
        let (gone, gone_rx) = ChannelObserver::new(4);
        broadcaster.subscribe(Arc::new(gone));
        drop(gone_rx);

        assert_eq!(broadcaster.broadcast(&RealtimeMessage::status("stopped", "")), 0);
        assert_eq!(broadcaster.observer_count(), 0);
    }

    #[test]
    fn test_channel_mailbox_sized_from_config() {
        let config = RealtimeConfig {
            observer_buffer: 3,
            ..RealtimeConfig::default()
        };
        let broadcaster = RealtimeBroadcaster::from_config(&config);
        let (_id, rx) = broadcaster.subscribe_channel();
        assert_eq!(rx.capacity(), Some(3));

        for i in 0..5 {
            broadcaster.send_error(format!("e{}", i), None);
        }
        assert_eq!(rx.len(), 3);
        assert_eq!(broadcaster.observer_count(), 1);

        assert_eq!(RealtimeBroadcaster::new().mailbox_capacity(), 64);
    }

    #[test]
    fn test_unsubscribe_by_id() {
        let broadcaster = RealtimeBroadcaster::new();
        let (obs, _rx) = ChannelObserver::new(4);
        let id = broadcaster.subscribe(Arc::new(obs));
        assert!(broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(id));
    }
}
