// src/session/camera.rs
//
// Cameras held open for live preview outside a detection session. A
// session on the same camera asks the holder to let go first.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Given to whoever drives a preview; it polls `should_stop`.
#[derive(Debug, Clone)]
pub struct PreviewHandle {
    stop: Arc<AtomicBool>,
}

impl PreviewHandle {
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct CameraPreviewRegistry {
    previews: Mutex<HashMap<u32, Arc<AtomicBool>>>,
}

impl CameraPreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a preview. An existing preview on the same camera is
    /// told to stop and replaced.
    pub fn register(&self, camera_index: u32) -> PreviewHandle {
        let stop = Arc::new(AtomicBool::new(false));
        if let Some(previous) = self.previews.lock().insert(camera_index, stop.clone()) {
            previous.store(true, Ordering::SeqCst);
        }
        PreviewHandle { stop }
    }

    /// Returns true if a preview was running.
    pub fn stop_preview(&self, camera_index: u32) -> bool {
        let Some(stop) = self.previews.lock().remove(&camera_index) else {
            return false;
        };
        stop.store(true, Ordering::SeqCst);
        info!("Stopped preview on camera {}", camera_index);
        true
    }

    pub fn is_previewing(&self, camera_index: u32) -> bool {
        self.previews.lock().contains_key(&camera_index)
    }

    pub fn cleanup(&self) {
        let previews: Vec<(u32, Arc<AtomicBool>)> = self.previews.lock().drain().collect();
        for (index, stop) in previews {
            stop.store(true, Ordering::SeqCst);
            info!("Stopped preview on camera {}", index);
        }
    }
}
