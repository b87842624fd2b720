// src/incident/lifecycle.rs
//
// Per-session incident bookkeeping, driven from the frame loop:
//   - one incident per warning episode
//   - at most one enrichment task per incident
//   - tracking cleared when the episode ends
// Lives on the pipeline thread; nothing here is shared.

use super::manager::{IncidentManager, NewIncident};
use crate::enrichment::{EnrichmentQueue, EnrichmentTask};
use crate::pipeline::SessionMetrics;
use crate::types::{BBox, Frame};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const ENRICHMENT_UNAVAILABLE: &str =
    "Visual analysis unavailable: no vision provider configured.";

pub struct IncidentLifecycle {
    manager: Arc<IncidentManager>,
    queue: Option<Arc<EnrichmentQueue>>,
    camera_id: String,
    is_webcam: bool,
    metrics: Arc<SessionMetrics>,
    current_incident: Option<String>,
    dispatched: bool,
}

impl IncidentLifecycle {
    pub fn new(
        manager: Arc<IncidentManager>,
        queue: Option<Arc<EnrichmentQueue>>,
        camera_id: impl Into<String>,
        is_webcam: bool,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            manager,
            queue,
            camera_id: camera_id.into(),
            is_webcam,
            metrics,
            current_incident: None,
            dispatched: false,
        }
    }

    pub fn current_incident(&self) -> Option<&str> {
        self.current_incident.as_deref()
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    /// Incident for the running episode, created on first call.
    pub fn ensure_incident(
        &mut self,
        frame: &Frame,
        bbox: Option<BBox>,
        overlap_ratio: f32,
        timestamp: f64,
    ) -> Option<String> {
        if let Some(id) = &self.current_incident {
            return Some(id.clone());
        }
        let bbox = bbox?;

        let mut metadata = BTreeMap::new();
        metadata.insert("is_webcam".to_string(), self.is_webcam.to_string());

        let record = self.manager.create_incident(NewIncident {
            frame,
            camera_id: &self.camera_id,
            bbox,
            overlap_ratio,
            timestamp,
            metadata,
        });
        self.metrics.inc(&self.metrics.incidents_created);
        self.current_incident = Some(record.incident_id.clone());
        self.dispatched = false;
        Some(record.incident_id)
    }

    /// Queue enrichment for `incident_id` unless it already went out. With
    /// no queue the incident is finalized as skipped right away. A dropped
    /// submission leaves the flag clear so a later frame can try again.
    pub fn maybe_dispatch_enrichment(
        &mut self,
        frame: &Frame,
        bbox: Option<BBox>,
        overlap_ratio: f32,
        timestamp: f64,
        incident_id: Option<&str>,
        warning_active: bool,
    ) {
        let (Some(bbox), Some(incident_id)) = (bbox, incident_id) else {
            return;
        };
        if self.dispatched {
            return;
        }

        let Some(queue) = &self.queue else {
            self.manager
                .finalize_without_enrichment(incident_id, ENRICHMENT_UNAVAILABLE);
            self.dispatched = true;
            return;
        };

        let Some(clamped) = bbox.clamp_to(frame.width, frame.height) else {
            warn!("Incident {}: bbox {} lies outside the frame", incident_id, bbox);
            return;
        };
        let Some(crop) = frame.crop(&clamped) else {
            warn!("Incident {}: failed to crop frame {}", incident_id, frame.index);
            return;
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("is_webcam".to_string(), self.is_webcam.to_string());
        metadata.insert("warning_active".to_string(), warning_active.to_string());

        let task = EnrichmentTask {
            incident_id: incident_id.to_string(),
            frame_id: frame.index,
            timestamp,
            camera_id: self.camera_id.clone(),
            overlap_ratio,
            bbox: clamped,
            image: crop,
            metadata,
        };

        if queue.submit(task, false) {
            self.dispatched = true;
            self.metrics.inc(&self.metrics.enrichment_dispatched);
            debug!("Incident {}: enrichment dispatched", incident_id);
        } else {
            self.metrics.inc(&self.metrics.enrichment_dropped);
        }
    }

    /// Episode ended: the next qualifying frame starts a fresh incident.
    pub fn reset_episode_tracking(&mut self) {
        self.current_incident = None;
        self.dispatched = false;
    }
}
