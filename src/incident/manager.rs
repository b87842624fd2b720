// src/incident/manager.rs
//
// Owns incident records for the process: creation with a screenshot,
// enrichment outcomes, and the notification step. Status moves are
// checked against `IncidentStatus::can_transition_to`, so a late or
// duplicate result can never drag a record backwards.

use super::record::{IncidentRecord, IncidentStatus};
use super::store::IncidentStore;
use crate::enrichment::EnrichmentResult;
use crate::notification::NotificationDispatcher;
use crate::realtime::RealtimeBroadcaster;
use crate::types::{BBox, Frame};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Inputs for a new incident, taken from the qualifying frame.
pub struct NewIncident<'a> {
    pub frame: &'a Frame,
    pub camera_id: &'a str,
    pub bbox: BBox,
    pub overlap_ratio: f32,
    pub timestamp: f64,
    pub metadata: BTreeMap<String, String>,
}

pub struct IncidentManager {
    output_dir: PathBuf,
    records: Mutex<HashMap<String, IncidentRecord>>,
    store: Arc<dyn IncidentStore>,
    notifier: Arc<dyn NotificationDispatcher>,
    broadcaster: Option<Arc<RealtimeBroadcaster>>,
}

impl IncidentManager {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        store: Arc<dyn IncidentStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        broadcaster: Option<Arc<RealtimeBroadcaster>>,
    ) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        Ok(Self {
            output_dir,
            records: Mutex::new(HashMap::new()),
            store,
            notifier,
            broadcaster,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn store(&self) -> &Arc<dyn IncidentStore> {
        &self.store
    }

    /// Persist a screenshot and a pending record. A screenshot that cannot
    /// be written leaves `screenshot_path` empty; the incident still exists.
    pub fn create_incident(&self, new: NewIncident<'_>) -> IncidentRecord {
        let incident_id = uuid::Uuid::new_v4().simple().to_string();
        let screenshot_path = match self.write_screenshot(&incident_id, new.frame) {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                warn!("Failed to save screenshot for incident {}: {:#}", incident_id, e);
                String::new()
            }
        };

        let record = IncidentRecord {
            incident_id: incident_id.clone(),
            camera_id: new.camera_id.to_string(),
            frame_id: new.frame.index,
            timestamp: new.timestamp,
            overlap_ratio: new.overlap_ratio,
            bbox: new.bbox,
            screenshot_path,
            status: IncidentStatus::EnrichmentPending,
            summary: None,
            confidence: None,
            metadata: new.metadata,
        };

        self.records.lock().insert(incident_id.clone(), record.clone());
        if let Err(e) = self.store.create(&record) {
            error!("Failed to persist incident {}: {:#}", incident_id, e);
        }

        info!(
            "📸 Incident {} created (camera={}, frame={}, overlap={:.2})",
            incident_id, record.camera_id, record.frame_id, record.overlap_ratio
        );
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.send_alert(
                &record,
                format!(
                    "Drowning danger detected! Overlap ratio: {:.2}",
                    record.overlap_ratio
                ),
            );
        }
        record
    }

    fn write_screenshot(&self, incident_id: &str, frame: &Frame) -> Result<PathBuf> {
        let image = frame
            .to_image()
            .context("frame buffer does not match its dimensions")?;
        let path = self.output_dir.join(format!("{}.png", incident_id));
        image
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Apply a worker result, then notify. Unknown incidents are ignored.
    pub fn handle_enrichment_result(&self, result: &EnrichmentResult) -> Option<IncidentRecord> {
        let (status, summary, confidence) = match &result.outcome {
            Ok(response) => (
                IncidentStatus::EnrichmentCompleted,
                Some(response.summary.clone()),
                Some(response.confidence),
            ),
            Err(e) => (IncidentStatus::EnrichmentFailed, Some(e.to_string()), Some(0.0)),
        };

        let Some(record) = self.transition(&result.incident_id, status, summary, confidence) else {
            warn!(
                "Ignoring enrichment result for unknown or finished incident {}",
                result.incident_id
            );
            return None;
        };

        if status == IncidentStatus::EnrichmentCompleted {
            if let Some(broadcaster) = &self.broadcaster {
                broadcaster.send_alert(&record, "Incident analysis completed");
            }
        }

        Some(self.notify(record))
    }

    /// Close the enrichment step without a provider, then notify.
    pub fn finalize_without_enrichment(&self, incident_id: &str, reason: &str) -> Option<IncidentRecord> {
        let record = self.transition(
            incident_id,
            IncidentStatus::EnrichmentSkipped,
            Some(reason.to_string()),
            None,
        )?;
        info!("Incident {} finalized without enrichment: {}", incident_id, reason);
        Some(self.notify(record))
    }

    pub fn get(&self, incident_id: &str) -> Option<IncidentRecord> {
        self.records.lock().get(incident_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Notification runs outside the record lock. Failure keeps the status.
    fn notify(&self, record: IncidentRecord) -> IncidentRecord {
        if !self.notifier.send(&record) {
            return record;
        }
        self.transition(&record.incident_id, IncidentStatus::Notified, None, None)
            .unwrap_or(record)
    }

    /// Move a record to `next`, keeping existing summary/confidence when
    /// the new ones are None. Returns the updated copy, or None when the
    /// record is unknown or the move is not allowed.
    fn transition(
        &self,
        incident_id: &str,
        next: IncidentStatus,
        summary: Option<String>,
        confidence: Option<f32>,
    ) -> Option<IncidentRecord> {
        let updated = {
            let mut records = self.records.lock();
            let record = records.get_mut(incident_id)?;
            if !record.status.can_transition_to(next) {
                warn!(
                    "Incident {}: refusing status change {} -> {}",
                    incident_id, record.status, next
                );
                return None;
            }
            record.status = next;
            if summary.is_some() {
                record.summary = summary;
            }
            if confidence.is_some() {
                record.confidence = confidence;
            }
            record.clone()
        };

        if let Err(e) = self.store.update(&updated) {
            error!("Failed to persist incident {}: {:#}", incident_id, e);
        }
        info!("Incident {} -> {}", incident_id, next);
        Some(updated)
    }
}
