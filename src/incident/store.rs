// src/incident/store.rs
//
// Incident persistence. The JSON store keeps every record in one
// `incidents.json` file keyed by incident id and rewrites it on change.

use super::record::IncidentRecord;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const METADATA_FILE: &str = "incidents.json";

#[derive(Debug, Clone)]
pub struct IncidentQuery {
    /// 1-based.
    pub page: usize,
    pub limit: usize,
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl Default for IncidentQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            start: None,
            end: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentPage {
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub incidents: Vec<IncidentRecord>,
}

pub trait IncidentStore: Send + Sync {
    fn create(&self, record: &IncidentRecord) -> Result<()>;
    /// Replace the stored copy of an existing record.
    fn update(&self, record: &IncidentRecord) -> Result<()>;
    fn get(&self, incident_id: &str) -> Option<IncidentRecord>;
    /// Newest first.
    fn list(&self, query: &IncidentQuery) -> IncidentPage;
    /// Removes the record and its screenshot. False when unknown.
    fn delete(&self, incident_id: &str) -> Result<bool>;

    fn screenshot_path(&self, incident_id: &str) -> Option<PathBuf> {
        self.get(incident_id)
            .filter(|r| !r.screenshot_path.is_empty())
            .map(|r| PathBuf::from(r.screenshot_path))
    }
}

fn paginate(records: impl Iterator<Item = IncidentRecord>, query: &IncidentQuery) -> IncidentPage {
    let mut incidents: Vec<IncidentRecord> = records
        .filter(|r| query.start.map_or(true, |s| r.timestamp >= s))
        .filter(|r| query.end.map_or(true, |e| r.timestamp <= e))
        .collect();
    incidents.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));

    let total = incidents.len();
    let page = query.page.max(1);
    let skip = (page - 1).saturating_mul(query.limit);
    let incidents = incidents.into_iter().skip(skip).take(query.limit).collect();

    IncidentPage {
        total,
        page,
        limit: query.limit,
        incidents,
    }
}

fn remove_screenshot(record: &IncidentRecord) {
    if record.screenshot_path.is_empty() {
        return;
    }
    let path = Path::new(&record.screenshot_path);
    if path.exists() {
        match fs::remove_file(path) {
            Ok(()) => info!("Deleted screenshot: {}", path.display()),
            Err(e) => error!("Failed to delete screenshot {}: {}", path.display(), e),
        }
    }
}

/// Store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryIncidentStore {
    records: Mutex<HashMap<String, IncidentRecord>>,
}

impl MemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IncidentStore for MemoryIncidentStore {
    fn create(&self, record: &IncidentRecord) -> Result<()> {
        self.records
            .lock()
            .insert(record.incident_id.clone(), record.clone());
        Ok(())
    }

    fn update(&self, record: &IncidentRecord) -> Result<()> {
        self.create(record)
    }

    fn get(&self, incident_id: &str) -> Option<IncidentRecord> {
        self.records.lock().get(incident_id).cloned()
    }

    fn list(&self, query: &IncidentQuery) -> IncidentPage {
        let records: Vec<IncidentRecord> = self.records.lock().values().cloned().collect();
        paginate(records.into_iter(), query)
    }

    fn delete(&self, incident_id: &str) -> Result<bool> {
        let removed = self.records.lock().remove(incident_id);
        if let Some(record) = &removed {
            remove_screenshot(record);
        }
        Ok(removed.is_some())
    }
}

pub struct JsonIncidentStore {
    metadata_file: PathBuf,
    records: Mutex<HashMap<String, IncidentRecord>>,
}

impl JsonIncidentStore {
    /// Opens (or creates) the store under `incident_dir`. An unreadable
    /// metadata file is logged and treated as empty.
    pub fn open(incident_dir: &Path) -> Result<Self> {
        fs::create_dir_all(incident_dir)
            .with_context(|| format!("Failed to create {}", incident_dir.display()))?;
        let metadata_file = incident_dir.join(METADATA_FILE);

        let records = match Self::load(&metadata_file) {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to load incidents metadata: {:#}", e);
                HashMap::new()
            }
        };
        if !records.is_empty() {
            info!("Loaded {} incidents from metadata", records.len());
        }

        Ok(Self {
            metadata_file,
            records: Mutex::new(records),
        })
    }

    fn load(path: &Path) -> Result<HashMap<String, IncidentRecord>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(path)?;
        let records = serde_json::from_str(&contents)
            .with_context(|| format!("Malformed {}", path.display()))?;
        Ok(records)
    }

    fn save(&self, records: &HashMap<String, IncidentRecord>) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        let tmp = self.metadata_file.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.metadata_file)
            .with_context(|| format!("Failed to write {}", self.metadata_file.display()))?;
        Ok(())
    }

    fn upsert(&self, record: &IncidentRecord) -> Result<()> {
        let mut records = self.records.lock();
        records.insert(record.incident_id.clone(), record.clone());
        self.save(&records)
    }
}

impl IncidentStore for JsonIncidentStore {
    fn create(&self, record: &IncidentRecord) -> Result<()> {
        self.upsert(record)
    }

    fn update(&self, record: &IncidentRecord) -> Result<()> {
        if !self.records.lock().contains_key(&record.incident_id) {
            warn!("Updating unknown incident {}; storing it", record.incident_id);
        }
        self.upsert(record)
    }

    fn get(&self, incident_id: &str) -> Option<IncidentRecord> {
        self.records.lock().get(incident_id).cloned()
    }

    fn list(&self, query: &IncidentQuery) -> IncidentPage {
        let records: Vec<IncidentRecord> = self.records.lock().values().cloned().collect();
        paginate(records.into_iter(), query)
    }

    fn delete(&self, incident_id: &str) -> Result<bool> {
        let mut records = self.records.lock();
        let Some(record) = records.remove(incident_id) else {
            return Ok(false);
        };
        self.save(&records)?;
        drop(records);

        remove_screenshot(&record);
        info!("Deleted incident: {}", incident_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::record::IncidentStatus;
    use crate::types::BBox;
    use std::collections::BTreeMap;

    fn record(id: &str, timestamp: f64) -> IncidentRecord {
        IncidentRecord {
            incident_id: id.to_string(),
            camera_id: "cam".to_string(),
            frame_id: 1,
            timestamp,
            overlap_ratio: 0.95,
            bbox: BBox::new(0, 0, 10, 10),
            screenshot_path: String::new(),
            status: IncidentStatus::EnrichmentPending,
            summary: None,
            confidence: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_list_is_newest_first_and_paginated() {
        let store = MemoryIncidentStore::new();
        for (i, ts) in [10.0, 30.0, 20.0, 40.0, 50.0].iter().enumerate() {
            store.create(&record(&format!("i{}", i), *ts)).unwrap();
        }

        let page = store.list(&IncidentQuery {
            page: 1,
            limit: 2,
            ..Default::default()
        });
        assert_eq!(page.total, 5);
        let ts: Vec<f64> = page.incidents.iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![50.0, 40.0]);

        let page = store.list(&IncidentQuery {
            page: 3,
            limit: 2,
            ..Default::default()
        });
        assert_eq!(page.incidents.len(), 1);
        assert_eq!(page.incidents[0].timestamp, 10.0);
    }

    #[test]
    fn test_list_filters_time_range() {
        let store = MemoryIncidentStore::new();
        for (i, ts) in [10.0, 20.0, 30.0].iter().enumerate() {
            store.create(&record(&format!("i{}", i), *ts)).unwrap();
        }
        let page = store.list(&IncidentQuery {
            start: Some(15.0),
            end: Some(30.0),
            ..Default::default()
        });
        assert_eq!(page.total, 2);
        assert_eq!(page.incidents[0].timestamp, 30.0);
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonIncidentStore::open(dir.path()).unwrap();
            let mut r = record("abc", 1.0);
            store.create(&r).unwrap();
            r.status = IncidentStatus::EnrichmentSkipped;
            store.update(&r).unwrap();
        }
        let store = JsonIncidentStore::open(dir.path()).unwrap();
        let r = store.get("abc").unwrap();
        assert_eq!(r.status, IncidentStatus::EnrichmentSkipped);
    }

    #[test]
    fn test_delete_removes_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let shot = dir.path().join("abc.png");
        fs::write(&shot, b"png").unwrap();

        let store = JsonIncidentStore::open(dir.path()).unwrap();
        let mut r = record("abc", 1.0);
        r.screenshot_path = shot.to_string_lossy().into_owned();
        store.create(&r).unwrap();
        assert_eq!(store.screenshot_path("abc"), Some(shot.clone()));

        assert!(store.delete("abc").unwrap());
        assert!(!shot.exists());
        assert!(store.get("abc").is_none());
        assert!(!store.delete("abc").unwrap());
    }

    #[test]
    fn test_malformed_metadata_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(METADATA_FILE), "{not json").unwrap();
        let store = JsonIncidentStore::open(dir.path()).unwrap();
        assert_eq!(store.list(&IncidentQuery::default()).total, 0);
    }
}
