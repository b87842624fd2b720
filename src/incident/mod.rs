// src/incident/mod.rs

pub mod lifecycle;
pub mod manager;
pub mod record;
pub mod store;

pub use lifecycle::IncidentLifecycle;
pub use manager::{IncidentManager, NewIncident};
pub use record::{IncidentRecord, IncidentStatus};
pub use store::{IncidentPage, IncidentQuery, IncidentStore, JsonIncidentStore, MemoryIncidentStore};
