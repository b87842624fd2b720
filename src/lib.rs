// src/lib.rs
//
// Water-hazard watch: per-frame person/hazard overlap, a timed warning,
// one incident per danger episode with background enrichment and
// notification, and a realtime feed for observers.

pub mod clock;
pub mod config;
pub mod detection;
pub mod enrichment;
pub mod error;
pub mod incident;
pub mod notification;
pub mod pipeline;
pub mod realtime;
pub mod session;
pub mod types;
