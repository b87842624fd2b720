// src/enrichment/mod.rs

pub mod client;
pub mod provider;
pub mod queue;
pub mod task;

pub use client::{EnrichmentClient, VisionAnalyzer};
pub use provider::ProviderKind;
pub use queue::{EnrichmentQueue, QueueStatsSnapshot};
pub use task::{EnrichmentResponse, EnrichmentResult, EnrichmentTask};
