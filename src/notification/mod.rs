// src/notification/mod.rs

pub mod email;

pub use email::EmailNotifier;

use crate::config::EmailConfig;
use crate::incident::IncidentRecord;
use std::sync::Arc;
use tracing::info;

/// Best-effort delivery of a finished incident. A `false` return leaves
/// the incident status untouched; nothing is retried.
pub trait NotificationDispatcher: Send + Sync {
    fn send(&self, incident: &IncidentRecord) -> bool;
}

/// Used when no mail server is configured. Logs and reports failure so
/// incidents are never marked notified without a real delivery.
#[derive(Debug, Default)]
pub struct LogOnlyNotifier;

impl NotificationDispatcher for LogOnlyNotifier {
    fn send(&self, incident: &IncidentRecord) -> bool {
        info!(
            "📧 Email not configured; incident {} ({}) not sent",
            incident.incident_id, incident.status
        );
        false
    }
}

pub fn build_notifier(config: &EmailConfig) -> Arc<dyn NotificationDispatcher> {
    if config.enabled() {
        info!(
            "📧 Email notifications via {}:{} to {} recipient(s)",
            config.smtp_server,
            config.smtp_port,
            config.recipients.len()
        );
        Arc::new(EmailNotifier::new(config.clone()))
    } else {
        info!("📧 Email notifications disabled");
        Arc::new(LogOnlyNotifier)
    }
}
