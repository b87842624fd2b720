// src/notification/email.rs
//
// SMTP incident mail: HTML summary plus the screenshot as a PNG
// attachment. Port 465 with TLS uses implicit TLS, other TLS ports
// upgrade with STARTTLS.

use super::NotificationDispatcher;
use crate::config::EmailConfig;
use crate::incident::IncidentRecord;

use anyhow::{Context, Result};
use chrono::DateTime;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::fs;
use std::path::Path;
use tracing::{error, info};

const FALLBACK_SUMMARY: &str =
    "Visual analysis unavailable; key detection details are listed below.";
const PLAIN_TEXT_BODY: &str = "Please use an HTML-capable mail client to view this alert.";

pub struct EmailNotifier {
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    pub fn subject(incident: &IncidentRecord) -> String {
        format!(
            "Drowning alert - {} - {:.0}",
            incident.camera_id, incident.timestamp
        )
    }

    pub fn html_body(incident: &IncidentRecord) -> String {
        let summary = incident
            .summary
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(FALLBACK_SUMMARY);
        let confidence = incident
            .confidence
            .map(|c| format!("{:.2}", c))
            .unwrap_or_else(|| "N/A".to_string());
        let screenshot = Path::new(&incident.screenshot_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "none".to_string());

        format!(
            "<h2>Drowning alert</h2>\n\
             <p><strong>Time:</strong> {}</p>\n\
             <p><strong>Camera:</strong> {}</p>\n\
             <p><strong>Frame:</strong> {}</p>\n\
             <p><strong>Overlap ratio:</strong> {:.2}</p>\n\
             <p><strong>Confidence:</strong> {}</p>\n\
             <p><strong>Summary:</strong> {}</p>\n\
             <p><strong>BBox:</strong> {}</p>\n\
             <p><strong>Screenshot:</strong> {}</p>\n",
            format_time(incident.timestamp),
            escape_html(&incident.camera_id),
            incident.frame_id,
            incident.overlap_ratio,
            confidence,
            escape_html(summary),
            incident.bbox,
            escape_html(&screenshot),
        )
    }

    pub fn build_message(&self, incident: &IncidentRecord) -> Result<Message> {
        let from: Mailbox = self
            .config
            .sender
            .parse()
            .with_context(|| format!("Invalid sender address: {}", self.config.sender))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(Self::subject(incident));
        for recipient in &self.config.recipients {
            let to: Mailbox = recipient
                .parse()
                .with_context(|| format!("Invalid recipient address: {}", recipient))?;
            builder = builder.to(to);
        }

        let mut body = MultiPart::mixed().multipart(MultiPart::alternative_plain_html(
            PLAIN_TEXT_BODY.to_string(),
            Self::html_body(incident),
        ));

        let screenshot = Path::new(&incident.screenshot_path);
        if !incident.screenshot_path.is_empty() && screenshot.exists() {
            let bytes = fs::read(screenshot)
                .with_context(|| format!("Failed to read {}", screenshot.display()))?;
            let filename = screenshot
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{}.png", incident.incident_id));
            let content_type = ContentType::parse("image/png")?;
            body = body.singlepart(Attachment::new(filename).body(bytes, content_type));
        }

        let message = builder.multipart(body).context("Failed to build email")?;
        Ok(message)
    }

    fn transport(&self) -> Result<SmtpTransport> {
        let credentials =
            Credentials::new(self.config.username.clone(), self.config.password.clone());
        let host = self.config.smtp_server.as_str();

        let builder = if self.config.use_tls && self.config.smtp_port == 465 {
            SmtpTransport::relay(host)?
        } else if self.config.use_tls {
            SmtpTransport::starttls_relay(host)?
        } else {
            SmtpTransport::builder_dangerous(host)
        };

        Ok(builder
            .port(self.config.smtp_port)
            .credentials(credentials)
            .build())
    }

    fn try_send(&self, incident: &IncidentRecord) -> Result<()> {
        let message = self.build_message(incident)?;
        let mailer = self.transport()?;
        mailer.send(&message).context("SMTP send failed")?;
        Ok(())
    }
}

impl NotificationDispatcher for EmailNotifier {
    fn send(&self, incident: &IncidentRecord) -> bool {
        if !self.config.enabled() {
            info!(
                "📧 Email config incomplete; skipping send for incident {}",
                incident.incident_id
            );
            return false;
        }

        match self.try_send(incident) {
            Ok(()) => {
                info!(
                    "📧 Alert email sent to {} for incident {}",
                    self.config.recipients.join(", "),
                    incident.incident_id
                );
                true
            }
            Err(e) => {
                error!(
                    "📧 Email sending failed (incident {}): {:#}",
                    incident.incident_id, e
                );
                false
            }
        }
    }
}

/// UTC wall time for an epoch timestamp, or the raw seconds if out of range.
pub fn format_time(timestamp: f64) -> String {
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("{:.0}", timestamp))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::IncidentStatus;
    use crate::types::BBox;
    use std::collections::BTreeMap;

    fn config() -> EmailConfig {
        EmailConfig {
            smtp_server: "smtp.example.com".into(),
            smtp_port: 465,
            username: "bot".into(),
            password: "secret".into(),
            sender: "Pool Watch <bot@example.com>".into(),
            recipients: vec!["ops@example.com".into(), "guard@example.com".into()],
            use_tls: true,
        }
    }

    fn incident(screenshot_path: String) -> IncidentRecord {
        IncidentRecord {
            incident_id: "abc123".into(),
            camera_id: "pool.mp4".into(),
            frame_id: 42,
            timestamp: 1_700_000_000.4,
            overlap_ratio: 0.934,
            bbox: BBox::new(1, 2, 30, 40),
            screenshot_path,
            status: IncidentStatus::EnrichmentCompleted,
            summary: None,
            confidence: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_subject_and_body_fallbacks() {
        let record = incident(String::new());
        assert_eq!(
            EmailNotifier::subject(&record),
            "Drowning alert - pool.mp4 - 1700000000"
        );

        let html = EmailNotifier::html_body(&record);
        assert!(html.contains("<strong>Confidence:</strong> N/A"));
        assert!(html.contains(FALLBACK_SUMMARY));
        assert!(html.contains("<strong>Overlap ratio:</strong> 0.93"));
        assert!(html.contains("(1, 2, 30, 40)"));
        assert!(html.contains("<strong>Screenshot:</strong> none"));
        assert!(html.contains("<strong>Time:</strong> 2023-11-14 22:13:20 UTC"));
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_time(1_700_000_000.9), "2023-11-14 22:13:20 UTC");
        assert_eq!(format_time(1e30), "1000000000000000019884624838656");
    }

    #[test]
    fn test_body_escapes_summary() {
        let mut record = incident(String::new());
        record.summary = Some("child <near> deep end & alone".into());
        record.confidence = Some(0.8);
        let html = EmailNotifier::html_body(&record);
        assert!(html.contains("child &lt;near&gt; deep end &amp; alone"));
        assert!(html.contains("<strong>Confidence:</strong> 0.80"));
    }

    #[test]
    fn test_message_attaches_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let shot = dir.path().join("abc123.png");
        fs::write(&shot, b"\x89PNG fake").unwrap();

        let notifier = EmailNotifier::new(config());
        let message = notifier
            .build_message(&incident(shot.to_string_lossy().into_owned()))
            .unwrap();
        let raw = String::from_utf8_lossy(&message.formatted()).into_owned();

        assert!(raw.contains("Subject: Drowning alert - pool.mp4"));
        assert!(raw.contains("ops@example.com"));
        assert!(raw.contains("guard@example.com"));
        assert!(raw.contains("abc123.png"));
        assert!(raw.contains("image/png"));
    }

    #[test]
    fn test_invalid_recipient_fails_to_build() {
        let mut cfg = config();
        cfg.recipients = vec!["not an address".into()];
        let notifier = EmailNotifier::new(cfg);
        assert!(notifier.build_message(&incident(String::new())).is_err());
    }

    #[test]
    fn test_disabled_config_reports_failure() {
        let mut cfg = config();
        cfg.password.clear();
        let notifier = EmailNotifier::new(cfg);
        assert!(!notifier.send(&incident(String::new())));
    }
}
