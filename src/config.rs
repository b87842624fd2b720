// src/config.rs
//
// YAML settings with environment overrides. Every section has defaults so
// a missing file still yields a runnable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::detection::overlap::DEFAULT_DANGER_THRESHOLD;
use crate::detection::state_machine::{
    DEFAULT_DETECTION_WINDOW_SECS, DEFAULT_WARNING_DURATION_SECS,
};

pub const DEFAULT_CONFIG_PATH: &str = "config/settings.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub incident_output_dir: String,
    pub danger: DangerConfig,
    pub email: EmailConfig,
    pub enrichment: EnrichmentConfig,
    pub realtime: RealtimeConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            incident_output_dir: "output/incidents".to_string(),
            danger: DangerConfig::default(),
            email: EmailConfig::default(),
            enrichment: EnrichmentConfig::default(),
            realtime: RealtimeConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DangerConfig {
    pub overlap_threshold: f32,
    pub warning_duration_secs: f64,
    pub detection_window_secs: f64,
}

impl Default for DangerConfig {
    fn default() -> Self {
        Self {
            overlap_threshold: DEFAULT_DANGER_THRESHOLD,
            warning_duration_secs: DEFAULT_WARNING_DURATION_SECS,
            detection_window_secs: DEFAULT_DETECTION_WINDOW_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub use_tls: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_server: String::new(),
            smtp_port: 465,
            username: String::new(),
            password: String::new(),
            sender: String::new(),
            recipients: Vec::new(),
            use_tls: true,
        }
    }
}

impl EmailConfig {
    pub fn enabled(&self) -> bool {
        !self.smtp_server.is_empty()
            && !self.username.is_empty()
            && !self.password.is_empty()
            && !self.sender.is_empty()
            && !self.recipients.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// openai | moonshot | qwen | ollama. Unset disables enrichment.
    pub provider: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub prompt_template: String,
    pub timeout_secs: f64,
    pub max_retries: u32,
    pub queue_capacity: usize,
    pub stop_timeout_secs: f64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            base_url: None,
            prompt_template:
                "Describe the drowning risk in the image, the person's position and the surroundings."
                    .to_string(),
            timeout_secs: 15.0,
            max_retries: 2,
            queue_capacity: 32,
            stop_timeout_secs: 1.0,
        }
    }
}

impl EnrichmentConfig {
    pub fn enabled(&self) -> bool {
        match self.provider.as_deref() {
            None | Some("") => false,
            Some(p) if p.eq_ignore_ascii_case("ollama") => true,
            Some(_) => self.api_key.as_deref().is_some_and(|k| !k.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Minimum spacing between frame previews sent to observers.
    pub frame_interval_secs: f64,
    pub max_frame_width: u32,
    pub jpeg_quality: u8,
    /// Per-observer mailbox size.
    pub observer_buffer: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            frame_interval_secs: 0.2,
            max_frame_width: 640,
            jpeg_quality: 70,
            observer_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub stop_timeout_secs: f64,
    pub camera_settle_ms: u64,
    pub fps_update_interval_secs: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 3.0,
            camera_settle_ms: 300,
            fps_update_interval_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "hazard_watch=info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load YAML (missing file = defaults) and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::from_yaml(&contents)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AppConfig =
            serde_yaml::from_str(contents).context("Failed to parse settings YAML")?;
        Ok(config)
    }

    /// `lookup` maps an environment variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let email = &mut self.email;
        if let Some(v) = lookup("EMAIL_SMTP_SERVER") {
            email.smtp_server = v;
        }
        if let Some(v) = lookup("EMAIL_SMTP_PORT") {
            email.smtp_port = v.parse().context("EMAIL_SMTP_PORT must be a port number")?;
        }
        if let Some(v) = lookup("EMAIL_USERNAME") {
            email.username = v;
        }
        if let Some(v) = lookup("EMAIL_PASSWORD") {
            email.password = v;
        }
        if let Some(v) = lookup("EMAIL_SENDER") {
            email.sender = v;
        }
        if let Some(v) = lookup("EMAIL_RECIPIENTS") {
            email.recipients = split_list(&v);
        }
        if let Some(v) = lookup("EMAIL_USE_TLS") {
            email.use_tls = v.eq_ignore_ascii_case("true");
        }

        let enrichment = &mut self.enrichment;
        if let Some(v) = lookup("VLM_PROVIDER") {
            enrichment.provider = Some(v);
        }
        if let Some(v) = lookup("VLM_MODEL") {
            enrichment.model = v;
        }
        if let Some(v) = lookup("VLM_API_KEY") {
            enrichment.api_key = Some(v);
        }
        if let Some(v) = lookup("VLM_BASE_URL") {
            enrichment.base_url = Some(v);
        }
        if let Some(v) = lookup("VLM_PROMPT_TEMPLATE") {
            enrichment.prompt_template = v;
        }
        if let Some(v) = lookup("VLM_TIMEOUT") {
            enrichment.timeout_secs = v.parse().context("VLM_TIMEOUT must be a number")?;
        }
        if let Some(v) = lookup("VLM_MAX_RETRIES") {
            enrichment.max_retries = v.parse().context("VLM_MAX_RETRIES must be an integer")?;
        }

        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("INCIDENT_OUTPUT_DIR") {
            self.incident_output_dir = v;
        }
        Ok(())
    }

    /// Copy safe to log: credentials replaced.
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        if !masked.email.password.is_empty() {
            masked.email.password = "***".to_string();
        }
        if masked.enrichment.api_key.is_some() {
            masked.enrichment.api_key = Some("***".to_string());
        }
        masked
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config = AppConfig::from_yaml("").unwrap();
        assert_eq!(config.danger.overlap_threshold, 0.90);
        assert_eq!(config.danger.warning_duration_secs, 15.0);
        assert_eq!(config.danger.detection_window_secs, 30.0);
        assert_eq!(config.enrichment.queue_capacity, 32);
        assert_eq!(config.session.stop_timeout_secs, 3.0);
        assert!(!config.email.enabled());
        assert!(!config.enrichment.enabled());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = r#"
incident_output_dir: /tmp/incidents
enrichment:
  provider: ollama
  model: llava
email:
  smtp_server: smtp.example.com
  username: bot
  password: secret
  sender: bot@example.com
  recipients: [ops@example.com]
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.incident_output_dir, "/tmp/incidents");
        assert_eq!(config.enrichment.model, "llava");
        assert_eq!(config.enrichment.max_retries, 2);
        assert!(config.enrichment.enabled());
        assert!(config.email.enabled());
    }

    #[test]
    fn test_remote_provider_needs_api_key() {
        let mut enrichment = EnrichmentConfig {
            provider: Some("openai".into()),
            ..Default::default()
        };
        assert!(!enrichment.enabled());
        enrichment.api_key = Some("sk-test".into());
        assert!(enrichment.enabled());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("EMAIL_RECIPIENTS", "a@x.com, b@x.com,,"),
            ("EMAIL_SMTP_PORT", "587"),
            ("EMAIL_USE_TLS", "False"),
            ("VLM_PROVIDER", "qwen"),
            ("VLM_TIMEOUT", "7.5"),
            ("INCIDENT_OUTPUT_DIR", "/data/incidents"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.email.recipients, vec!["a@x.com", "b@x.com"]);
        assert_eq!(config.email.smtp_port, 587);
        assert!(!config.email.use_tls);
        assert_eq!(config.enrichment.provider.as_deref(), Some("qwen"));
        assert_eq!(config.enrichment.timeout_secs, 7.5);
        assert_eq!(config.incident_output_dir, "/data/incidents");
    }

    #[test]
    fn test_bad_numeric_override_is_an_error() {
        let mut config = AppConfig::default();
        assert!(config
            .apply_overrides(|k| (k == "VLM_MAX_RETRIES").then(|| "many".to_string()))
            .is_err());
    }

    #[test]
    fn test_masked_hides_secrets() {
        let mut config = AppConfig::default();
        config.email.password = "hunter2".into();
        config.enrichment.api_key = Some("sk-live".into());

        let masked = config.masked();
        assert_eq!(masked.email.password, "***");
        assert_eq!(masked.enrichment.api_key.as_deref(), Some("***"));
        assert_eq!(config.email.password, "hunter2");
    }
}
