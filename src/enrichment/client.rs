// src/enrichment/client.rs
//
// Blocking HTTP client for the vision providers. Runs on the enrichment
// worker thread only, never on the frame loop.

use super::provider::{compose_prompt, ProviderKind, VisionProvider};
use super::task::EnrichmentResponse;
use crate::config::EnrichmentConfig;
use crate::error::EnrichmentError;

use anyhow::{Context, Result};
use base64::Engine;
use image::{ImageFormat, RgbImage};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Anything that can turn an image and a prompt into a summary.
pub trait VisionAnalyzer: Send + Sync {
    fn analyze(
        &self,
        image: &RgbImage,
        prompt: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<EnrichmentResponse, EnrichmentError>;
}

pub struct EnrichmentClient {
    kind: ProviderKind,
    provider: Box<dyn VisionProvider>,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
    backoff: Duration,
    http_client: reqwest::blocking::Client,
}

impl EnrichmentClient {
    /// Ok(None) when no provider is configured.
    pub fn from_config(config: &EnrichmentConfig) -> Result<Option<Self>> {
        if !config.enabled() {
            return Ok(None);
        }
        let kind: ProviderKind = config
            .provider
            .as_deref()
            .unwrap_or_default()
            .parse()?;

        let api_key = config.api_key.clone().filter(|k| !k.is_empty());
        if kind.requires_api_key() && api_key.is_none() {
            anyhow::bail!("VLM provider {} requires an API key", kind);
        }

        let endpoint = config
            .base_url
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| kind.default_endpoint().to_string());

        let http_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_secs.max(0.1)))
            .build()
            .context("Failed to build HTTP client")?;

        info!(
            "🌐 Enrichment provider: {} (model={}, endpoint={})",
            kind, config.model, endpoint
        );

        Ok(Some(Self {
            kind,
            provider: kind.provider(),
            endpoint,
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
            backoff: RETRY_BACKOFF,
            http_client,
        }))
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Local providers get no Authorization header even if a key is set.
    fn request(&self, payload: &Value) -> reqwest::blocking::RequestBuilder {
        let request = self.http_client.post(&self.endpoint).json(payload);
        match &self.api_key {
            Some(key) if self.kind.requires_api_key() => request.bearer_auth(key),
            _ => request,
        }
    }

    fn post(&self, payload: &Value) -> Result<Value, EnrichmentError> {
        let response = self
            .request(payload)
            .send().map_err(EnrichmentError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_else(|_| "<no body>".to_string());
            return Err(EnrichmentError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Value>()
            .map_err(|e| EnrichmentError::InvalidResponse(e.to_string()))
    }
}

impl VisionAnalyzer for EnrichmentClient {
    fn analyze(
        &self,
        image: &RgbImage,
        prompt: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<EnrichmentResponse, EnrichmentError> {
        let image_b64 = encode_png_base64(image)?;
        let prompt = compose_prompt(prompt, metadata);
        let payload = self.provider.build_payload(&self.model, &prompt, &image_b64);

        let raw = with_retries(self.max_retries, self.backoff, |attempt| {
            debug!("🌐 {} request attempt {}", self.kind, attempt);
            self.post(&payload)
        })?;

        if let Some(usage) = raw.get("usage") {
            debug!("🌐 {} token usage: {}", self.kind, usage);
        }

        let (summary, confidence) = self.provider.parse_response(&raw)?;
        Ok(EnrichmentResponse {
            summary,
            confidence,
            raw,
        })
    }
}

/// Run `op` up to `max_retries + 1` times. Only transient errors are
/// retried; anything else is returned as-is on the spot.
pub fn with_retries<T, F>(max_retries: u32, backoff: Duration, mut op: F) -> Result<T, EnrichmentError>
where
    F: FnMut(u32) -> Result<T, EnrichmentError>,
{
    let attempts = max_retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= attempts => {
                return Err(EnrichmentError::RetriesExhausted {
                    attempts,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                warn!("🌐 Attempt {}/{} failed: {}", attempt, attempts, e);
                if !backoff.is_zero() {
                    thread::sleep(backoff * attempt);
                }
                attempt += 1;
            }
        }
    }
}

pub fn encode_png_base64(image: &RgbImage) -> Result<String, EnrichmentError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| EnrichmentError::Encode(e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf.into_inner()))
}
