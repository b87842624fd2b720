// src/enrichment/provider.rs
//
// Request/response shapes of the supported vision providers. Every
// provider reduces its answer to `(summary, confidence)`; the HTTP work
// lives in the client.

use crate::error::EnrichmentError;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const SYSTEM_PROMPT: &str =
    "You are a safety monitoring assistant. Describe potential drowning risks in the image.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Moonshot,
    Qwen,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Moonshot => "moonshot",
            Self::Qwen => "qwen",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1/chat/completions",
            Self::Moonshot => "https://api.moonshot.cn/v1/chat/completions",
            Self::Qwen => {
                "https://dashscope.aliyuncs.com/api/v1/services/aigc/multimodal-generation/generate"
            }
            Self::Ollama => "http://localhost:11434/api/generate",
        }
    }

    /// Local providers take no bearer token.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama)
    }

    pub fn provider(&self) -> Box<dyn VisionProvider> {
        match self {
            Self::OpenAi | Self::Moonshot => Box::new(ChatCompletionsProvider),
            Self::Qwen => Box::new(QwenProvider),
            Self::Ollama => Box::new(OllamaProvider),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "moonshot" => Ok(Self::Moonshot),
            "qwen" => Ok(Self::Qwen),
            "ollama" => Ok(Self::Ollama),
            other => anyhow::bail!("Unsupported VLM provider: {}", other),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire format of one provider family.
pub trait VisionProvider: Send + Sync {
    /// `image_b64` is a base64 PNG without the data-URL prefix.
    fn build_payload(&self, model: &str, prompt: &str, image_b64: &str) -> Value;

    fn parse_response(&self, body: &Value) -> Result<(String, f32), EnrichmentError>;
}

/// `template`, followed by a `Context:` line listing the metadata.
pub fn compose_prompt(template: &str, metadata: &BTreeMap<String, String>) -> String {
    if metadata.is_empty() {
        return template.to_string();
    }
    let context = metadata
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{}\n\nContext: {}", template, context)
}

fn clamp_confidence(value: f64) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0) as f32
    } else {
        0.0
    }
}

/// Message content is either a plain string or a list of typed parts.
fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let text: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then(|| text.join("\n"))
        }
        _ => None,
    }
}

// ============================================================================
// OPENAI-COMPATIBLE CHAT COMPLETIONS (OpenAI, Moonshot)
// ============================================================================

pub struct ChatCompletionsProvider;

impl VisionProvider for ChatCompletionsProvider {
    fn build_payload(&self, model: &str, prompt: &str, image_b64: &str) -> Value {
        json!({
            "model": model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": prompt },
                        {
                            "type": "image_url",
                            "image_url": { "url": format!("data:image/png;base64,{}", image_b64) }
                        }
                    ]
                }
            ],
            "temperature": 0.2
        })
    }

    fn parse_response(&self, body: &Value) -> Result<(String, f32), EnrichmentError> {
        let summary = body
            .pointer("/choices/0/message/content")
            .and_then(content_text)
            .ok_or_else(|| {
                EnrichmentError::InvalidResponse("missing choices[0].message.content".into())
            })?;
        // No native score; completion length stands in for it.
        let tokens = body
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        Ok((summary.trim().to_string(), clamp_confidence(tokens / 100.0)))
    }
}

// ============================================================================
// QWEN (DashScope multimodal generation)
// ============================================================================

pub struct QwenProvider;

impl VisionProvider for QwenProvider {
    fn build_payload(&self, model: &str, prompt: &str, image_b64: &str) -> Value {
        json!({
            "model": model,
            "input": [{
                "role": "user",
                "content": [
                    { "text": prompt },
                    { "image": { "format": "png", "data": image_b64 } }
                ]
            }],
            "parameters": { "result_format": "message" }
        })
    }

    fn parse_response(&self, body: &Value) -> Result<(String, f32), EnrichmentError> {
        let output = body
            .get("output")
            .ok_or_else(|| EnrichmentError::InvalidResponse("missing output".into()))?;
        let summary = output
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                output
                    .pointer("/choices/0/message/content")
                    .and_then(content_text)
            })
            .ok_or_else(|| EnrichmentError::InvalidResponse("missing output text".into()))?;
        let confidence = output
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        Ok((summary.trim().to_string(), clamp_confidence(confidence)))
    }
}

// ============================================================================
// OLLAMA (local generate API)
// ============================================================================

pub struct OllamaProvider;

impl VisionProvider for OllamaProvider {
    fn build_payload(&self, model: &str, prompt: &str, image_b64: &str) -> Value {
        json!({
            "model": model,
            "prompt": prompt,
            "images": [image_b64],
            "stream": false
        })
    }

    fn parse_response(&self, body: &Value) -> Result<(String, f32), EnrichmentError> {
        let summary = body
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| EnrichmentError::InvalidResponse("missing response".into()))?;
        let confidence = body
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        Ok((summary.trim().to_string(), clamp_confidence(confidence)))
    }
}
