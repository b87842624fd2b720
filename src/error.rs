// src/error.rs
//
// Classified errors for operations whose callers branch on the failure
// kind. Everything else is plumbing and travels as `anyhow::Error`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Detection session already in progress ({session_id})")]
    Conflict { session_id: String },

    #[error("No active detection session")]
    NotFound,

    #[error("Video file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Failed to open {target}: {reason}")]
    SourceUnavailable { target: String, reason: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Error)]
pub enum EnrichmentError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<EnrichmentError>,
    },
}

impl EnrichmentError {
    /// Only network-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Rejected {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EnrichmentError::Timeout("t".into()).is_transient());
        assert!(EnrichmentError::Transport("t".into()).is_transient());
        assert!(!EnrichmentError::Rejected {
            status: 401,
            body: "unauthorized".into()
        }
        .is_transient());
        assert!(!EnrichmentError::InvalidResponse("x".into()).is_transient());
    }

    #[test]
    fn test_exhausted_message_names_last_error() {
        let err = EnrichmentError::RetriesExhausted {
            attempts: 3,
            last: Box::new(EnrichmentError::Timeout("deadline".into())),
        };
        assert_eq!(
            err.to_string(),
            "request failed after 3 attempts: request timed out: deadline"
        );
    }
}
