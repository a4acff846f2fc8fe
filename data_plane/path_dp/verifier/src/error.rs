//! Error types for the verifier service.

use policy_engine::PolicyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("invalid configuration for {key}: {reason}")]
    Config { key: String, reason: String },

    #[error("recorder error: {0}")]
    Recorder(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("report queue is closed")]
    QueueClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VerifierError {
    pub(crate) fn config(key: &str, reason: impl Into<String>) -> Self {
        VerifierError::Config {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VerifierError>;
