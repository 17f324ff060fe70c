//! Error types for the language-model features

use aquabot_auth::ExecutionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AiError {
    /// The credential layer could not produce a successful response.
    #[error("Request failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response format: {0}")]
    InvalidFormat(String),

    #[error("LLM error: {0}")]
    Llm(String),
}

impl AiError {
    /// True when the failure came from credential rotation or its retry bound.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, AiError::Execution(_))
    }
}

/// Result type alias for AI operations
pub type Result<T> = std::result::Result<T, AiError>;
