//! Error types for the credential lifecycle

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failure reading or writing the persisted config file.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a single account failed to produce a credential.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("No credential could be extracted: {0}")]
    ExtractionFailure(String),

    #[error("Attempt timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}

impl AttemptError {
    /// Classify a free-form failure message from a provisioning backend.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
        {
            AttemptError::RateLimited(message)
        } else {
            AttemptError::Other(message)
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AttemptError::RateLimited(_))
    }
}

/// Outcome of a failed mint, shared by every caller of the same rotation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("No provisioning accounts configured")]
    NoAccounts,

    #[error("All {attempted} provisioning accounts failed; last error from {last_account}: {last}")]
    AccountsExhausted {
        attempted: usize,
        last_account: String,
        last: AttemptError,
        /// First failure that was not a rate limit, kept for reporting.
        first_other: Option<(String, AttemptError)>,
    },

    #[error("Rotation task aborted: {0}")]
    Aborted(String),
}

/// Failure of one outbound call to the protected API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    Status { status: u16, message: String },
    Transport(String),
}

impl CallFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            CallFailure::Status { status, .. } => Some(*status),
            CallFailure::Transport(_) => None,
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Status { status, message } if message.is_empty() => {
                write!(f, "HTTP {}", status)
            }
            CallFailure::Status { status, message } => write!(f, "HTTP {}: {}", status, message),
            CallFailure::Transport(message) => write!(f, "transport error: {}", message),
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Request still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: CallFailure },

    #[error("Credential rotation failed: {0}")]
    Rotation(#[from] ProvisioningError),
}
