//! Core types for the credential lifecycle
//!
//! Defines the bearer credential, provisioning accounts and rotation triggers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Literal prefix every accepted credential starts with.
pub const CREDENTIAL_PREFIX: &str = "sk-or-v1-";

static CREDENTIAL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sk-or-v1-[A-Za-z0-9]+$").expect("Invalid regex"));

static CREDENTIAL_SEARCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sk-or-v1-[A-Za-z0-9]+").expect("Invalid regex"));

/// Check a raw value against the credential pattern.
pub fn is_valid_credential(value: &str) -> bool {
    CREDENTIAL_PATTERN.is_match(value)
}

/// Find the last credential-shaped token in backend output.
///
/// Provisioning pages may show older keys above the fresh one, so the last
/// match wins.
pub fn find_credential(text: &str) -> Option<&str> {
    CREDENTIAL_SEARCH.find_iter(text).last().map(|m| m.as_str())
}

/// Bearer credential for the protected API. Superseded, never mutated.
///
/// Deserialization goes through the same pattern check as [`Credential::parse`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CredentialRecord")]
pub struct Credential {
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    minted_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct CredentialRecord {
    value: String,
    #[serde(default)]
    source_account_id: Option<String>,
    #[serde(default)]
    minted_at: Option<DateTime<Utc>>,
}

impl TryFrom<CredentialRecord> for Credential {
    type Error = String;

    fn try_from(record: CredentialRecord) -> Result<Self, Self::Error> {
        let credential = Credential::parse(record.value)
            .ok_or_else(|| format!("value does not match {}<alphanumerics>", CREDENTIAL_PREFIX))?;
        Ok(Self {
            source_account_id: record.source_account_id,
            minted_at: record.minted_at,
            ..credential
        })
    }
}

impl Credential {
    /// Accept a value of unknown origin, e.g. read back from the store.
    pub fn parse(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let value = value.trim();
        if !is_valid_credential(value) {
            return None;
        }
        Some(Self {
            value: value.to_string(),
            source_account_id: None,
            minted_at: None,
        })
    }

    /// Accept a value freshly minted by `account_id`.
    pub fn minted(value: impl Into<String>, account_id: impl Into<String>) -> Option<Self> {
        Self::parse(value).map(|credential| Self {
            source_account_id: Some(account_id.into()),
            minted_at: Some(Utc::now()),
            ..credential
        })
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn source_account_id(&self) -> Option<&str> {
        self.source_account_id.as_deref()
    }

    pub fn minted_at(&self) -> Option<DateTime<Utc>> {
        self.minted_at
    }

    /// Display-safe rendering.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.value.chars().collect();
        if chars.len() <= 8 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &self.masked())
            .field("source_account_id", &self.source_account_id)
            .field("minted_at", &self.minted_at)
            .finish()
    }
}

/// One provisioning identity on the account ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProfile {
    pub account_id: String,
    /// Lower values are tried first.
    #[serde(default)]
    pub priority: i32,
    /// Where this account's opaque session state is persisted.
    pub session_file: PathBuf,
}

impl AccountProfile {
    pub fn new(account_id: impl Into<String>, priority: i32, session_file: impl Into<PathBuf>) -> Self {
        Self {
            account_id: account_id.into(),
            priority,
            session_file: session_file.into(),
        }
    }

    /// Read the persisted session state. A missing or empty file means the
    /// account has never logged in.
    pub async fn load_session(&self) -> std::io::Result<Option<String>> {
        match tokio::fs::read_to_string(&self.session_file).await {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Persist freshly captured session state.
    pub async fn save_session(&self, state: &str) -> std::io::Result<()> {
        write_atomic(&self.session_file, state).await
    }
}

/// Classification of the failure that made a caller ask for a new credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    /// No credential cached yet.
    Missing,
    /// 401 from the protected API.
    InvalidCredential,
    /// 429 from the protected API.
    RateLimited,
    /// Any other failure status.
    UpstreamStatus(u16),
    /// Network or protocol failure before a status was seen.
    Transport,
    /// Operator-requested rotation.
    Manual,
}

impl RotationTrigger {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => RotationTrigger::InvalidCredential,
            429 => RotationTrigger::RateLimited,
            other => RotationTrigger::UpstreamStatus(other),
        }
    }
}

impl fmt::Display for RotationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationTrigger::Missing => write!(f, "missing"),
            RotationTrigger::InvalidCredential => write!(f, "invalid_credential"),
            RotationTrigger::RateLimited => write!(f, "rate_limited"),
            RotationTrigger::UpstreamStatus(status) => write!(f, "upstream_status_{}", status),
            RotationTrigger::Transport => write!(f, "transport"),
            RotationTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// Write `content` to a sibling temp file and rename it over `path`, so a
/// crash never leaves a half-written file behind. An existing file's
/// permissions carry over to the replacement.
pub(crate) async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "store".to_string());
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let permissions = match tokio::fs::metadata(path).await {
        Ok(metadata) => Some(metadata.permissions()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
        Err(error) => return Err(error),
    };

    if let Err(error) = tokio::fs::write(&temp_path, content).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(error);
    }
    if let Some(permissions) = permissions
        && let Err(error) = tokio::fs::set_permissions(&temp_path, permissions).await
    {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(error);
    }
    if let Err(error) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(error);
    }
    Ok(())
}
