//! Configuration file support
//!
//! Loads configuration from ~/.config/aquabot/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use aquabot_auth::{AccountProfile, DEFAULT_CREDENTIAL_KEY, DEFAULT_MAX_RETRIES, FallthroughPolicy};
use aquabot_browser::is_valid_profile_name;
use serde::{Deserialize, Serialize};

pub const PROVISIONING_KEY_ENV: &str = "OPENROUTER_PROVISIONING_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    /// Account ladder; tried in ascending priority.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the current credential is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".env"),
            key: DEFAULT_CREDENTIAL_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Sampling temperature for general answers
    pub temperature: Option<f32>,
    /// Business facts for general answers
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub max_retries: u32,
    pub policy: FallthroughPolicy,
    /// Upper bound on waiting for an interactive login
    pub login_timeout_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            policy: FallthroughPolicy::default(),
            login_timeout_secs: 60,
        }
    }
}

impl RotationConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Browser,
    Api,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub backend: BackendKind,
    /// Browser profiles live here, one directory per account
    pub browser_root: Option<PathBuf>,
    pub headless: bool,
    pub api_base_url: Option<String>,
    /// Spending limit for keys minted through the API
    pub key_limit: Option<u64>,
    /// Provisioning key for accounts without their own
    pub provisioning_key: Option<String>,
}

impl ProvisioningConfig {
    /// The configured provisioning key, falling back to the environment.
    pub fn default_provisioning_key(&self) -> Option<String> {
        self.provisioning_key
            .clone()
            .or_else(|| std::env::var(PROVISIONING_KEY_ENV).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    /// Session state file; defaults under the data directory
    pub session_file: Option<PathBuf>,
    pub provisioning_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily log files; stderr only when unset
    pub dir: Option<PathBuf>,
    /// Filter directives used when RUST_LOG is unset
    pub filter: Option<String>,
}

impl AppConfig {
    /// Load configuration. An explicit path must exist; the default path is
    /// optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from_path(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("aquabot").join("config.toml"))
    }

    fn validate(&self) -> Result<()> {
        for (index, account) in self.accounts.iter().enumerate() {
            if account.id.trim().is_empty() {
                bail!("Account #{} has an empty id", index + 1);
            }
            if self.provisioning.backend == BackendKind::Browser
                && !is_valid_profile_name(&account.id)
            {
                bail!(
                    "Account id '{}' cannot name a browser profile; use letters, digits, '-', '_' or '.'",
                    account.id
                );
            }
            if self.accounts[..index].iter().any(|other| other.id == account.id) {
                bail!("Account '{}' is configured twice", account.id);
            }
        }
        Ok(())
    }

    /// Account ladder with session files resolved. A single `primary`
    /// account is used when none are configured.
    pub fn account_profiles(&self) -> Vec<AccountProfile> {
        if self.accounts.is_empty() {
            return vec![AccountProfile::new(
                "primary",
                1,
                default_session_file("primary"),
            )];
        }

        self.accounts
            .iter()
            .map(|account| {
                let session_file = account
                    .session_file
                    .clone()
                    .unwrap_or_else(|| default_session_file(&account.id));
                AccountProfile::new(account.id.clone(), account.priority, session_file)
            })
            .collect()
    }

    /// Provisioning key per account id, with the shared key as fallback.
    pub fn provisioning_keys(&self) -> Vec<(String, String)> {
        let shared = self.provisioning.default_provisioning_key();
        self.account_profiles()
            .into_iter()
            .filter_map(|profile| {
                let own = self
                    .accounts
                    .iter()
                    .find(|account| account.id == profile.account_id)
                    .and_then(|account| account.provisioning_key.clone());
                own.or_else(|| shared.clone())
                    .map(|key| (profile.account_id, key))
            })
            .collect()
    }

    pub fn browser_root(&self) -> PathBuf {
        self.provisioning
            .browser_root
            .clone()
            .unwrap_or_else(|| data_dir().join("browser"))
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("aquabot")
}

fn default_session_file(account_id: &str) -> PathBuf {
    data_dir().join("sessions").join(format!("{}.json", account_id))
}
