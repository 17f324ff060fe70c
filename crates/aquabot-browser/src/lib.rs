//! Browser runtime for aquabot.
//!
//! Drives Chromium through Playwright by generating a Node.js runner per
//! script. Each named profile owns a directory holding the Playwright storage
//! state, so a login captured in one run is reused by the next.

mod probe;
mod process;
mod runner;

pub use probe::RuntimeProbe;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const STORAGE_STATE_FILE: &str = "storage-state.json";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Whether `name` can be used as a profile directory: ASCII alphanumerics,
/// `-`, `_` and `.`, not starting with a dot.
pub fn is_valid_profile_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// A persistent browser identity backed by a directory on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserProfile {
    pub name: String,
    pub headless: bool,
    pub profile_dir: PathBuf,
}

impl BrowserProfile {
    pub fn storage_state_path(&self) -> PathBuf {
        self.profile_dir.join(STORAGE_STATE_FILE)
    }

    /// Storage state captured by a previous run, if any.
    pub async fn read_storage_state(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.storage_state_path()).await {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Replace the storage state through a temp file in the profile
    /// directory, so Playwright never sees a truncated file.
    pub async fn write_storage_state(&self, state: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.profile_dir).await?;
        let dir = self.profile_dir.clone();
        let target = self.storage_state_path();
        let state = state.to_owned();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            temp.write_all(state.as_bytes())?;
            temp.as_file().sync_all()?;
            temp.persist(&target)?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRequest {
    /// Body of an async function receiving `bot` (`page`, `context`,
    /// `profile`, `saveState()`). Its return value becomes the result.
    pub code: String,
    pub timeout_secs: u64,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ScriptRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            cwd: None,
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Run Node.js from this directory so it resolves a local `playwright`.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Script output with the result line removed.
    pub stdout: String,
    pub stderr: String,
    /// `{success, result}` or `{success: false, error}` as reported by the runner.
    pub payload: Option<Value>,
}

impl ScriptOutput {
    /// Build the output of a script that returned `result`.
    pub fn completed(result: Value) -> Self {
        Self {
            exit_code: 0,
            duration_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
            payload: Some(serde_json::json!({ "success": true, "result": result })),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn result(&self) -> Option<&Value> {
        if !self.succeeded() {
            return None;
        }
        self.payload.as_ref()?.get("result")
    }

    /// Best available description of why the script failed.
    pub fn failed_message(&self) -> String {
        let reported = self
            .payload
            .as_ref()
            .and_then(|payload| payload.get("error"))
            .and_then(Value::as_str);
        match reported {
            Some(error) => error.to_string(),
            None if !self.stderr.trim().is_empty() => self.stderr.trim().to_string(),
            None => format!("Browser script exited with code {}", self.exit_code),
        }
    }
}

/// Runs scripts against a profile. [`PlaywrightExecutor`] is the real one;
/// tests substitute their own.
#[async_trait]
pub trait BrowserExecutor: Send + Sync {
    async fn probe_runtime(&self) -> Result<RuntimeProbe>;

    async fn run_script(
        &self,
        profile: &BrowserProfile,
        request: &ScriptRequest,
    ) -> Result<ScriptOutput>;
}

/// Hands out per-name profiles under one root and delegates execution.
pub struct BrowserRuntime {
    root_dir: PathBuf,
    headless: bool,
    executor: Arc<dyn BrowserExecutor>,
}

impl BrowserRuntime {
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::new_with_executor(root_dir, Arc::new(PlaywrightExecutor))
    }

    pub fn new_with_executor(
        root_dir: impl Into<PathBuf>,
        executor: Arc<dyn BrowserExecutor>,
    ) -> Result<Self> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)?;
        Ok(Self {
            root_dir,
            headless: true,
            executor,
        })
    }

    /// Headed mode lets an operator complete interactive logins.
    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub async fn probe_runtime(&self) -> Result<RuntimeProbe> {
        self.executor.probe_runtime().await
    }

    /// Profile directory for `name`, created on first use. Names are plain
    /// identifiers so they can never escape the root.
    pub fn profile(&self, name: &str) -> Result<BrowserProfile> {
        if !is_valid_profile_name(name) {
            bail!("Invalid profile name: {:?}", name);
        }

        let profile_dir = self.root_dir.join(name);
        std::fs::create_dir_all(&profile_dir)?;
        Ok(BrowserProfile {
            name: name.to_string(),
            headless: self.headless,
            profile_dir,
        })
    }

    pub async fn run_script(
        &self,
        profile: &BrowserProfile,
        request: &ScriptRequest,
    ) -> Result<ScriptOutput> {
        debug!(profile = %profile.name, timeout_secs = request.timeout_secs, "Running browser script");
        let output = self.executor.run_script(profile, request).await?;
        debug!(
            profile = %profile.name,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            success = output.succeeded(),
            "Browser script finished"
        );
        Ok(output)
    }
}

/// Runs scripts with the host's Node.js and Playwright installation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaywrightExecutor;

#[async_trait]
impl BrowserExecutor for PlaywrightExecutor {
    async fn probe_runtime(&self) -> Result<RuntimeProbe> {
        Ok(probe::probe_host().await)
    }

    async fn run_script(
        &self,
        profile: &BrowserProfile,
        request: &ScriptRequest,
    ) -> Result<ScriptOutput> {
        self.probe_runtime().await?.require_ready()?;
        runner::execute(runner::render(profile, request), request).await
    }
}
