//! Detection of the Node.js + Playwright toolchain.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::process::run_captured;

const NODE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PLAYWRIGHT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PLAYWRIGHT_IMPORT_CHECK: &str =
    "import('playwright').then(() => process.exit(0), () => process.exit(1));";

/// What the host offers for running browser scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeProbe {
    /// `node --version` output; `None` when Node.js is missing.
    pub node_version: Option<String>,
    pub playwright: bool,
    pub chromium_installed: bool,
    /// Setup instructions for whatever is missing.
    pub hints: Vec<String>,
}

impl RuntimeProbe {
    pub fn ready(&self) -> bool {
        self.node_version.is_some() && self.playwright
    }

    /// Probe result for a host with everything installed.
    pub fn complete(node_version: impl Into<String>) -> Self {
        Self {
            node_version: Some(node_version.into()),
            playwright: true,
            chromium_installed: true,
            hints: Vec::new(),
        }
    }

    /// Fail with the first hint when scripts cannot run at all.
    pub fn require_ready(&self) -> anyhow::Result<()> {
        if self.ready() {
            return Ok(());
        }
        let reason = self
            .hints
            .first()
            .cloned()
            .unwrap_or_else(|| "Browser runtime is not available".to_string());
        anyhow::bail!(reason)
    }
}

pub(crate) async fn probe_host() -> RuntimeProbe {
    let mut probe = RuntimeProbe::default();

    probe.node_version = match run_captured("node", &["--version"], None, NODE_PROBE_TIMEOUT).await
    {
        Ok(output) if output.exit_code == 0 => Some(output.stdout.trim().to_string()),
        _ => None,
    };

    if probe.node_version.is_none() {
        probe
            .hints
            .push("Node.js not found; install Node.js 20+ for browser provisioning".to_string());
        return probe;
    }

    probe.playwright = run_captured(
        "node",
        &["--input-type=module", "-e", PLAYWRIGHT_IMPORT_CHECK],
        None,
        PLAYWRIGHT_PROBE_TIMEOUT,
    )
    .await
    .is_ok_and(|output| output.exit_code == 0);

    if !probe.playwright {
        probe
            .hints
            .push("Playwright is not installed; run `npm i -D playwright`".to_string());
        return probe;
    }

    probe.chromium_installed = playwright_cache_dirs().iter().any(|dir| dir.exists());
    if !probe.chromium_installed {
        probe
            .hints
            .push("No Playwright browsers found; run `npx playwright install chromium`".to_string());
    }

    probe
}

fn playwright_cache_dirs() -> Vec<PathBuf> {
    if let Some(custom) = std::env::var_os("PLAYWRIGHT_BROWSERS_PATH") {
        return vec![PathBuf::from(custom)];
    }

    let mut dirs = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        dirs.push(home.join(".cache").join("ms-playwright"));
        dirs.push(home.join("Library").join("Caches").join("ms-playwright"));
    }
    if let Some(local) = std::env::var_os("LOCALAPPDATA").map(PathBuf::from) {
        dirs.push(local.join("ms-playwright"));
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_needs_node_and_playwright() {
        assert!(RuntimeProbe::complete("v22.1.0").ready());

        let missing = RuntimeProbe {
            node_version: Some("v22.1.0".to_string()),
            playwright: false,
            chromium_installed: false,
            hints: vec!["Playwright is not installed".to_string()],
        };
        assert!(!missing.ready());
        let error = missing.require_ready().unwrap_err();
        assert_eq!(error.to_string(), "Playwright is not installed");
    }
}
