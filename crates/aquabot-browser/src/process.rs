//! Child process execution with a hard deadline.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::Command;

pub(crate) struct Captured {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` to completion, killing it if `limit` elapses first.
pub(crate) async fn run_captured(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    limit: Duration,
) -> Result<Captured> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let Ok(output) = tokio::time::timeout(limit, command.output()).await else {
        bail!("{} timed out after {} seconds", program, limit.as_secs());
    };
    let output = output.with_context(|| format!("Failed to spawn {}", program))?;

    Ok(Captured {
        // Killed by a signal
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
