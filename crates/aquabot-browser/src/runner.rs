//! Node.js runner generated around each user script.
//!
//! The runner launches Chromium with the profile's storage state, exposes a
//! `bot` object (`profile`, `page`, `context`, `saveState()`) to the script
//! body and prints exactly one result line prefixed with [`RESULT_MARKER`].

use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use serde_json::{Value, json};

use crate::process::run_captured;
use crate::{BrowserProfile, ScriptOutput, ScriptRequest};

pub(crate) const RESULT_MARKER: &str = "__AQUABOT_BROWSER_RESULT__=";

const RUNNER_TEMPLATE: &str = r#"import fs from 'node:fs';

const MARKER = '@MARKER@';
const profile = @PROFILE@;
const report = (value) => process.stdout.write(MARKER + JSON.stringify(value) + '\n');
const describe = (error) => (error && error.stack) ? error.stack : String(error);

let chromium;
try {
  ({ chromium } = await import('playwright'));
} catch (error) {
  report({ success: false, error: describe(error) });
  process.exit(1);
}

await fs.promises.mkdir(profile.profileDir, { recursive: true });
const browser = await chromium.launch({ headless: profile.headless });
const context = await browser.newContext(
  fs.existsSync(profile.storageStatePath) ? { storageState: profile.storageStatePath } : {}
);
const bot = {
  profile,
  context,
  page: await context.newPage(),
  saveState: () => context.storageState({ path: profile.storageStatePath }),
};

try {
  const result = await (async (bot) => {
@BODY@
  })(bot);
  await bot.saveState();
  report({ success: true, result: result ?? null });
} catch (error) {
  process.stderr.write(describe(error) + '\n');
  report({ success: false, error: describe(error) });
  process.exitCode = 1;
} finally {
  await browser.close().catch(() => {});
}
"#;

pub(crate) fn render(profile: &BrowserProfile, request: &ScriptRequest) -> String {
    let profile_json = json!({
        "name": profile.name,
        "headless": profile.headless,
        "profileDir": profile.profile_dir.display().to_string(),
        "storageStatePath": profile.storage_state_path().display().to_string(),
    });
    let body = request
        .code
        .lines()
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n");

    RUNNER_TEMPLATE
        .replace("@MARKER@", RESULT_MARKER)
        .replace("@PROFILE@", &profile_json.to_string())
        .replace("@BODY@", &body)
}

/// Write the runner to a scratch directory and execute it with Node.js.
pub(crate) async fn execute(runner: String, request: &ScriptRequest) -> Result<ScriptOutput> {
    if let Some(cwd) = request.cwd.as_deref()
        && !cwd.is_dir()
    {
        bail!("Invalid working directory: {}", cwd.display());
    }

    let scratch = tempfile::Builder::new()
        .prefix("aquabot-browser-")
        .tempdir()?;
    let runner_path = scratch.path().join("runner.mjs");
    tokio::fs::write(&runner_path, runner).await?;

    let runner_arg = runner_path.to_string_lossy().into_owned();
    let started = Instant::now();
    let captured = run_captured(
        "node",
        &[runner_arg.as_str()],
        request.cwd.as_deref(),
        Duration::from_secs(request.timeout_secs.max(1)),
    )
    .await?;

    let (stdout, payload) = split_result(&captured.stdout);
    Ok(ScriptOutput {
        exit_code: captured.exit_code,
        duration_ms: started.elapsed().as_millis() as u64,
        stdout,
        stderr: captured.stderr,
        payload,
    })
}

/// Separate the marker line from ordinary script output. The last
/// well-formed marker wins.
pub(crate) fn split_result(stdout: &str) -> (String, Option<Value>) {
    let (markers, plain): (Vec<&str>, Vec<&str>) = stdout
        .lines()
        .partition(|line| line.starts_with(RESULT_MARKER));

    let payload = markers
        .iter()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line[RESULT_MARKER.len()..].trim()).ok())
        .next();

    (plain.join("\n"), payload)
}
