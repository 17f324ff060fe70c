//! Browser-driven provisioning against the provider's key settings page.
//!
//! Each account maps to one persistent browser profile. The persisted session
//! state is the Playwright storage state: it is written into the profile
//! before the run and read back afterwards, so logins captured during a run
//! survive even when key creation fails.

use std::sync::Arc;
use std::time::Duration;

use aquabot_browser::{BrowserRuntime, ScriptOutput, ScriptRequest};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{MintOutcome, MintRequest, ProvisioningBackend};
use crate::error::AttemptError;
use crate::types::CREDENTIAL_PREFIX;

pub const DEFAULT_KEYS_URL: &str = "https://openrouter.ai/settings/keys";
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(15);
const SCRIPT_OVERHEAD: Duration = Duration::from_secs(60);

pub struct BrowserBackend {
    runtime: Arc<BrowserRuntime>,
    keys_url: String,
    action_timeout: Duration,
}

impl BrowserBackend {
    pub fn new(runtime: Arc<BrowserRuntime>) -> Self {
        Self {
            runtime,
            keys_url: DEFAULT_KEYS_URL.to_string(),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }

    pub fn with_keys_url(mut self, url: impl Into<String>) -> Self {
        self.keys_url = url.into();
        self
    }

    /// Timeout for each page interaction after login.
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    async fn run(&self, request: &MintRequest<'_>) -> (Result<String, AttemptError>, Option<String>) {
        let account_id = &request.account.account_id;
        let profile = match self.runtime.profile(account_id) {
            Ok(profile) => profile,
            Err(error) => {
                return (
                    Err(AttemptError::Other(format!("Browser profile unavailable: {}", error))),
                    None,
                );
            }
        };

        if let Some(state) = &request.session_state
            && let Err(error) = profile.write_storage_state(state).await
        {
            warn!(account_id = %account_id, %error, "Failed to seed browser profile with session state");
        }

        let script = build_mint_script(
            &self.keys_url,
            &request.label,
            request.login_timeout,
            self.action_timeout,
        );
        let timeout_secs = (request.login_timeout + SCRIPT_OVERHEAD).as_secs();
        let result = self
            .runtime
            .run_script(
                &profile,
                &ScriptRequest::new(script).with_timeout_secs(timeout_secs),
            )
            .await;

        let captured = profile.read_storage_state().await.unwrap_or_else(|error| {
            warn!(account_id = %account_id, %error, "Failed to read browser storage state");
            None
        });
        let session_state = captured.filter(|state| request.session_state.as_ref() != Some(state));

        let output = match result {
            Ok(output) => interpret_output(&output),
            Err(error) => Err(AttemptError::classify(error.to_string())),
        };
        (output, session_state)
    }
}

#[async_trait]
impl ProvisioningBackend for BrowserBackend {
    fn name(&self) -> &str {
        "browser"
    }

    async fn create_credential(&self, request: MintRequest<'_>) -> MintOutcome {
        let (output, session_state) = self.run(&request).await;
        MintOutcome {
            output,
            session_state,
        }
    }
}

fn interpret_output(output: &ScriptOutput) -> Result<String, AttemptError> {
    if !output.succeeded() {
        return Err(AttemptError::classify(output.failed_message()));
    }

    let candidates: Vec<&str> = output
        .result()
        .and_then(|result| result.get("candidates"))
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    debug!(candidates = candidates.len(), "Browser script finished");

    if candidates.is_empty() {
        return Err(AttemptError::ExtractionFailure(
            "No credential found in page content".to_string(),
        ));
    }
    Ok(candidates.join("\n"))
}

fn js_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

/// Script body run inside the browser runner with `bot` in scope.
fn build_mint_script(
    keys_url: &str,
    label: &str,
    login_timeout: Duration,
    action_timeout: Duration,
) -> String {
    let mut script = String::new();
    script.push_str(&format!("const keysUrl = {};\n", js_string(keys_url)));
    script.push_str(&format!("const label = {};\n", js_string(label)));
    script.push_str(&format!("const prefix = {};\n", js_string(CREDENTIAL_PREFIX)));
    script.push_str(&format!("const loginTimeoutMs = {};\n", login_timeout.as_millis()));
    script.push_str(&format!("const actionTimeoutMs = {};\n", action_timeout.as_millis()));
    script.push_str("const page = bot.page;\n\n");

    script.push_str("let rateLimited = false;\n");
    script.push_str("page.on('response', (response) => {\n");
    script.push_str("  if (response.status() === 429) {\n");
    script.push_str("    rateLimited = true;\n");
    script.push_str("  }\n");
    script.push_str("});\n");
    script.push_str("const fail = (message) => {\n");
    script.push_str("  throw new Error(rateLimited ? `Rate limit encountered (429): ${message}` : message);\n");
    script.push_str("};\n\n");

    script.push_str("const response = await page.goto(keysUrl, { waitUntil: 'networkidle' });\n");
    script.push_str("if (response && response.status() === 429) {\n");
    script.push_str("  rateLimited = true;\n");
    script.push_str("  fail('Keys page answered 429');\n");
    script.push_str("}\n\n");

    script.push_str("const createButton = page.locator('button:has-text(\"Create Key\")').first();\n");
    script.push_str("if (await page.locator('text=Sign in').count() > 0) {\n");
    script.push_str("  try {\n");
    script.push_str("    await createButton.waitFor({ state: 'visible', timeout: loginTimeoutMs });\n");
    script.push_str("  } catch (_) {\n");
    script.push_str("    fail(`Login not completed within ${loginTimeoutMs} ms`);\n");
    script.push_str("  }\n");
    script.push_str("  await bot.saveState();\n");
    script.push_str("}\n\n");

    script.push_str("try {\n");
    script.push_str("  await createButton.waitFor({ state: 'visible', timeout: actionTimeoutMs });\n");
    script.push_str("  await createButton.click();\n");
    script.push_str("  await page.locator('text=Create a Key').first().waitFor({ state: 'visible', timeout: actionTimeoutMs });\n");
    script.push_str("  await page.fill('input[placeholder*=\"Chatbot Key\"]', label, { timeout: actionTimeoutMs });\n");
    script.push_str("  await page.evaluate(() => {\n");
    script.push_str("    const buttons = Array.from(document.querySelectorAll('button'));\n");
    script.push_str("    const confirm = buttons.find((b) => b.textContent.includes('Create') && !b.textContent.includes('Create Key'));\n");
    script.push_str("    if (confirm) confirm.click();\n");
    script.push_str("  });\n");
    script.push_str("  await page.locator('text=Your new key:').first().waitFor({ state: 'visible', timeout: actionTimeoutMs });\n");
    script.push_str("} catch (error) {\n");
    script.push_str("  fail(error && error.message ? error.message : String(error));\n");
    script.push_str("}\n\n");

    script.push_str("const candidates = await page.evaluate((prefix) => Array.from(document.querySelectorAll('*'))\n");
    script.push_str("  .map((element) => (element.textContent || '').trim())\n");
    script.push_str("  .filter((text) => text.startsWith(prefix)), prefix);\n");
    script.push_str("return { candidates };\n");

    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccountProfile;
    use aquabot_browser::{BrowserExecutor, BrowserProfile, RuntimeProbe};
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::tempdir;

    /// Executor that records the script and fakes the Playwright run.
    struct FakeExecutor {
        payload: Value,
        writes_state: Option<String>,
        scripts: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        fn new(payload: Value) -> Self {
            Self {
                payload,
                writes_state: None,
                scripts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BrowserExecutor for FakeExecutor {
        async fn probe_runtime(&self) -> anyhow::Result<RuntimeProbe> {
            Ok(RuntimeProbe::complete("v22.0.0"))
        }

        async fn run_script(
            &self,
            profile: &BrowserProfile,
            request: &ScriptRequest,
        ) -> anyhow::Result<ScriptOutput> {
            self.scripts.lock().push(request.code.clone());
            if let Some(state) = &self.writes_state {
                profile.write_storage_state(state).await?;
            }
            Ok(ScriptOutput {
                payload: Some(self.payload.clone()),
                ..ScriptOutput::completed(Value::Null)
            })
        }
    }

    fn mint_request<'a>(account: &'a AccountProfile, session_state: Option<&str>) -> MintRequest<'a> {
        MintRequest {
            account,
            session_state: session_state.map(str::to_string),
            label: "key-abc".to_string(),
            login_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn returns_candidates_and_captured_session() {
        let temp = tempdir().unwrap();
        let mut executor = FakeExecutor::new(json!({
            "success": true,
            "result": {"candidates": ["sk-or-v1-older1", "sk-or-v1-newest2"]}
        }));
        executor.writes_state = Some("{\"cookies\":[\"fresh\"]}".to_string());
        let executor = Arc::new(executor);
        let runtime = Arc::new(
            BrowserRuntime::new_with_executor(temp.path().join("profiles"), executor.clone()).unwrap(),
        );
        let backend = BrowserBackend::new(runtime);
        let account = AccountProfile::new("primary", 1, temp.path().join("auth.json"));

        let outcome = backend
            .create_credential(mint_request(&account, Some("{\"cookies\":[]}")))
            .await;

        assert_eq!(outcome.output.unwrap(), "sk-or-v1-older1\nsk-or-v1-newest2");
        assert_eq!(
            outcome.session_state.as_deref(),
            Some("{\"cookies\":[\"fresh\"]}")
        );
        let scripts = executor.scripts.lock();
        assert!(scripts[0].contains("const label = \"key-abc\";"));
        assert!(scripts[0].contains("const loginTimeoutMs = 30000;"));
    }

    #[tokio::test]
    async fn unchanged_session_is_not_reported() {
        let temp = tempdir().unwrap();
        let executor = Arc::new(FakeExecutor::new(json!({
            "success": true,
            "result": {"candidates": ["sk-or-v1-a1"]}
        })));
        let runtime = Arc::new(
            BrowserRuntime::new_with_executor(temp.path().join("profiles"), executor).unwrap(),
        );
        let backend = BrowserBackend::new(runtime);
        let account = AccountProfile::new("primary", 1, temp.path().join("auth.json"));

        let outcome = backend
            .create_credential(mint_request(&account, Some("same")))
            .await;
        assert!(outcome.session_state.is_none());
    }

    #[tokio::test]
    async fn rate_limit_failure_is_classified() {
        let temp = tempdir().unwrap();
        let executor = Arc::new(FakeExecutor::new(json!({
            "success": false,
            "error": "Error: Rate limit encountered (429): Keys page answered 429"
        })));
        let runtime = Arc::new(
            BrowserRuntime::new_with_executor(temp.path().join("profiles"), executor).unwrap(),
        );
        let backend = BrowserBackend::new(runtime);
        let account = AccountProfile::new("primary", 1, temp.path().join("auth.json"));

        let error = backend
            .create_credential(mint_request(&account, None))
            .await
            .output
            .unwrap_err();
        assert!(error.is_rate_limit());
    }

    #[test]
    fn empty_candidates_are_an_extraction_failure() {
        let output = ScriptOutput::completed(json!({"candidates": []}));
        assert!(matches!(
            interpret_output(&output),
            Err(AttemptError::ExtractionFailure(_))
        ));
    }

    #[test]
    fn script_escapes_literals() {
        let script = build_mint_script(
            "https://example.test/keys?x=\"1\"",
            "key-1",
            Duration::from_secs(1),
            Duration::from_millis(500),
        );
        assert!(script.contains(r#"const keysUrl = "https://example.test/keys?x=\"1\"";"#));
        assert!(script.contains("const actionTimeoutMs = 500;"));
        assert!(script.contains("const prefix = \"sk-or-v1-\";"));
    }
}
