//! Scripted provisioning backend for tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MintOutcome, MintRequest, ProvisioningBackend};
use crate::error::AttemptError;

/// One scripted answer for an account.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub delay: Duration,
    pub outcome: MintOutcome,
}

impl ScriptedStep {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: MintOutcome::success(output),
        }
    }

    pub fn failure(error: AttemptError) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: MintOutcome::failure(error),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_session_state(mut self, state: impl Into<String>) -> Self {
        self.outcome.session_state = Some(state.into());
        self
    }
}

/// Backend replaying per-account scripts and recording every call.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedStep>>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, account_id: &str, step: ScriptedStep) {
        self.scripts
            .lock()
            .entry(account_id.to_string())
            .or_default()
            .push_back(step);
    }

    /// Account ids in the order they were asked to mint.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|(account_id, _)| account_id.clone())
            .collect()
    }

    /// Account ids with the session state each attempt was handed.
    pub fn seen_sessions(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ProvisioningBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create_credential(&self, request: MintRequest<'_>) -> MintOutcome {
        let account_id = request.account.account_id.clone();
        self.calls
            .lock()
            .push((account_id.clone(), request.session_state.clone()));

        let step = self
            .scripts
            .lock()
            .get_mut(&account_id)
            .and_then(|steps| steps.pop_front());

        match step {
            Some(step) => {
                if !step.delay.is_zero() {
                    tokio::time::sleep(step.delay).await;
                }
                step.outcome
            }
            None => MintOutcome::failure(AttemptError::Other(format!(
                "No scripted step for account {}",
                account_id
            ))),
        }
    }
}
