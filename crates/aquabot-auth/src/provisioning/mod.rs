//! Credential provisioning
//!
//! A [`ProvisioningClient`] walks the account ladder in priority order and
//! asks a [`ProvisioningBackend`] to create a credential for each account
//! until one succeeds. Backends:
//! - [`BrowserBackend`]: drives the provider's settings page through Playwright
//! - [`ApiBackend`]: calls the provider's key-management endpoint
//! - `ScriptedBackend` (tests): replays scripted outcomes

pub mod api;
pub mod browser;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use api::ApiBackend;
pub use browser::BrowserBackend;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AttemptError, ProvisioningError};
use crate::store::PersistedConfigStore;
use crate::types::{AccountProfile, Credential, find_credential};

const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_ACTION_BUDGET: Duration = Duration::from_secs(60);

/// One create-credential request against one account.
#[derive(Debug, Clone)]
pub struct MintRequest<'a> {
    pub account: &'a AccountProfile,
    /// Session state persisted by a previous attempt, if any.
    pub session_state: Option<String>,
    /// Collision-safe label for the new credential.
    pub label: String,
    /// Upper bound on waiting for an interactive login.
    pub login_timeout: Duration,
}

/// What a backend produced for one account.
#[derive(Debug, Clone)]
pub struct MintOutcome {
    /// Raw output the credential is extracted from.
    pub output: Result<String, AttemptError>,
    /// Session state to persist, captured even when the attempt failed.
    pub session_state: Option<String>,
}

impl MintOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: Ok(output.into()),
            session_state: None,
        }
    }

    pub fn failure(error: AttemptError) -> Self {
        Self {
            output: Err(error),
            session_state: None,
        }
    }

    pub fn with_session_state(mut self, state: Option<String>) -> Self {
        self.session_state = state;
        self
    }
}

#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn create_credential(&self, request: MintRequest<'_>) -> MintOutcome;
}

/// Anything that can produce a fresh credential.
#[async_trait]
pub trait Minter: Send + Sync {
    async fn mint(&self) -> Result<Credential, ProvisioningError>;
}

/// Which account failures move the ladder to the next account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallthroughPolicy {
    /// Any failure falls through to the next account.
    #[default]
    AnyError,
    /// Only rate limits fall through; other failures end the ladder.
    RateLimitOnly,
}

/// Mints credentials by walking an ordered account ladder.
pub struct ProvisioningClient {
    backend: Arc<dyn ProvisioningBackend>,
    accounts: Vec<AccountProfile>,
    store: Arc<PersistedConfigStore>,
    policy: FallthroughPolicy,
    login_timeout: Duration,
    action_budget: Duration,
    persist_pending: AtomicBool,
}

impl ProvisioningClient {
    /// Build a client. Accounts are sorted by ascending priority; ties keep
    /// their configured order.
    pub fn new(
        backend: Arc<dyn ProvisioningBackend>,
        mut accounts: Vec<AccountProfile>,
        store: Arc<PersistedConfigStore>,
    ) -> Result<Self, ProvisioningError> {
        if accounts.is_empty() {
            return Err(ProvisioningError::NoAccounts);
        }
        accounts.sort_by_key(|account| account.priority);

        Ok(Self {
            backend,
            accounts,
            store,
            policy: FallthroughPolicy::default(),
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            action_budget: DEFAULT_ACTION_BUDGET,
            persist_pending: AtomicBool::new(false),
        })
    }

    pub fn with_policy(mut self, policy: FallthroughPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_login_timeout(mut self, login_timeout: Duration) -> Self {
        self.login_timeout = login_timeout;
        self
    }

    /// Time allowed for one account beyond the login wait.
    pub fn with_action_budget(mut self, action_budget: Duration) -> Self {
        self.action_budget = action_budget;
        self
    }

    pub fn accounts(&self) -> &[AccountProfile] {
        &self.accounts
    }

    pub fn policy(&self) -> FallthroughPolicy {
        self.policy
    }

    /// Whether the last minted credential has not reached the store yet.
    pub fn persist_pending(&self) -> bool {
        self.persist_pending.load(Ordering::SeqCst)
    }

    pub async fn mint(&self) -> Result<Credential, ProvisioningError> {
        let mut attempted = 0;
        let mut last: Option<(String, AttemptError)> = None;
        let mut first_other: Option<(String, AttemptError)> = None;

        for account in &self.accounts {
            attempted += 1;
            info!(
                account_id = %account.account_id,
                priority = account.priority,
                backend = self.backend.name(),
                "Attempting credential mint"
            );

            match self.attempt(account).await {
                Ok(credential) => {
                    info!(
                        account_id = %account.account_id,
                        credential = %credential.masked(),
                        "Credential minted"
                    );
                    self.persist(&credential).await;
                    return Ok(credential);
                }
                Err(error) => {
                    let rate_limited = error.is_rate_limit();
                    if rate_limited {
                        warn!(account_id = %account.account_id, %error, "Account rate limited");
                    } else {
                        warn!(account_id = %account.account_id, %error, "Account failed to mint");
                        if first_other.is_none() {
                            first_other = Some((account.account_id.clone(), error.clone()));
                        }
                    }
                    last = Some((account.account_id.clone(), error));

                    if !rate_limited && self.policy == FallthroughPolicy::RateLimitOnly {
                        warn!(account_id = %account.account_id, "Fallthrough policy stops ladder on non-rate-limit failure");
                        break;
                    }
                }
            }
        }

        let Some((last_account, last)) = last else {
            return Err(ProvisioningError::NoAccounts);
        };
        Err(ProvisioningError::AccountsExhausted {
            attempted,
            last_account,
            last,
            first_other,
        })
    }

    async fn attempt(&self, account: &AccountProfile) -> Result<Credential, AttemptError> {
        let session_state = account.load_session().await.map_err(|error| {
            AttemptError::Other(format!("Failed to read session state: {}", error))
        })?;
        if session_state.is_none() {
            debug!(account_id = %account.account_id, "No persisted session, login will be required");
        }

        let request = MintRequest {
            account,
            session_state,
            label: generate_label(),
            login_timeout: self.login_timeout,
        };

        let budget = self.login_timeout + self.action_budget;
        let outcome = match timeout(budget, self.backend.create_credential(request)).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(AttemptError::Timeout(budget.as_secs())),
        };

        if let Some(state) = &outcome.session_state {
            match account.save_session(state).await {
                Ok(()) => debug!(account_id = %account.account_id, "Session state saved"),
                Err(error) => {
                    warn!(account_id = %account.account_id, %error, "Failed to save session state")
                }
            }
        }

        let output = outcome.output?;
        let value = find_credential(&output).ok_or_else(|| {
            AttemptError::ExtractionFailure(format!(
                "Backend output contained no credential ({} bytes)",
                output.len()
            ))
        })?;
        Credential::minted(value, &account.account_id).ok_or_else(|| {
            AttemptError::ExtractionFailure("Extracted value failed validation".to_string())
        })
    }

    async fn persist(&self, credential: &Credential) {
        let was_pending = self.persist_pending.load(Ordering::SeqCst);
        match self.store.save(credential).await {
            Ok(()) => {
                self.persist_pending.store(false, Ordering::SeqCst);
                if was_pending {
                    info!(path = %self.store.path().display(), "Recovered from earlier credential persistence failure");
                }
            }
            Err(error) => {
                self.persist_pending.store(true, Ordering::SeqCst);
                warn!(%error, "Failed to persist minted credential, keeping it in memory only");
            }
        }
    }
}

#[async_trait]
impl Minter for ProvisioningClient {
    async fn mint(&self) -> Result<Credential, ProvisioningError> {
        ProvisioningClient::mint(self).await
    }
}

/// Label for a new credential, unique enough that concurrent processes
/// never collide.
pub fn generate_label() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("key-{}", &id[..10])
}

#[cfg(test)]
mod tests {
    use super::mock::{ScriptedBackend, ScriptedStep};
    use super::*;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _temp: TempDir,
        store: Arc<PersistedConfigStore>,
        accounts: Vec<AccountProfile>,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let store = Arc::new(PersistedConfigStore::new(temp.path().join(".env")));
        let accounts = vec![
            AccountProfile::new("secondary", 2, temp.path().join("auth2.json")),
            AccountProfile::new("primary", 1, temp.path().join("auth.json")),
        ];
        Fixture {
            _temp: temp,
            store,
            accounts,
        }
    }

    #[test]
    fn empty_ladder_is_rejected_at_construction() {
        let fixture = fixture();
        let result = ProvisioningClient::new(
            Arc::new(ScriptedBackend::new()),
            Vec::new(),
            fixture.store.clone(),
        );
        assert!(matches!(result, Err(ProvisioningError::NoAccounts)));
    }

    #[test]
    fn labels_are_unique() {
        let a = generate_label();
        let b = generate_label();
        assert!(a.starts_with("key-"));
        assert_eq!(a.len(), 14);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn first_account_success_persists_credential() {
        let fixture = fixture();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push("primary", ScriptedStep::success("Your new key:\nsk-or-v1-fresh1"));

        let client =
            ProvisioningClient::new(backend.clone(), fixture.accounts.clone(), fixture.store.clone())
                .unwrap();
        let credential = client.mint().await.unwrap();

        assert_eq!(credential.value(), "sk-or-v1-fresh1");
        assert_eq!(credential.source_account_id(), Some("primary"));
        assert_eq!(backend.calls(), vec!["primary".to_string()]);
        assert_eq!(
            fixture.store.load().await.unwrap().unwrap().value(),
            "sk-or-v1-fresh1"
        );
        assert!(!client.persist_pending());
    }

    #[tokio::test]
    async fn rate_limited_account_falls_through_to_next() {
        let fixture = fixture();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(
            "primary",
            ScriptedStep::failure(AttemptError::RateLimited("429".to_string())),
        );
        backend.push("secondary", ScriptedStep::success("sk-or-v1-second2"));

        let client =
            ProvisioningClient::new(backend.clone(), fixture.accounts.clone(), fixture.store.clone())
                .unwrap();
        let credential = client.mint().await.unwrap();

        assert_eq!(credential.source_account_id(), Some("secondary"));
        assert_eq!(
            backend.calls(),
            vec!["primary".to_string(), "secondary".to_string()]
        );
    }

    #[tokio::test]
    async fn invalid_extraction_is_never_returned() {
        let fixture = fixture();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push("primary", ScriptedStep::success("sk-or-v1-"));
        backend.push("secondary", ScriptedStep::success("no key on this page"));

        let client =
            ProvisioningClient::new(backend, fixture.accounts.clone(), fixture.store.clone())
                .unwrap();
        let error = client.mint().await.unwrap_err();

        match error {
            ProvisioningError::AccountsExhausted {
                attempted,
                last_account,
                last,
                first_other,
            } => {
                assert_eq!(attempted, 2);
                assert_eq!(last_account, "secondary");
                assert!(matches!(last, AttemptError::ExtractionFailure(_)));
                let (first_account, first_error) = first_other.unwrap();
                assert_eq!(first_account, "primary");
                assert!(matches!(first_error, AttemptError::ExtractionFailure(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fixture.store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn other_errors_fall_through_by_default_and_are_retained() {
        let fixture = fixture();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(
            "primary",
            ScriptedStep::failure(AttemptError::Other("selector not found".to_string())),
        );
        backend.push(
            "secondary",
            ScriptedStep::failure(AttemptError::RateLimited("429".to_string())),
        );

        let client =
            ProvisioningClient::new(backend.clone(), fixture.accounts.clone(), fixture.store.clone())
                .unwrap();
        let error = client.mint().await.unwrap_err();

        assert_eq!(backend.calls().len(), 2);
        match error {
            ProvisioningError::AccountsExhausted {
                last, first_other, ..
            } => {
                assert!(last.is_rate_limit());
                assert_eq!(
                    first_other,
                    Some((
                        "primary".to_string(),
                        AttemptError::Other("selector not found".to_string())
                    ))
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_only_policy_stops_on_other_errors() {
        let fixture = fixture();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(
            "primary",
            ScriptedStep::failure(AttemptError::Other("boom".to_string())),
        );
        backend.push("secondary", ScriptedStep::success("sk-or-v1-unused"));

        let client =
            ProvisioningClient::new(backend.clone(), fixture.accounts.clone(), fixture.store.clone())
                .unwrap()
                .with_policy(FallthroughPolicy::RateLimitOnly);
        let error = client.mint().await.unwrap_err();

        assert_eq!(backend.calls(), vec!["primary".to_string()]);
        assert!(matches!(
            error,
            ProvisioningError::AccountsExhausted { attempted: 1, .. }
        ));
    }

    #[tokio::test]
    async fn session_state_is_loaded_and_persisted() {
        let fixture = fixture();
        let primary = fixture
            .accounts
            .iter()
            .find(|account| account.account_id == "primary")
            .unwrap()
            .clone();
        primary.save_session("old-session").await.unwrap();

        let backend = Arc::new(ScriptedBackend::new());
        backend.push(
            "primary",
            ScriptedStep::failure(AttemptError::Other("modal never opened".to_string()))
                .with_session_state("new-session"),
        );
        backend.push("secondary", ScriptedStep::success("sk-or-v1-ok"));

        let client =
            ProvisioningClient::new(backend.clone(), fixture.accounts.clone(), fixture.store.clone())
                .unwrap();
        client.mint().await.unwrap();

        assert_eq!(
            backend.seen_sessions(),
            vec![
                ("primary".to_string(), Some("old-session".to_string())),
                ("secondary".to_string(), None),
            ]
        );
        assert_eq!(
            primary.load_session().await.unwrap().as_deref(),
            Some("new-session")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_backend_times_out_and_falls_through() {
        let fixture = fixture();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(
            "primary",
            ScriptedStep::success("sk-or-v1-late").with_delay(Duration::from_secs(600)),
        );
        backend.push("secondary", ScriptedStep::success("sk-or-v1-quick"));

        let client =
            ProvisioningClient::new(backend, fixture.accounts.clone(), fixture.store.clone())
                .unwrap()
                .with_login_timeout(Duration::from_secs(5))
                .with_action_budget(Duration::from_secs(5));
        let credential = client.mint().await.unwrap();

        assert_eq!(credential.value(), "sk-or-v1-quick");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn store_failure_keeps_credential_and_flags_pending() {
        let temp = tempdir().unwrap();
        let blocked = temp.path().join("blocked");
        std::fs::create_dir_all(blocked.join("child")).unwrap();
        let store = Arc::new(PersistedConfigStore::new(&blocked));

        let backend = Arc::new(ScriptedBackend::new());
        backend.push("primary", ScriptedStep::success("sk-or-v1-memonly"));
        let client = ProvisioningClient::new(
            backend,
            vec![AccountProfile::new("primary", 1, temp.path().join("auth.json"))],
            store,
        )
        .unwrap();

        let credential = client.mint().await.unwrap();
        assert_eq!(credential.value(), "sk-or-v1-memonly");
        assert!(client.persist_pending());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn next_mint_persists_after_store_recovers() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(".env");
        std::fs::create_dir_all(path.join("child")).unwrap();
        let store = Arc::new(PersistedConfigStore::new(&path));

        let backend = Arc::new(ScriptedBackend::new());
        backend.push("primary", ScriptedStep::success("sk-or-v1-memonly"));
        backend.push("primary", ScriptedStep::success("sk-or-v1-recovered"));
        let client = ProvisioningClient::new(
            backend,
            vec![AccountProfile::new("primary", 1, temp.path().join("auth.json"))],
            store.clone(),
        )
        .unwrap();

        client.mint().await.unwrap();
        assert!(client.persist_pending());

        std::fs::remove_dir_all(&path).unwrap();
        std::fs::write(&path, "BOT_TOKEN=abc\n").unwrap();

        let credential = client.mint().await.unwrap();
        assert_eq!(credential.value(), "sk-or-v1-recovered");
        assert!(!client.persist_pending());

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content
            .lines()
            .filter(|line| line.starts_with("CREDENTIAL="))
            .collect();
        assert_eq!(lines, vec!["CREDENTIAL=sk-or-v1-recovered"]);
        assert!(content.contains("BOT_TOKEN=abc"));
    }
}
