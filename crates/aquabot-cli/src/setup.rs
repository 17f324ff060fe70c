//! Wires the credential stack and the language-model client from config.

use std::sync::Arc;

use anyhow::{Context, Result};
use aquabot_ai::{LlmClient, OpenRouterClient};
use aquabot_auth::{
    ApiBackend, BrowserBackend, KeyCache, PersistedConfigStore, ProvisioningBackend,
    ProvisioningClient, RetryingRequestExecutor, RotationCoordinator,
};
use aquabot_browser::BrowserRuntime;
use tracing::info;

use crate::config::{AppConfig, BackendKind};

pub struct Services {
    pub coordinator: RotationCoordinator,
    pub llm: Arc<dyn LlmClient>,
}

pub fn build_store(config: &AppConfig) -> PersistedConfigStore {
    PersistedConfigStore::new(&config.store.path).with_key(config.store.key.clone())
}

fn build_backend(config: &AppConfig) -> Result<Arc<dyn ProvisioningBackend>> {
    match config.provisioning.backend {
        BackendKind::Browser => {
            let runtime = BrowserRuntime::new(config.browser_root())?
                .with_headless(config.provisioning.headless);
            Ok(Arc::new(BrowserBackend::new(Arc::new(runtime))))
        }
        BackendKind::Api => {
            let mut backend = ApiBackend::new();
            if let Some(url) = &config.provisioning.api_base_url {
                backend = backend.with_base_url(url.clone());
            }
            if let Some(limit) = config.provisioning.key_limit {
                backend = backend.with_limit(limit);
            }
            for (account_id, key) in config.provisioning_keys() {
                backend = backend.with_provisioning_key(account_id, key);
            }
            Ok(Arc::new(backend))
        }
    }
}

/// Build every service and seed the credential cache from the store.
pub async fn prepare(config: &AppConfig) -> Result<Services> {
    let store = Arc::new(build_store(config));
    let backend = build_backend(config)?;
    info!(backend = backend.name(), store = %store.path().display(), "Preparing credential stack");

    let client = ProvisioningClient::new(backend, config.account_profiles(), store.clone())
        .context("Invalid account ladder")?
        .with_policy(config.rotation.policy)
        .with_login_timeout(config.rotation.login_timeout());

    let coordinator = RotationCoordinator::new(Arc::new(client), Arc::new(KeyCache::new()));
    coordinator
        .seed_from_store(&store)
        .await
        .context("Failed to read stored credential")?;

    let executor =
        RetryingRequestExecutor::new(coordinator.clone()).with_max_retries(config.rotation.max_retries);

    let mut llm = OpenRouterClient::new(executor);
    if let Some(model) = &config.llm.model {
        llm = llm.with_model(model.clone());
    }
    if let Some(url) = &config.llm.base_url {
        llm = llm.with_base_url(url.clone());
    }

    Ok(Services {
        coordinator,
        llm: Arc::new(llm),
    })
}
