//! Programmatic provisioning through the provider's key-management API.
//!
//! Each account authenticates with its own provisioning key. The persisted
//! session state, when present, takes precedence over the configured key so
//! operators can rotate provisioning keys by editing the session file.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{MintOutcome, MintRequest, ProvisioningBackend};
use crate::error::AttemptError;
use crate::http_client::{build_http_client, truncate_body};

pub const DEFAULT_PROVISIONING_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_KEY_NAME: &str = "aquabot auto key";

#[derive(Serialize)]
struct CreateKeyRequest<'a> {
    name: &'a str,
    label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
}

#[derive(Deserialize)]
struct CreateKeyResponse {
    key: Option<String>,
}

pub struct ApiBackend {
    client: Client,
    base_url: String,
    key_name: String,
    limit: Option<u64>,
    provisioning_keys: HashMap<String, String>,
}

impl ApiBackend {
    pub fn new() -> Self {
        Self {
            client: build_http_client(),
            base_url: DEFAULT_PROVISIONING_URL.to_string(),
            key_name: DEFAULT_KEY_NAME.to_string(),
            limit: None,
            provisioning_keys: HashMap::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Spending limit attached to each minted key.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_key_name(mut self, name: impl Into<String>) -> Self {
        self.key_name = name.into();
        self
    }

    pub fn with_provisioning_key(
        mut self,
        account_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        self.provisioning_keys.insert(account_id.into(), key.into());
        self
    }

    fn provisioning_key(&self, request: &MintRequest<'_>) -> Option<String> {
        request
            .session_state
            .as_ref()
            .map(|state| state.trim().to_string())
            .filter(|state| !state.is_empty())
            .or_else(|| {
                self.provisioning_keys
                    .get(&request.account.account_id)
                    .cloned()
            })
    }

    async fn create(&self, request: &MintRequest<'_>) -> Result<String, AttemptError> {
        let provisioning_key = self.provisioning_key(request).ok_or_else(|| {
            AttemptError::Other(format!(
                "No provisioning key configured for account {}",
                request.account.account_id
            ))
        })?;

        let url = format!("{}/keys", self.base_url.trim_end_matches('/'));
        let body = CreateKeyRequest {
            name: &self.key_name,
            label: &request.label,
            limit: self.limit,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&provisioning_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| AttemptError::classify(format!("Provisioning request failed: {}", error)))?;

        let status = response.status();
        debug!(account_id = %request.account.account_id, status = status.as_u16(), "Provisioning response");

        if status.as_u16() == 429 {
            let message = truncate_body(response.text().await.unwrap_or_default());
            return Err(AttemptError::RateLimited(format!("HTTP 429: {}", message)));
        }

        if !status.is_success() {
            let message = truncate_body(response.text().await.unwrap_or_default());
            return Err(AttemptError::classify(format!(
                "Provisioning endpoint returned HTTP {}: {}",
                status.as_u16(),
                message
            )));
        }

        let parsed: CreateKeyResponse = response.json().await.map_err(|error| {
            AttemptError::ExtractionFailure(format!("Unreadable provisioning response: {}", error))
        })?;
        parsed.key.ok_or_else(|| {
            AttemptError::ExtractionFailure("Provisioning response carried no key".to_string())
        })
    }
}

impl Default for ApiBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningBackend for ApiBackend {
    fn name(&self) -> &str {
        "api"
    }

    async fn create_credential(&self, request: MintRequest<'_>) -> MintOutcome {
        match self.create(&request).await {
            Ok(key) => MintOutcome::success(key),
            Err(error) => MintOutcome::failure(error),
        }
    }
}
