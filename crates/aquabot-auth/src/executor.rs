//! Outbound calls with automatic credential refresh.

use reqwest::{RequestBuilder, Response};
use tracing::{debug, warn};

use crate::coordinator::RotationCoordinator;
use crate::error::{CallFailure, ExecutionError};
use crate::http_client::truncate_body;
use crate::types::{Credential, RotationTrigger};

/// Retries allowed after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Runs a request against the protected API, rotating the credential and
/// retrying whenever the call fails.
///
/// Every failure is treated as a possibly-bad credential: 401 and 429 are the
/// expected triggers, but other statuses and transport errors go through the
/// same rotation path. The number of retries is bounded by `max_retries`.
#[derive(Debug, Clone)]
pub struct RetryingRequestExecutor {
    coordinator: RotationCoordinator,
    max_retries: u32,
}

impl RetryingRequestExecutor {
    pub fn new(coordinator: RotationCoordinator) -> Self {
        Self {
            coordinator,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn coordinator(&self) -> &RotationCoordinator {
        &self.coordinator
    }

    /// Build and send a request with the current credential.
    ///
    /// `build` is called once per attempt with the credential to use and must
    /// produce a fresh request each time.
    pub async fn execute<F>(&self, build: F) -> Result<Response, ExecutionError>
    where
        F: Fn(&Credential) -> RequestBuilder,
    {
        let mut credential = match self.coordinator.cache().get() {
            Some(credential) => credential,
            None => {
                debug!("No cached credential, rotating before first attempt");
                self.coordinator.rotate(RotationTrigger::Missing).await?
            }
        };

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let failure = match build(&credential).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let message = truncate_body(response.text().await.unwrap_or_default());
                    CallFailure::Status { status, message }
                }
                Err(error) => CallFailure::Transport(error.to_string()),
            };

            if attempts > self.max_retries {
                warn!(attempts, %failure, "Giving up on request");
                return Err(ExecutionError::RetriesExhausted {
                    attempts,
                    last: failure,
                });
            }

            let trigger = failure
                .status()
                .map(RotationTrigger::from_status)
                .unwrap_or(RotationTrigger::Transport);
            debug!(attempts, %failure, %trigger, credential = %credential.masked(), "Request failed");

            credential = match self.coordinator.cache().get() {
                // Another request already rotated past the credential that failed.
                Some(current) if current.value() != credential.value() => current,
                _ => self.coordinator.rotate(trigger).await?,
            };
        }
    }
}
