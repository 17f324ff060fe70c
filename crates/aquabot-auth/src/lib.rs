//! Aquabot Auth - credential lifecycle for the protected chat API
//!
//! This crate provides:
//! - Durable storage of the current credential in a `KEY=value` file
//! - An in-memory cache read by every outbound request
//! - Provisioning of new credentials across a priority-ordered account ladder
//! - Single-flight rotation shared by all concurrent callers
//! - A request executor that rotates and retries on failure

pub mod cache;
pub mod coordinator;
pub mod error;
pub mod executor;
mod http_client;
pub mod provisioning;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use cache::KeyCache;
pub use coordinator::RotationCoordinator;
pub use error::{AttemptError, CallFailure, ExecutionError, ProvisioningError, StoreError};
pub use executor::{DEFAULT_MAX_RETRIES, RetryingRequestExecutor};
pub use http_client::build_http_client;
pub use provisioning::{
    ApiBackend, BrowserBackend, FallthroughPolicy, Minter, MintOutcome, MintRequest,
    ProvisioningBackend, ProvisioningClient,
};
pub use store::{DEFAULT_CREDENTIAL_KEY, PersistedConfigStore};
pub use types::{AccountProfile, CREDENTIAL_PREFIX, Credential, RotationTrigger, is_valid_credential};
