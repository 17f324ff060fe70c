//! Single-flight credential rotation.
//!
//! The coordinator is either idle or running exactly one mint. Callers that
//! ask for a rotation while a mint is outstanding attach to it and receive the
//! very same outcome; the first caller after the coordinator returns to idle
//! starts a new mint.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::KeyCache;
use crate::error::{ProvisioningError, StoreError};
use crate::provisioning::Minter;
use crate::store::PersistedConfigStore;
use crate::types::{Credential, RotationTrigger};

type RotationResult = Result<Credential, ProvisioningError>;
type PendingRotation = Shared<BoxFuture<'static, RotationResult>>;

enum RotationState {
    Idle,
    Rotating {
        generation: u64,
        pending: PendingRotation,
    },
}

struct Inner {
    minter: Arc<dyn Minter>,
    cache: Arc<KeyCache>,
    state: Mutex<RotationState>,
    generations: AtomicU64,
}

impl Inner {
    /// Return to idle, unless a newer rotation already took over.
    fn finish(&self, generation: u64) {
        let mut state = self.state.lock();
        if let RotationState::Rotating {
            generation: current,
            ..
        } = &*state
            && *current == generation
        {
            *state = RotationState::Idle;
        }
    }
}

/// Coalesces concurrent rotation requests into one mint.
#[derive(Clone)]
pub struct RotationCoordinator {
    inner: Arc<Inner>,
}

impl RotationCoordinator {
    pub fn new(minter: Arc<dyn Minter>, cache: Arc<KeyCache>) -> Self {
        Self {
            inner: Arc::new(Inner {
                minter,
                cache,
                state: Mutex::new(RotationState::Idle),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.inner.cache
    }

    pub fn is_rotating(&self) -> bool {
        matches!(*self.inner.state.lock(), RotationState::Rotating { .. })
    }

    /// Number of mints started since construction.
    pub fn rotations_started(&self) -> u64 {
        self.inner.generations.load(Ordering::SeqCst)
    }

    /// Seed the cache from the persisted store. Invalid or missing entries
    /// leave the cache untouched.
    pub async fn seed_from_store(
        &self,
        store: &PersistedConfigStore,
    ) -> Result<Option<Credential>, StoreError> {
        let loaded = store.load().await?;
        match &loaded {
            Some(credential) => {
                info!(path = %store.path().display(), credential = %credential.masked(), "Loaded persisted credential");
                self.inner.cache.set(credential.clone());
            }
            None => {
                debug!(path = %store.path().display(), "No persisted credential");
            }
        }
        Ok(loaded)
    }

    /// Obtain a fresh credential, joining an in-flight rotation if there is one.
    pub async fn rotate(&self, trigger: RotationTrigger) -> RotationResult {
        let pending = {
            let mut state = self.inner.state.lock();
            match &*state {
                RotationState::Rotating {
                    generation,
                    pending,
                } => {
                    debug!(%trigger, generation, "Joining in-flight rotation");
                    pending.clone()
                }
                RotationState::Idle => {
                    let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(%trigger, generation, "Starting credential rotation");
                    let pending = Self::start(self.inner.clone(), generation);
                    *state = RotationState::Rotating {
                        generation,
                        pending: pending.clone(),
                    };
                    pending
                }
            }
        };

        pending.await
    }

    /// Spawn the mint so it completes even if every waiting caller is dropped.
    fn start(inner: Arc<Inner>, generation: u64) -> PendingRotation {
        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let result = task_inner.minter.mint().await;
            match &result {
                Ok(credential) => {
                    task_inner.cache.set(credential.clone());
                    info!(generation, credential = %credential.masked(), "Credential rotation complete");
                }
                Err(error) => warn!(generation, %error, "Credential rotation failed"),
            }
            task_inner.finish(generation);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(error) => {
                    inner.finish(generation);
                    Err(ProvisioningError::Aborted(error.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl fmt::Debug for RotationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationCoordinator")
            .field("rotating", &self.is_rotating())
            .field("rotations_started", &self.rotations_started())
            .finish()
    }
}
