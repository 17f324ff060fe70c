//! Process-wide holder of the current credential.

use parking_lot::RwLock;

use crate::types::Credential;

/// Holds the credential callers should currently use.
///
/// Readers take a short read lock and clone; the only writer is the
/// rotation coordinator.
#[derive(Debug, Default)]
pub struct KeyCache {
    current: RwLock<Option<Credential>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            current: RwLock::new(Some(credential)),
        }
    }

    pub fn get(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    pub(crate) fn set(&self, credential: Credential) {
        *self.current.write() = Some(credential);
    }
}
