//! Credential persistence
//!
//! [`KeyValueStore`] is the contract consumed from the storage collaborator.
//! [`CredentialStore`] layers the device-specific keys and length bounds on
//! top of it and applies the recovery rules: a missing or unreadable value
//! reads as "not yet provisioned" / "not yet claimed".

pub mod file;

pub use file::FileStore;

use crate::error::StoreError;
use crate::session::{DeviceToken, DEVICE_TOKEN_CAPACITY};
use std::sync::Arc;
use tracing::{debug, warn};

/// Key holding the access token issued by provisioning
pub const DEVICE_TOKEN_KEY: &str = "device_token";
/// Key holding the claim flag, `"1"` once claimed
pub const IS_CLAIMED_KEY: &str = "is_claimed";
/// Key holding the device name written during network onboarding
pub const DEVICE_NAME_KEY: &str = "device_name";

const CLAIMED_FLAG: &str = "1";
const CLAIMED_FLAG_CAPACITY: usize = 1;

/// Persistent key/value storage
///
/// Implementations serialize `save` and `load` through one mutual-exclusion
/// region. `init` must run before first use and is idempotent.
pub trait KeyValueStore: Send + Sync {
    fn init(&self) -> Result<(), StoreError>;

    /// Overwrite the value stored under `key`
    fn save(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Read the value under `key`; fails with `BufferTooSmall` when it is
    /// longer than `capacity` bytes
    fn load(&self, key: &str, capacity: usize) -> Result<String, StoreError>;
}

/// Device credentials on top of a [`KeyValueStore`]
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn init(&self) -> Result<(), StoreError> {
        self.backend.init()
    }

    /// Stored access token, or `None` when the device is not provisioned
    pub fn load_token(&self) -> Option<DeviceToken> {
        let raw = self.load_recovering(DEVICE_TOKEN_KEY, DEVICE_TOKEN_CAPACITY)?;
        match DeviceToken::new(raw) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "Stored device token is unusable, treating device as unprovisioned");
                None
            }
        }
    }

    pub fn save_token(&self, token: &DeviceToken) -> Result<(), StoreError> {
        self.backend.save(DEVICE_TOKEN_KEY, token.as_str())
    }

    /// Whether the claim announcement has already been made
    pub fn load_claimed(&self) -> bool {
        self.load_recovering(IS_CLAIMED_KEY, CLAIMED_FLAG_CAPACITY)
            .is_some_and(|flag| flag == CLAIMED_FLAG)
    }

    pub fn mark_claimed(&self) -> Result<(), StoreError> {
        self.backend.save(IS_CLAIMED_KEY, CLAIMED_FLAG)
    }

    /// Device name written by network onboarding, bounded to `capacity` bytes
    pub fn load_device_name(&self, capacity: usize) -> Option<String> {
        self.load_recovering(DEVICE_NAME_KEY, capacity)
            .filter(|name| !name.is_empty())
    }

    fn load_recovering(&self, key: &str, capacity: usize) -> Option<String> {
        match self.backend.load(key, capacity) {
            Ok(value) => Some(value),
            Err(StoreError::NotFound(_)) => {
                debug!(key, "No stored value");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to load stored value, proceeding without it");
                None
            }
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}
