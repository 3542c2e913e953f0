//! Credential store interface.
//!
//! Persistent backends (browser storage, OS keychains) live outside this
//! workspace; [`MemoryStore`] keeps credentials for the lifetime of the
//! process.

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A signed-in Bitloops user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUser {
    pub uid: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub client_id: String,
}

/// Read side of credential storage, as consumed by request code.
pub trait CredentialStore: Send + Sync {
    /// Returns the signed-in user, if any.
    fn user(&self) -> Option<StoredUser>;

    /// Returns the session uuid, if one has been assigned.
    fn session_uuid(&self) -> Option<String>;
}

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    user: RwLock<Option<StoredUser>>,
    session_uuid: RwLock<Option<String>>,
}

impl MemoryStore {
    /// Creates a store with a freshly generated session uuid and no user.
    pub fn new() -> Self {
        let store = Self::default();
        store.save_session_uuid(&uuid::Uuid::new_v4().to_string());
        store
    }

    /// Saves (or replaces) the signed-in user.
    pub fn save_user(&self, user: StoredUser) {
        debug!(uid = %user.uid, "saving user credentials");
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = Some(user);
    }

    /// Removes the signed-in user.
    pub fn delete_user(&self) {
        self.user
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Saves the session uuid.
    pub fn save_session_uuid(&self, session_uuid: &str) {
        *self
            .session_uuid
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session_uuid.to_string());
    }

    /// Removes the session uuid.
    pub fn delete_session_uuid(&self) {
        self.session_uuid
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl CredentialStore for MemoryStore {
    fn user(&self) -> Option<StoredUser> {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn session_uuid(&self) -> Option<String> {
        self.session_uuid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
