//! Authorization headers for outbound requests.

use std::sync::Arc;

use bitloops_protocol::constants::{
    AUTH_SCHEME_USER, AUTH_UNAUTHORIZED, CONTENT_TYPE_JSON, HEADER_CLIENT_ID,
    HEADER_PROVIDER_ID, HEADER_SESSION_UUID,
};

use crate::config::{AuthConfig, ClientConfig};
use crate::store::CredentialStore;

/// Headers attached to every REST and stream request.
///
/// Recomputed per request and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthHeaders {
    pub content_type: String,
    pub authorization: String,
    pub provider_id: Option<String>,
    pub client_id: Option<String>,
    pub session_uuid: Option<String>,
}

impl AuthHeaders {
    /// Headers for a request made without a signed-in user.
    pub fn unauthorized() -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.into(),
            authorization: AUTH_UNAUTHORIZED.into(),
            provider_id: None,
            client_id: None,
            session_uuid: None,
        }
    }

    /// Returns `true` if these headers identify an interactive user.
    pub fn is_user(&self) -> bool {
        self.authorization.starts_with(AUTH_SCHEME_USER)
    }

    /// Flattens the headers into `(name, value)` pairs.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("content-type", self.content_type.clone()),
            ("authorization", self.authorization.clone()),
        ];
        if let Some(v) = &self.provider_id {
            pairs.push((HEADER_PROVIDER_ID, v.clone()));
        }
        if let Some(v) = &self.client_id {
            pairs.push((HEADER_CLIENT_ID, v.clone()));
        }
        if let Some(v) = &self.session_uuid {
            pairs.push((HEADER_SESSION_UUID, v.clone()));
        }
        pairs
    }
}

/// Produces the headers for the next request.
pub trait AuthHeaderProvider: Send + Sync {
    fn auth_headers(&self) -> AuthHeaders;
}

/// Header provider backed by the configured auth mode and a credential store.
pub struct StoreHeaderProvider {
    auth: Option<AuthConfig>,
    store: Arc<dyn CredentialStore>,
}

impl StoreHeaderProvider {
    pub fn new(config: &ClientConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            auth: config.auth.clone(),
            store,
        }
    }
}

impl AuthHeaderProvider for StoreHeaderProvider {
    fn auth_headers(&self) -> AuthHeaders {
        let Some(AuthConfig::User {
            provider_id,
            client_id,
        }) = &self.auth
        else {
            return AuthHeaders::unauthorized();
        };

        // A user without a uid has not completed sign-in.
        let Some(user) = self.store.user().filter(|u| !u.uid.is_empty()) else {
            return AuthHeaders::unauthorized();
        };

        AuthHeaders {
            content_type: CONTENT_TYPE_JSON.into(),
            authorization: format!("{AUTH_SCHEME_USER} {}", user.access_token),
            provider_id: Some(provider_id.clone()),
            client_id: Some(client_id.clone()),
            session_uuid: self.store.session_uuid(),
        }
    }
}
