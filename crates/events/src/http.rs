//! Topic registration REST client.
//!
//! Async HTTP client using `reqwest`; headers come from an
//! [`AuthHeaderProvider`] and are recomputed for every request.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use bitloops_auth::{AuthHeaderProvider, AuthHeaders, ClientConfig};
use bitloops_protocol::constants::{subscribe_path, unsubscribe_path};
use bitloops_protocol::messages::{
    SubscribeTopicRequest, SubscribeTopicsRequest, UnsubscribeTopicRequest,
};

/// Errors from the registration endpoints.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("server responded {status}: {body}")]
    Application { status: u16, body: String },

    /// The request was aborted by [`RestClient::cancel_pending`].
    #[error("request cancelled")]
    Cancelled,

    #[error("invalid value for header {0}")]
    InvalidHeader(&'static str),
}

impl HttpError {
    /// Returns `true` if the server produced a response.
    pub fn has_response(&self) -> bool {
        matches!(self, Self::Application { .. })
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Registers topics against a connection id.
///
/// The manager only talks to the server through this trait, so tests can
/// substitute an in-memory registrar.
pub trait TopicRegistrar: Send + Sync {
    /// Binds `topic` to `connection_id`.
    ///
    /// With an empty `connection_id` the server allocates a new connection
    /// and the returned body carries its id.
    fn register<'a>(
        &'a self,
        connection_id: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<String, HttpError>>;

    /// Unbinds `topic` from `connection_id`.
    fn unregister<'a>(
        &'a self,
        connection_id: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), HttpError>>;

    /// Aborts every request currently in flight.
    fn cancel_pending(&self) {}
}

/// REST client for the subscribe and unsubscribe endpoints.
pub struct RestClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    headers: Arc<dyn AuthHeaderProvider>,
    cancel: Mutex<CancellationToken>,
}

impl RestClient {
    /// Creates a client with its own connection pool.
    pub fn new(
        config: Arc<ClientConfig>,
        headers: Arc<dyn AuthHeaderProvider>,
    ) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::with_client(http, config, headers))
    }

    /// Creates a client sharing an existing `reqwest` pool.
    pub fn with_client(
        http: reqwest::Client,
        config: Arc<ClientConfig>,
        headers: Arc<dyn AuthHeaderProvider>,
    ) -> Self {
        Self {
            http,
            config,
            headers,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Aborts in-flight requests with [`HttpError::Cancelled`].
    ///
    /// Requests started afterwards are unaffected.
    pub fn cancel_pending(&self) {
        let mut guard = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::replace(&mut *guard, CancellationToken::new());
        old.cancel();
        debug!("cancelled pending requests");
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// POSTs `body` as JSON and returns the response text.
    async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<String, HttpError> {
        let url = self.config.url(path);
        let auth = self.headers.auth_headers();
        let headers = header_map(&auth)?;
        let cancel = self.current_token();

        trace!(url = %url, user = auth.is_user(), "POST");
        let request = self.http.post(&url).headers(headers).json(body).send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            resp = request => resp?,
        };

        let status = resp.status();
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            text = resp.text() => text,
        };

        if !status.is_success() {
            return Err(HttpError::Application {
                status: status.as_u16(),
                body: text.unwrap_or_default(),
            });
        }

        Ok(text?)
    }
}

impl TopicRegistrar for RestClient {
    fn register<'a>(
        &'a self,
        connection_id: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<String, HttpError>> {
        Box::pin(async move {
            let path = subscribe_path(connection_id);
            let workspace_id = self.config.workspace_id.clone();
            if self.config.legacy_topic_list {
                let body = SubscribeTopicsRequest {
                    topics: vec![topic.to_string()],
                    workspace_id,
                };
                self.post_json(&path, &body).await
            } else {
                let body = SubscribeTopicRequest {
                    topic: topic.to_string(),
                    workspace_id,
                };
                self.post_json(&path, &body).await
            }
        })
    }

    fn unregister<'a>(
        &'a self,
        connection_id: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), HttpError>> {
        Box::pin(async move {
            let body = UnsubscribeTopicRequest {
                workspace_id: self.config.workspace_id.clone(),
                topic: topic.to_string(),
            };
            self.post_json(&unsubscribe_path(connection_id), &body)
                .await
                .map(|_| ())
        })
    }

    fn cancel_pending(&self) {
        RestClient::cancel_pending(self);
    }
}

/// Converts auth headers into a `reqwest` header map.
pub(crate) fn header_map(headers: &AuthHeaders) -> Result<HeaderMap, HttpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers.pairs() {
        let value = HeaderValue::from_str(&value).map_err(|_| HttpError::InvalidHeader(name))?;
        map.insert(HeaderName::from_static(name), value);
    }
    Ok(map)
}
