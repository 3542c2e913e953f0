//! Server-sent-event stream connection.
//!
//! An [`EventStream`] owns a background read task that decodes events and
//! routes each one to the listener registered for its event name (the
//! topic). Closing the stream (explicitly or on drop) stops the task
//! without firing the error handler.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use reqwest::header::{ACCEPT, HeaderValue};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use bitloops_auth::{AuthHeaderProvider, ClientConfig};
use bitloops_protocol::constants::{CONTENT_TYPE_EVENT_STREAM, events_path};
use bitloops_protocol::sse::{SseDecoder, SseEvent};

use crate::http::{HttpError, header_map};
use crate::reader::read_pump;
use crate::types::TopicCallback;

/// Errors from opening or reading an event stream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server rejected event stream with status {0}")]
    Rejected(u16),

    #[error("malformed event stream: {0}")]
    Decode(String),

    #[error("event stream ended")]
    Ended,

    #[error("invalid value for header {0}")]
    InvalidHeader(&'static str),
}

impl From<HttpError> for StreamError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::InvalidHeader(name) => Self::InvalidHeader(name),
            HttpError::Application { status, .. } => Self::Rejected(status),
            other => Self::Network(other.to_string()),
        }
    }
}

/// Callback invoked once when the stream fails.
pub type ErrorHandler = Box<dyn FnOnce(StreamError) + Send>;

/// Open and error handlers for a new stream.
pub struct StreamHandlers {
    /// Called once the server has accepted the stream.
    pub on_open: Box<dyn FnOnce() + Send>,
    /// Called at most once, when the stream fails or ends on its own.
    pub on_error: ErrorHandler,
}

impl StreamHandlers {
    /// Handlers that do nothing.
    pub fn noop() -> Self {
        Self {
            on_open: Box::new(|| {}),
            on_error: Box::new(|_| {}),
        }
    }
}

/// One registered listener per topic, tagged with its registration id.
pub(crate) type ListenerMap = Arc<RwLock<HashMap<String, (u64, TopicCallback)>>>;

/// A live server-sent-event stream.
pub struct EventStream {
    connection_id: String,
    listeners: ListenerMap,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
}

impl EventStream {
    /// Fires `on_open` and starts reading `events` in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(connection_id: impl Into<String>, events: S, handlers: StreamHandlers) -> Self
    where
        S: Stream<Item = Result<SseEvent, StreamError>> + Send + 'static,
    {
        let connection_id = connection_id.into();
        let listeners: ListenerMap = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let StreamHandlers { on_open, on_error } = handlers;

        on_open();
        let read_handle = tokio::spawn(read_pump(
            events.boxed(),
            listeners.clone(),
            on_error,
            cancel.clone(),
        ));

        Self {
            connection_id,
            listeners,
            cancel,
            read_handle,
        }
    }

    /// Connection id this stream was opened for.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Routes events named `topic` to `callback`, replacing any previous
    /// listener for that topic.
    pub fn add_listener(&self, topic: &str, registration: u64, callback: TopicCallback) {
        trace!(topic = %topic, registration, "adding listener");
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), (registration, callback));
    }

    /// Removes the listener for `topic` if it is still `registration`.
    pub fn remove_listener(&self, topic: &str, registration: u64) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if listeners.get(topic).is_some_and(|(id, _)| *id == registration) {
            listeners.remove(topic);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn has_listener(&self, topic: &str) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops the read task. The error handler is not called.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(connection = %self.connection_id, "closing event stream");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.read_handle.is_finished()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens event streams for a connection id.
pub trait StreamConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        connection_id: &'a str,
        handlers: StreamHandlers,
    ) -> BoxFuture<'a, Result<EventStream, StreamError>>;
}

/// Connector that opens `GET /bitloops/events/{id}` over HTTP.
pub struct SseConnector {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    headers: Arc<dyn AuthHeaderProvider>,
}

impl SseConnector {
    pub fn new(
        http: reqwest::Client,
        config: Arc<ClientConfig>,
        headers: Arc<dyn AuthHeaderProvider>,
    ) -> Self {
        Self {
            http,
            config,
            headers,
        }
    }
}

impl StreamConnector for SseConnector {
    fn connect<'a>(
        &'a self,
        connection_id: &'a str,
        handlers: StreamHandlers,
    ) -> BoxFuture<'a, Result<EventStream, StreamError>> {
        Box::pin(async move {
            let url = self.config.url(&events_path(connection_id));
            let auth = self.headers.auth_headers();
            let mut headers = header_map(&auth)?;
            headers.insert(ACCEPT, HeaderValue::from_static(CONTENT_TYPE_EVENT_STREAM));

            debug!(url = %url, user = auth.is_user(), "opening event stream");
            let resp = self
                .http
                .get(&url)
                .headers(headers)
                .send()
                .await
                .map_err(|e| StreamError::Network(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(StreamError::Rejected(status.as_u16()));
            }

            Ok(EventStream::spawn(
                connection_id,
                decode_body(resp.bytes_stream()),
                handlers,
            ))
        })
    }
}

/// Decodes a byte stream into server-sent events.
pub(crate) fn decode_body<S, B, E>(body: S) -> BoxStream<'static, Result<SseEvent, StreamError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = (Box::pin(body), SseDecoder::new(), VecDeque::new());
    futures_util::stream::unfold(state, |(mut body, mut decoder, mut pending)| async move {
        loop {
            if let Some(event) = pending.pop_front() {
                return Some((Ok(event), (body, decoder, pending)));
            }
            match body.next().await {
                Some(Ok(chunk)) => match decoder.push(chunk.as_ref()) {
                    Ok(events) => pending.extend(events),
                    Err(e) => {
                        let err = StreamError::Decode(e.to_string());
                        return Some((Err(err), (body, decoder, pending)));
                    }
                },
                Some(Err(e)) => {
                    let err = StreamError::Network(e.to_string());
                    return Some((Err(err), (body, decoder, pending)));
                }
                None => {
                    debug!(last_event_id = decoder.last_event_id(), "event stream body ended");
                    return None;
                }
            }
        }
    })
    .boxed()
}
