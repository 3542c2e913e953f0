//! Subscription manager multiplexing topics over one event stream.
//!
//! The first subscriber allocates a connection id and opens the stream;
//! later subscribers only bind their topic to that id. When the stream
//! fails, every recorded topic is registered again on a fresh connection
//! with exponential backoff between attempts.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use bitloops_auth::{AuthHeaderProvider, ClientConfig, CredentialStore, StoreHeaderProvider};
use bitloops_protocol::messages::parse_connection_id;

use crate::http::{HttpError, RestClient, TopicRegistrar};
use crate::reconnection::{cancel_reconnect, spawn_reconnect};
use crate::stream::{EventStream, SseConnector, StreamConnector, StreamError, StreamHandlers};
use crate::types::{
    Backoff, ConnectionState, ReconnectConfig, SubscribeError, SubscriptionEvent, TopicCallback,
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A recorded subscription: the newest callback for a topic.
#[derive(Clone)]
pub(crate) struct TopicEntry {
    pub(crate) registration: u64,
    pub(crate) callback: TopicCallback,
}

/// The shared connection. `id` is empty while no connection exists.
#[derive(Default)]
pub(crate) struct Connection {
    pub(crate) id: String,
    pub(crate) stream: Option<EventStream>,
    pub(crate) state: ConnectionState,
    /// Bumped whenever the stream is replaced or dropped, so handlers
    /// of an older stream can tell they are stale.
    pub(crate) generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AttachMode {
    /// A new subscribe call.
    Fresh,
    /// Replaying a recorded topic after the stream failed.
    Replay,
}

/// State shared by the manager, its subscriptions, stream handlers and the
/// reconnect loop.
pub(crate) struct Inner {
    pub(crate) registrar: Arc<dyn TopicRegistrar>,
    pub(crate) connector: Arc<dyn StreamConnector>,
    pub(crate) topics: Mutex<HashMap<String, TopicEntry>>,
    pub(crate) connection: Mutex<Connection>,
    /// Held while a connection is being established.
    pub(crate) init_lock: tokio::sync::Mutex<()>,
    pub(crate) backoff: Backoff,
    pub(crate) reconnect_config: ReconnectConfig,
    /// Cancel token for the active reconnect loop, keyed by the
    /// generation that spawned it.
    pub(crate) reconnect_cancel: Mutex<Option<(u64, CancellationToken)>>,
    pub(crate) next_registration: AtomicU64,
    pub(crate) shut_down: AtomicBool,
    pub(crate) events_tx: mpsc::Sender<SubscriptionEvent>,
}

impl Inner {
    pub(crate) fn emit(&self, event: SubscriptionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            trace!("subscription event not delivered: {e}");
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        lock(&self.connection).state = state.clone();
        self.emit(SubscriptionEvent::StateChanged(state));
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn topic_count(&self) -> usize {
        lock(&self.topics).len()
    }

    fn current_connection_id(&self) -> Option<String> {
        let conn = lock(&self.connection);
        (!conn.id.is_empty()).then(|| conn.id.clone())
    }

    /// Runs the subscribe flow for one recorded topic.
    async fn attach(
        self: &Arc<Self>,
        topic: &str,
        entry: &TopicEntry,
        mode: AttachMode,
    ) -> Result<(), SubscribeError> {
        let mut initiator = false;
        let connection_id = {
            let _guard = self.init_lock.lock().await;
            if self.is_shut_down() {
                return Err(SubscribeError::Shutdown);
            }
            match self.current_connection_id() {
                Some(id) => id,
                None => {
                    initiator = true;
                    self.establish(topic).await?
                }
            }
        };

        // The allocation call already carried the initiator's topic.
        if !initiator {
            trace!(topic = %topic, connection = %connection_id, ?mode, "binding topic");
            self.registrar.register(&connection_id, topic).await?;
        }

        self.install_listener(topic, entry, &connection_id);
        Ok(())
    }

    /// Allocates a connection id with `topic` and opens the stream.
    ///
    /// Caller holds `init_lock`.
    async fn establish(self: &Arc<Self>, topic: &str) -> Result<String, SubscribeError> {
        self.set_state(ConnectionState::Initializing);

        let connection_id = match self.registrar.register("", topic).await {
            Ok(body) => match parse_connection_id(&body) {
                Some(id) => id,
                None => {
                    self.set_state(ConnectionState::Error);
                    return Err(SubscribeError::MissingConnectionId);
                }
            },
            Err(e) => {
                self.set_state(ConnectionState::Error);
                return Err(e.into());
            }
        };

        let generation = {
            let mut conn = lock(&self.connection);
            conn.generation += 1;
            conn.generation
        };

        let stream = match self
            .connector
            .connect(&connection_id, self.stream_handlers(generation))
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(ConnectionState::Error);
                return Err(e.into());
            }
        };

        {
            let mut conn = lock(&self.connection);
            if conn.generation != generation {
                // Closed, or the stream already failed, while opening.
                drop(conn);
                stream.close();
                return Err(if self.is_shut_down() {
                    SubscribeError::Shutdown
                } else {
                    SubscribeError::Stream(StreamError::Ended)
                });
            }
            conn.id = connection_id.clone();
            conn.stream = Some(stream);
        }
        self.set_state(ConnectionState::Open);
        info!(connection = %connection_id, "event stream established");
        Ok(connection_id)
    }

    /// Points the stream's listener for `topic` at `entry`, unless the
    /// entry or the connection was replaced in the meantime.
    fn install_listener(&self, topic: &str, entry: &TopicEntry, connection_id: &str) {
        let current = lock(&self.topics)
            .get(topic)
            .is_some_and(|e| e.registration == entry.registration);
        if !current {
            debug!(topic = %topic, "subscription superseded before listener was attached");
            return;
        }

        let conn = lock(&self.connection);
        match conn.stream.as_ref() {
            Some(stream) if stream.connection_id() == connection_id && !stream.is_closed() => {
                stream.add_listener(topic, entry.registration, entry.callback.clone());
            }
            _ => debug!(topic = %topic, "connection replaced before listener was attached"),
        }
    }

    fn stream_handlers(self: &Arc<Self>, generation: u64) -> StreamHandlers {
        let on_open = Arc::downgrade(self);
        let on_error = Arc::downgrade(self);
        StreamHandlers {
            on_open: Box::new(move || {
                if let Some(inner) = on_open.upgrade() {
                    inner.backoff.reset();
                    trace!("event stream open, backoff reset");
                }
            }),
            on_error: Box::new(move |err| {
                if let Some(inner) = on_error.upgrade() {
                    inner.handle_stream_error(generation, err);
                }
            }),
        }
    }

    /// Drops a failed stream and schedules a reconnect.
    fn handle_stream_error(self: &Arc<Self>, generation: u64, err: StreamError) {
        let stream = {
            let mut conn = lock(&self.connection);
            if conn.generation != generation {
                debug!(generation, "ignoring error from a replaced stream");
                return;
            }
            conn.generation += 1;
            conn.id.clear();
            conn.state = ConnectionState::Error;
            conn.stream.take()
        };
        if let Some(stream) = stream {
            stream.close();
        }
        warn!(error = %err, "event stream failed");
        self.emit(SubscriptionEvent::StateChanged(ConnectionState::Error));

        if self.is_shut_down() || self.topic_count() == 0 {
            self.set_state(ConnectionState::Closed);
            return;
        }
        spawn_reconnect(self, generation + 1);
    }

    /// Drops the current connection and returns its id, if there was one.
    pub(crate) fn take_connection(&self, next: ConnectionState) -> Option<String> {
        let (id, stream) = {
            let mut conn = lock(&self.connection);
            conn.generation += 1;
            conn.state = next.clone();
            (std::mem::take(&mut conn.id), conn.stream.take())
        };
        if let Some(stream) = stream {
            stream.close();
        }
        self.emit(SubscriptionEvent::StateChanged(next));
        (!id.is_empty()).then_some(id)
    }

    /// Stops reconnecting and closes the stream.
    fn close_connection(&self) -> Option<String> {
        cancel_reconnect(&self.reconnect_cancel);
        let id = self.take_connection(ConnectionState::Closed);
        if let Some(id) = &id {
            info!(connection = %id, "event stream closed");
        }
        id
    }

    /// Forgets `topic` if it is still `registration`. Closes the
    /// connection when that was the last topic.
    ///
    /// Returns `None` if the registration was stale, otherwise the id of
    /// the connection it was bound to.
    fn remove_topic(&self, topic: &str, registration: u64) -> Option<Option<String>> {
        let now_empty = {
            let mut topics = lock(&self.topics);
            if !topics
                .get(topic)
                .is_some_and(|e| e.registration == registration)
            {
                return None;
            }
            topics.remove(topic);
            topics.is_empty()
        };

        if now_empty {
            Some(self.close_connection())
        } else {
            Some(self.current_connection_id())
        }
    }

    /// Puts back the entry a failed subscribe call replaced, unless a
    /// newer call has replaced it since.
    fn restore_topic(&self, topic: &str, registration: u64, previous: TopicEntry) {
        let mut topics = lock(&self.topics);
        if let Some(current) = topics.get_mut(topic)
            && current.registration == registration
        {
            debug!(topic = %topic, "keeping previous subscription after failed resubscribe");
            *current = previous;
        }
    }

    async fn unsubscribe(&self, topic: &str, registration: u64) {
        if let Some(stream) = lock(&self.connection).stream.as_ref() {
            stream.remove_listener(topic, registration);
        }

        let Some(connection_id) = self.remove_topic(topic, registration) else {
            debug!(topic = %topic, "subscription superseded, nothing to unsubscribe");
            return;
        };
        info!(topic = %topic, "unsubscribed");

        let Some(connection_id) = connection_id else {
            debug!(topic = %topic, "no live connection, skipping remote unsubscribe");
            return;
        };
        if let Err(e) = self.registrar.unregister(&connection_id, topic).await {
            warn!(topic = %topic, error = %e, "remote unsubscribe failed");
        }
    }

    /// Registers every recorded topic on a fresh connection.
    ///
    /// Returns the number of topics on success, or the number that failed.
    pub(crate) async fn resubscribe_all(self: &Arc<Self>) -> Result<usize, usize> {
        let entries: Vec<(String, TopicEntry)> = lock(&self.topics)
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.clone()))
            .collect();

        let results = join_all(
            entries
                .iter()
                .map(|(topic, entry)| self.attach(topic, entry, AttachMode::Replay)),
        )
        .await;

        let mut failed = 0;
        for ((topic, _), result) in entries.iter().zip(&results) {
            if let Err(e) = result {
                warn!(topic = %topic, error = %e, "resubscribe failed");
                failed += 1;
            }
        }

        if failed == 0 {
            Ok(entries.len())
        } else {
            Err(failed)
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.topics).clear();
        self.close_connection();
        info!("subscription manager shut down");
    }
}

/// Handle to one subscribe call.
///
/// Dropping the handle keeps the topic subscribed; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    topic: String,
    state: SubscriptionState,
}

enum SubscriptionState {
    Active {
        inner: Arc<Inner>,
        registration: u64,
    },
    Inactive(SubscribeError),
}

impl Subscription {
    fn inactive(topic: String, error: SubscribeError) -> Self {
        Self {
            topic,
            state: SubscriptionState::Inactive(error),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns `true` if the subscribe call succeeded.
    pub fn is_active(&self) -> bool {
        matches!(self.state, SubscriptionState::Active { .. })
    }

    /// Why the subscribe call failed, if it did.
    pub fn error(&self) -> Option<&SubscribeError> {
        match &self.state {
            SubscriptionState::Inactive(e) => Some(e),
            SubscriptionState::Active { .. } => None,
        }
    }

    /// Removes this subscription's callback and unbinds the topic on the
    /// server. Closes the stream if no topics remain.
    ///
    /// Does nothing for a failed subscription, or if the topic has since
    /// been subscribed again with a newer callback.
    pub async fn unsubscribe(self) {
        if let SubscriptionState::Active {
            inner,
            registration,
        } = self.state
        {
            inner.unsubscribe(&self.topic, registration).await;
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Subscription");
        s.field("topic", &self.topic);
        match &self.state {
            SubscriptionState::Active { registration, .. } => {
                s.field("registration", registration)
            }
            SubscriptionState::Inactive(e) => s.field("error", e),
        };
        s.finish()
    }
}

/// Manages topic subscriptions over a single event stream.
///
/// Dropping the manager shuts it down.
pub struct SubscriptionManager {
    inner: Arc<Inner>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<SubscriptionEvent>>>,
}

impl SubscriptionManager {
    /// Creates a manager that talks to the server described by `config`.
    pub fn new(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self, HttpError> {
        let config = Arc::new(config);
        let headers: Arc<dyn AuthHeaderProvider> =
            Arc::new(StoreHeaderProvider::new(&config, store));
        let http = reqwest::Client::builder().build()?;

        let registrar = Arc::new(RestClient::with_client(
            http.clone(),
            config.clone(),
            headers.clone(),
        ));
        let connector = Arc::new(SseConnector::new(http, config.clone(), headers));
        let reconnect = ReconnectConfig::from(&config.reconnect);

        Ok(Self::with_collaborators(registrar, connector, reconnect))
    }

    /// Creates a manager over custom registration and stream collaborators.
    pub fn with_collaborators(
        registrar: Arc<dyn TopicRegistrar>,
        connector: Arc<dyn StreamConnector>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            registrar,
            connector,
            topics: Mutex::new(HashMap::new()),
            connection: Mutex::new(Connection::default()),
            init_lock: tokio::sync::Mutex::new(()),
            backoff: Backoff::new(reconnect.clone()),
            reconnect_config: reconnect,
            reconnect_cancel: Mutex::new(None),
            next_registration: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            events_tx,
        });
        Self {
            inner,
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<SubscriptionEvent>> {
        self.events_rx.lock().await.take()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.connection).state.clone()
    }

    /// Id of the live connection, if any.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.current_connection_id()
    }

    /// Subscribed topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.inner.topics).keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Delay before the next reconnect attempt.
    pub fn reconnect_delay(&self) -> Duration {
        self.inner.backoff.current()
    }

    /// Subscribes `callback` to `topic`.
    ///
    /// Event payloads are decoded from JSON into `T`; payloads that do not
    /// match are logged and dropped. Failures are reported through the
    /// returned handle (see [`Subscription::error`]) and never reach the
    /// callback.
    pub async fn subscribe<T, F>(&self, topic: impl Into<String>, callback: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let topic = topic.into();
        match self.try_subscribe(topic.clone(), callback).await {
            Ok(subscription) => subscription,
            Err(e) => Subscription::inactive(topic, e),
        }
    }

    /// Like [`subscribe`](Self::subscribe), but returns failures as errors.
    pub async fn try_subscribe<T, F>(
        &self,
        topic: impl Into<String>,
        callback: F,
    ) -> Result<Subscription, SubscribeError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let callback = typed_callback(&topic, callback);
        self.subscribe_callback(topic, callback).await
    }

    async fn subscribe_callback(
        &self,
        topic: String,
        callback: TopicCallback,
    ) -> Result<Subscription, SubscribeError> {
        if topic.trim().is_empty() {
            return Err(SubscribeError::InvalidTopic);
        }
        if self.inner.is_shut_down() {
            return Err(SubscribeError::Shutdown);
        }

        let entry = TopicEntry {
            registration: self.inner.next_registration.fetch_add(1, Ordering::Relaxed),
            callback,
        };
        let previous = lock(&self.inner.topics).insert(topic.clone(), entry.clone());
        if previous.is_some() {
            debug!(topic = %topic, "replacing callback for already subscribed topic");
        }
        info!(topic = %topic, "subscribing");

        match self.inner.attach(&topic, &entry, AttachMode::Fresh).await {
            Ok(()) => Ok(Subscription {
                topic,
                state: SubscriptionState::Active {
                    inner: self.inner.clone(),
                    registration: entry.registration,
                },
            }),
            Err(e) => {
                log_subscribe_failure(&topic, &e);
                match previous {
                    Some(previous) => {
                        self.inner.restore_topic(&topic, entry.registration, previous)
                    }
                    None => {
                        self.inner.remove_topic(&topic, entry.registration);
                    }
                }
                Err(e)
            }
        }
    }

    /// Aborts registration requests currently in flight.
    pub fn cancel_pending_requests(&self) {
        self.inner.registrar.cancel_pending();
    }

    /// Forgets every topic, closes the stream and stops reconnecting.
    /// Later subscribe calls fail with [`SubscribeError::Shutdown`].
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

fn typed_callback<T, F>(topic: &str, callback: F) -> TopicCallback
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let topic = topic.to_string();
    Arc::new(move |payload: serde_json::Value| {
        match serde_json::from_value::<T>(payload) {
            Ok(data) => callback(data),
            Err(e) => {
                warn!(topic = %topic, error = %e, "event payload has unexpected shape, dropping");
            }
        }
    })
}

fn log_subscribe_failure(topic: &str, err: &SubscribeError) {
    match err {
        SubscribeError::Registration(HttpError::Cancelled) => {
            debug!(topic = %topic, "subscribe cancelled");
        }
        SubscribeError::Registration(e) if e.has_response() => {
            warn!(topic = %topic, error = %e, "server rejected subscription");
        }
        SubscribeError::Registration(e) => {
            warn!(topic = %topic, error = %e, "subscription request got no response");
        }
        other => warn!(topic = %topic, error = %other, "subscribe failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use serde::Deserialize;
    use serde_json::Value;

    use crate::testing::{MockConnector, MockRegistrar, collector, recv, wait_for};

    fn manager(
        registrar: &Arc<MockRegistrar>,
        connector: &Arc<MockConnector>,
    ) -> SubscriptionManager {
        SubscriptionManager::with_collaborators(
            registrar.clone(),
            connector.clone(),
            ReconnectConfig::default(),
        )
    }

    fn call(id: &str, topic: &str) -> (String, String) {
        (id.to_string(), topic.to_string())
    }

    #[tokio::test]
    async fn take_events_once() {
        let mgr = manager(&MockRegistrar::new(), &MockConnector::new());
        assert!(mgr.take_events().await.is_some());
        assert!(mgr.take_events().await.is_none());
        assert_eq!(mgr.state(), ConnectionState::Uninitialized);
    }

    #[tokio::test]
    async fn two_topics_share_one_connection() {
        let registrar = MockRegistrar::new();
        let connector = MockConnector::new();
        let mgr = manager(&registrar, &connector);

        let (cb1, mut rx1) = collector();
        let first = mgr.subscribe("hello-topic", cb1).await;
        assert!(first.is_active());
        assert_eq!(registrar.calls(), vec![call("", "hello-topic")]);
        assert_eq!(mgr.connection_id().as_deref(), Some("conn-1"));
        assert_eq!(mgr.state(), ConnectionState::Open);

        let (cb2, _rx2) = collector();
        let second = mgr.subscribe("hello-topic-2", cb2).await;
        assert!(second.is_active());
        assert_eq!(
            registrar.calls(),
            vec![call("", "hello-topic"), call("conn-1", "hello-topic-2")]
        );
        assert_eq!(connector.connect_count(), 1);

        connector.send("hello-topic", r#"{"msg":"hi"}"#);
        assert_eq!(recv(&mut rx1).await["msg"], "hi");

        first.unsubscribe().await;
        assert_eq!(registrar.unregisters(), vec![call("conn-1", "hello-topic")]);
        assert_eq!(mgr.state(), ConnectionState::Open);
        assert_eq!(mgr.topics(), vec!["hello-topic-2".to_string()]);

        second.unsubscribe().await;
        assert_eq!(registrar.unregisters().len(), 2);
        assert_eq!(registrar.unregisters()[1], call("conn-1", "hello-topic-2"));
        assert_eq!(mgr.state(), ConnectionState::Closed);
        assert!(mgr.connection_id().is_none());
        assert!(mgr.topics().is_empty());
    }

    #[tokio::test]
    async fn concurrent_subscribes_allocate_once() {
        let registrar = MockRegistrar::with_delay(Duration::from_millis(20));
        let connector = MockConnector::new();
        let mgr = manager(&registrar, &connector);

        let subs = join_all((0..5).map(|i| mgr.subscribe(format!("t{i}"), |_: Value| {}))).await;
        assert!(subs.iter().all(Subscription::is_active));

        assert_eq!(registrar.allocation_count(), 1);
        assert_eq!(connector.connect_count(), 1);
        let calls = registrar.calls();
        assert_eq!(calls.len(), 5);
        assert!(
            calls
                .iter()
                .filter(|(id, _)| !id.is_empty())
                .all(|(id, _)| id == "conn-1")
        );
    }

    #[tokio::test]
    async fn typed_payloads_are_decoded() {
        #[derive(Deserialize)]
        struct Greeting {
            msg: String,
        }

        let connector = MockConnector::new();
        let mgr = manager(&MockRegistrar::new(), &connector);
        let (tx, mut rx) = mpsc::unbounded_channel();
        mgr.subscribe("greetings", move |g: Greeting| {
            let _ = tx.send(g.msg);
        })
        .await;

        connector.send("greetings", r#"{"other":1}"#);
        connector.send("greetings", "not json");
        connector.send("greetings", r#"{"msg":"hello"}"#);
        assert_eq!(recv(&mut rx).await, "hello");
    }

    #[tokio::test]
    async fn registration_failure_never_invokes_callback() {
        let registrar = MockRegistrar::new();
        registrar.fail_topic("bad");
        let connector = MockConnector::new();
        let mgr = manager(&registrar, &connector);

        let (good_cb, mut good_rx) = collector();
        assert!(mgr.subscribe("good", good_cb).await.is_active());

        let (bad_cb, mut bad_rx) = collector();
        let bad = mgr.subscribe("bad", bad_cb).await;
        assert!(!bad.is_active());
        assert!(matches!(
            bad.error(),
            Some(SubscribeError::Registration(HttpError::Application {
                status: 500,
                ..
            }))
        ));
        assert_eq!(mgr.topics(), vec!["good".to_string()]);

        connector.send("bad", "1");
        connector.send("good", "2");
        assert_eq!(recv(&mut good_rx).await, 2);
        assert!(bad_rx.try_recv().is_err());

        // Unsubscribing a failed subscription is a no-op.
        bad.unsubscribe().await;
        assert!(registrar.unregisters().is_empty());
    }

    #[tokio::test]
    async fn failed_allocation_lets_next_subscriber_initiate() {
        let registrar = MockRegistrar::new();
        registrar.fail_next_allocations(1);
        let connector = MockConnector::new();
        let mgr = manager(&registrar, &connector);

        let err = mgr.try_subscribe("a", |_: Value| {}).await.unwrap_err();
        assert!(matches!(
            err,
            SubscribeError::Registration(HttpError::Network(_))
        ));
        assert!(mgr.topics().is_empty());
        assert!(mgr.connection_id().is_none());
        assert_eq!(connector.connect_count(), 0);

        assert!(mgr.subscribe("b", |_: Value| {}).await.is_active());
        assert_eq!(registrar.calls(), vec![call("", "a"), call("", "b")]);
        assert_eq!(mgr.connection_id().as_deref(), Some("conn-1"));
    }

    #[tokio::test]
    async fn stream_open_failure_removes_topic() {
        let registrar = MockRegistrar::new();
        let connector = MockConnector::new();
        connector.fail_next(1);
        let mgr = manager(&registrar, &connector);

        let sub = mgr.subscribe("a", |_: Value| {}).await;
        assert!(matches!(
            sub.error(),
            Some(SubscribeError::Stream(StreamError::Rejected(503)))
        ));
        assert!(mgr.topics().is_empty());
        assert_eq!(mgr.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_delivers_nothing() {
        let connector = MockConnector::new();
        let mgr = manager(&MockRegistrar::new(), &connector);

        let (cb_a, mut rx_a) = collector();
        let sub = mgr.subscribe("a", cb_a).await;
        sub.unsubscribe().await;

        let (cb_b, mut rx_b) = collector();
        mgr.subscribe("b", cb_b).await;
        assert_eq!(connector.connect_count(), 2);

        connector.send("a", "1");
        connector.send("b", "2");
        assert_eq!(recv(&mut rx_b).await, 2);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribing_replaces_callback() {
        let registrar = MockRegistrar::new();
        let connector = MockConnector::new();
        let mgr = manager(&registrar, &connector);

        let (old_cb, mut old_rx) = collector();
        let old = mgr.subscribe("t", old_cb).await;
        let (new_cb, mut new_rx) = collector();
        let new = mgr.subscribe("t", new_cb).await;

        connector.send("t", "1");
        assert_eq!(recv(&mut new_rx).await, 1);
        assert!(old_rx.try_recv().is_err());

        // The stale handle no longer owns the topic.
        old.unsubscribe().await;
        assert_eq!(mgr.topics(), vec!["t".to_string()]);
        assert!(registrar.unregisters().is_empty());

        new.unsubscribe().await;
        assert_eq!(registrar.unregisters(), vec![call("conn-1", "t")]);
    }

    #[tokio::test]
    async fn failed_resubscribe_keeps_previous_callback() {
        let registrar = MockRegistrar::new();
        let connector = MockConnector::new();
        let mgr = manager(&registrar, &connector);

        let (old_cb, mut old_rx) = collector();
        let old = mgr.subscribe("t", old_cb).await;
        assert!(old.is_active());

        registrar.fail_topic("t");
        let (new_cb, mut new_rx) = collector();
        let new = mgr.subscribe("t", new_cb).await;
        assert!(!new.is_active());

        assert_eq!(mgr.topics(), vec!["t".to_string()]);
        assert_eq!(mgr.state(), ConnectionState::Open);
        assert_eq!(mgr.connection_id().as_deref(), Some("conn-1"));

        connector.send("t", "1");
        assert_eq!(recv(&mut old_rx).await, 1);
        assert!(new_rx.try_recv().is_err());

        // The original handle still owns the topic.
        old.unsubscribe().await;
        assert_eq!(registrar.unregisters(), vec![call("conn-1", "t")]);
        assert!(mgr.topics().is_empty());
        assert_eq!(mgr.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn empty_topic_is_rejected() {
        let registrar = MockRegistrar::new();
        let mgr = manager(&registrar, &MockConnector::new());

        let err = mgr.try_subscribe("", |_: Value| {}).await.unwrap_err();
        assert!(matches!(err, SubscribeError::InvalidTopic));
        assert!(!mgr.subscribe("  ", |_: Value| {}).await.is_active());
        assert!(registrar.calls().is_empty());
    }

    #[tokio::test]
    async fn remote_unsubscribe_failure_is_not_surfaced() {
        let registrar = MockRegistrar::new();
        registrar.fail_unregister();
        let mgr = manager(&registrar, &MockConnector::new());

        let a = mgr.subscribe("a", |_: Value| {}).await;
        mgr.subscribe("b", |_: Value| {}).await;
        a.unsubscribe().await;

        assert_eq!(mgr.topics(), vec!["b".to_string()]);
        assert_eq!(registrar.unregisters(), vec![call("conn-1", "a")]);
        assert_eq!(mgr.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn shutdown_closes_and_rejects_new_subscriptions() {
        let registrar = MockRegistrar::new();
        let mgr = manager(&registrar, &MockConnector::new());

        let sub = mgr.subscribe("a", |_: Value| {}).await;
        mgr.shutdown();
        assert_eq!(mgr.state(), ConnectionState::Closed);
        assert!(mgr.topics().is_empty());
        assert!(mgr.connection_id().is_none());

        let err = mgr.try_subscribe("b", |_: Value| {}).await.unwrap_err();
        assert!(matches!(err, SubscribeError::Shutdown));

        sub.unsubscribe().await;
        assert!(registrar.unregisters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_resubscribes_every_topic_once() {
        let registrar = MockRegistrar::new();
        let connector = MockConnector::new();
        let mgr = manager(&registrar, &connector);
        let mut events = mgr.take_events().await.unwrap();

        let (cb_a, mut rx_a) = collector();
        mgr.subscribe("a", cb_a).await;
        mgr.subscribe("b", |_: Value| {}).await;

        connector.break_stream();
        let done = wait_for(&mut events, |e| {
            matches!(e, SubscriptionEvent::Resubscribed { .. })
        })
        .await;
        assert_eq!(done, SubscriptionEvent::Resubscribed { topics: 2 });

        let replayed = registrar.calls().split_off(2);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed.iter().filter(|(id, _)| id.is_empty()).count(), 1);
        assert_eq!(
            replayed.iter().filter(|(id, _)| id == "conn-2").count(),
            1
        );
        let topics: HashSet<&str> = replayed.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(topics, HashSet::from(["a", "b"]));

        assert_eq!(connector.connect_count(), 2);
        assert_eq!(mgr.connection_id().as_deref(), Some("conn-2"));
        assert_eq!(mgr.state(), ConnectionState::Open);

        connector.send("a", r#""again""#);
        assert_eq!(recv(&mut rx_a).await, "again");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_doubles_up_to_cap() {
        let registrar = MockRegistrar::new();
        let connector = MockConnector::new();
        let mgr = manager(&registrar, &connector);
        let mut events = mgr.take_events().await.unwrap();

        mgr.subscribe("a", |_: Value| {}).await;
        connector.fail_next(8);
        connector.break_stream();

        let mut delays = Vec::new();
        loop {
            match wait_for(&mut events, |e| {
                matches!(
                    e,
                    SubscriptionEvent::Reconnecting { .. } | SubscriptionEvent::Resubscribed { .. }
                )
            })
            .await
            {
                SubscriptionEvent::Reconnecting {
                    next_retry_secs, ..
                } => delays.push(next_retry_secs),
                _ => break,
            }
        }

        assert_eq!(
            delays,
            vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 60.0, 60.0, 60.0]
        );
        // A successful open resets the delay.
        assert_eq!(mgr.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(mgr.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_bind_after_open_keeps_doubling() {
        let registrar = MockRegistrar::new();
        let connector = MockConnector::new();
        let mgr = manager(&registrar, &connector);
        let mut events = mgr.take_events().await.unwrap();

        mgr.subscribe("a", |_: Value| {}).await;
        mgr.subscribe("b", |_: Value| {}).await;
        // Every replay opens a stream for "a" and then fails on "b".
        registrar.fail_topic("b");
        connector.break_stream();

        let mut delays = Vec::new();
        while delays.len() < 6 {
            if let SubscriptionEvent::Reconnecting {
                next_retry_secs, ..
            } = wait_for(&mut events, |e| {
                matches!(e, SubscriptionEvent::Reconnecting { .. })
            })
            .await
            {
                delays.push(next_retry_secs);
            }
        }

        assert_eq!(delays, vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0]);
        assert!(connector.connect_count() >= 6);
        assert_eq!(mgr.topics(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let registrar = MockRegistrar::new();
        let connector = MockConnector::new();
        let mgr = SubscriptionManager::with_collaborators(
            registrar.clone(),
            connector.clone(),
            ReconnectConfig {
                max_attempts: Some(2),
                ..ReconnectConfig::default()
            },
        );
        let mut events = mgr.take_events().await.unwrap();

        mgr.subscribe("a", |_: Value| {}).await;
        connector.fail_always();
        connector.break_stream();

        let gave_up = wait_for(&mut events, |e| {
            matches!(e, SubscriptionEvent::GaveUp { .. })
        })
        .await;
        assert_eq!(gave_up, SubscriptionEvent::GaveUp { attempts: 2 });
        assert_eq!(mgr.state(), ConnectionState::Closed);
        assert_eq!(connector.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribing_last_topic_stops_reconnecting() {
        let registrar = MockRegistrar::new();
        let connector = MockConnector::new();
        let mgr = manager(&registrar, &connector);
        let mut events = mgr.take_events().await.unwrap();

        let sub = mgr.subscribe("a", |_: Value| {}).await;
        connector.fail_always();
        connector.break_stream();
        wait_for(&mut events, |e| {
            matches!(e, SubscriptionEvent::Reconnecting { attempt: 1, .. })
        })
        .await;

        sub.unsubscribe().await;
        assert_eq!(mgr.state(), ConnectionState::Closed);
        // No live connection, so nothing to unbind remotely.
        assert!(registrar.unregisters().is_empty());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(registrar.allocation_count(), 1);
    }
}
