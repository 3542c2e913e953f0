//! In-memory collaborators for manager tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use bitloops_protocol::sse::SseEvent;

use crate::http::{HttpError, TopicRegistrar};
use crate::stream::{EventStream, StreamConnector, StreamError, StreamHandlers};
use crate::types::SubscriptionEvent;

/// Takes one unit off `counter` if it is positive.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Registrar that allocates `conn-N` ids and records every call.
#[derive(Default)]
pub(crate) struct MockRegistrar {
    calls: Mutex<Vec<(String, String)>>,
    unregisters: Mutex<Vec<(String, String)>>,
    allocations: AtomicU64,
    failing_topics: Mutex<HashSet<String>>,
    failing_allocations: AtomicU32,
    unregister_fails: AtomicBool,
    delay: Duration,
}

impl MockRegistrar {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every register call waits `delay` before answering.
    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn unregisters(&self) -> Vec<(String, String)> {
        self.unregisters.lock().unwrap().clone()
    }

    /// Number of calls that asked for a new connection id.
    pub(crate) fn allocation_count(&self) -> usize {
        self.calls().iter().filter(|(id, _)| id.is_empty()).count()
    }

    /// Registering `topic` fails with a 500.
    pub(crate) fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().unwrap().insert(topic.to_string());
    }

    /// The next `n` allocations fail without a response.
    pub(crate) fn fail_next_allocations(&self, n: u32) {
        self.failing_allocations.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_unregister(&self) {
        self.unregister_fails.store(true, Ordering::SeqCst);
    }
}

impl TopicRegistrar for MockRegistrar {
    fn register<'a>(
        &'a self,
        connection_id: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<String, HttpError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((connection_id.to_string(), topic.to_string()));

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            if self.failing_topics.lock().unwrap().contains(topic) {
                return Err(HttpError::Application {
                    status: 500,
                    body: "boom".into(),
                });
            }
            if !connection_id.is_empty() {
                return Ok(String::new());
            }
            if take_one(&self.failing_allocations) {
                return Err(HttpError::Network("connection refused".into()));
            }
            let n = self.allocations.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("conn-{n}"))
        })
    }

    fn unregister<'a>(
        &'a self,
        connection_id: &'a str,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<(), HttpError>> {
        Box::pin(async move {
            self.unregisters
                .lock()
                .unwrap()
                .push((connection_id.to_string(), topic.to_string()));
            if self.unregister_fails.load(Ordering::SeqCst) {
                return Err(HttpError::Network("connection reset".into()));
            }
            Ok(())
        })
    }
}

type EventSender = mpsc::UnboundedSender<Result<SseEvent, StreamError>>;

/// Connector whose streams are fed by the test.
#[derive(Default)]
pub(crate) struct MockConnector {
    connects: Mutex<Vec<String>>,
    senders: Mutex<Vec<EventSender>>,
    failing_connects: AtomicU32,
    always_fail: AtomicBool,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    /// The next `n` connects are rejected with a 503.
    pub(crate) fn fail_next(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_always(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    fn latest(&self) -> EventSender {
        self.senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no stream opened")
    }

    /// Sends an event on the most recently opened stream.
    pub(crate) fn send(&self, topic: &str, data: &str) {
        let event = SseEvent {
            event: topic.into(),
            data: data.into(),
            id: String::new(),
            retry: None,
        };
        let _ = self.latest().send(Ok(event));
    }

    /// Fails the most recently opened stream.
    pub(crate) fn break_stream(&self) {
        let _ = self
            .latest()
            .send(Err(StreamError::Network("connection reset".into())));
    }
}

impl StreamConnector for MockConnector {
    fn connect<'a>(
        &'a self,
        connection_id: &'a str,
        handlers: StreamHandlers,
    ) -> BoxFuture<'a, Result<EventStream, StreamError>> {
        Box::pin(async move {
            self.connects
                .lock()
                .unwrap()
                .push(connection_id.to_string());

            if self.always_fail.load(Ordering::SeqCst) || take_one(&self.failing_connects) {
                return Err(StreamError::Rejected(503));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().unwrap().push(tx);
            let events = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|ev| (ev, rx))
            });
            Ok(EventStream::spawn(connection_id, events, handlers))
        })
    }
}

/// Callback forwarding every payload to a channel.
pub(crate) fn collector() -> (
    impl Fn(Value) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Value>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |value: Value| {
        let _ = tx.send(value);
    };
    (callback, rx)
}

/// Long enough to outlast any backoff when time is paused.
const WAIT: Duration = Duration::from_secs(3600);

pub(crate) async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for value")
        .expect("channel closed")
}

/// Skips manager events until one matches `pred`.
pub(crate) async fn wait_for(
    rx: &mut mpsc::Receiver<SubscriptionEvent>,
    pred: impl Fn(&SubscriptionEvent) -> bool,
) -> SubscriptionEvent {
    loop {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}
