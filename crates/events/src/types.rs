//! Public types for the subscription manager.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bitloops_auth::ReconnectSettings;
use bitloops_protocol::constants::{INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY};

use crate::http::HttpError;
use crate::stream::StreamError;

/// Callback invoked with the JSON-decoded payload of a topic event.
pub type TopicCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// State of the shared event stream connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ConnectionState {
    /// No topic has been subscribed yet.
    #[default]
    Uninitialized,
    /// A connection id is being allocated and the stream opened.
    Initializing,
    /// Stream open and delivering events.
    Open,
    /// Stream failed; a reconnect is about to be scheduled.
    Error,
    /// Waiting for or running a reconnect attempt.
    Reconnecting { attempt: u32 },
    /// No topics remain (or the manager was shut down).
    Closed,
}

/// Events emitted by the subscription manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The connection moved to a new state.
    StateChanged(ConnectionState),
    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32, next_retry_secs: f64 },
    /// Every topic was registered again on a fresh connection.
    Resubscribed { topics: usize },
    /// Reconnecting stopped after the configured number of attempts.
    GaveUp { attempts: u32 },
}

/// Why a subscribe call did not produce a live subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("topic must not be empty")]
    InvalidTopic,

    #[error("topic registration failed: {0}")]
    Registration(#[from] HttpError),

    #[error("server did not return a connection id")]
    MissingConnectionId,

    #[error("event stream failed: {0}")]
    Stream(#[from] StreamError),

    #[error("subscription manager is shut down")]
    Shutdown,
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt, and after every successful open.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
    /// Stop after this many consecutive failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: INITIAL_RECONNECT_DELAY,
            max_delay: MAX_RECONNECT_DELAY,
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_secs(settings.initial_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
            max_attempts: settings.max_attempts,
            ..Self::default()
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based) when every earlier attempt failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Current reconnect delay, shared between the reconnect loop (which
/// records failed attempts) and the stream open handler (which resets it).
#[derive(Debug)]
pub(crate) struct Backoff {
    config: ReconnectConfig,
    current: Mutex<Duration>,
}

impl Backoff {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        let current = Mutex::new(config.initial_delay);
        Self { config, current }
    }

    pub(crate) fn current(&self) -> Duration {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn reset(&self) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = self.config.initial_delay;
    }

    /// Records `attempts` consecutive failed attempts and returns the
    /// delay before the next one.
    pub(crate) fn record_failures(&self, attempts: u32) -> Duration {
        let next = self.config.delay_for_attempt(attempts.saturating_add(1));
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = next;
        next
    }
}
