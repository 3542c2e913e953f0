//! Topic subscriptions over a single Bitloops server-sent-event stream.
//!
//! Provides the topic registration REST client, the event stream
//! connection wrapper, and the subscription manager that multiplexes many
//! topics over one stream and reconnects with exponential backoff.

pub mod http;
pub mod manager;
mod reader;
pub(crate) mod reconnection;
pub mod stream;
pub mod types;

#[cfg(test)]
mod testing;

pub use http::{HttpError, RestClient, TopicRegistrar};
pub use manager::{Subscription, SubscriptionManager};
pub use stream::{EventStream, SseConnector, StreamConnector, StreamError, StreamHandlers};
pub use types::{
    ConnectionState, ReconnectConfig, SubscribeError, SubscriptionEvent, TopicCallback,
};
