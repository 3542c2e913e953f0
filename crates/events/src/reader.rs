//! Event stream read pump: dispatches incoming events to topic listeners.

use std::sync::PoisonError;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use bitloops_protocol::sse::SseEvent;

use crate::stream::{ErrorHandler, ListenerMap, StreamError};

/// Reads events until the stream fails, ends, or is cancelled.
///
/// `on_error` runs once when the stream stops on its own; cancellation
/// exits silently.
pub(crate) async fn read_pump(
    mut events: BoxStream<'static, Result<SseEvent, StreamError>>,
    listeners: ListenerMap,
    on_error: ErrorHandler,
    cancel: CancellationToken,
) {
    let err = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                trace!("read pump cancelled");
                return;
            }

            next = events.next() => match next {
                Some(Ok(event)) => dispatch(&event, &listeners),
                Some(Err(e)) => {
                    warn!(error = %e, "event stream error");
                    break e;
                }
                None => {
                    debug!("event stream ended by server");
                    break StreamError::Ended;
                }
            }
        }
    };

    if !cancel.is_cancelled() {
        on_error(err);
    }
}

/// Hands one event to the listener for its topic, if any.
fn dispatch(event: &SseEvent, listeners: &ListenerMap) {
    let callback = listeners
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&event.event)
        .map(|(_, cb)| cb.clone());

    let Some(callback) = callback else {
        trace!(topic = %event.event, "no listener for event");
        return;
    };

    match serde_json::from_str::<serde_json::Value>(&event.data) {
        Ok(payload) => {
            trace!(topic = %event.event, "dispatching event");
            callback(payload);
        }
        Err(e) => {
            warn!(topic = %event.event, error = %e, "malformed event payload, dropping");
        }
    }
}
