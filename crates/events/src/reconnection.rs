//! Reconnection with exponential backoff.
//!
//! Contains the cancellation helpers and the reconnect loop that replays
//! every recorded topic on a fresh connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::{Inner, lock};
use crate::types::{ConnectionState, SubscriptionEvent};

/// Cancels the active reconnect loop, if any.
pub(crate) fn cancel_reconnect(reconnect_cancel: &Mutex<Option<(u64, CancellationToken)>>) {
    if let Some((_, token)) = lock(reconnect_cancel).take() {
        token.cancel();
    }
}

/// Replaces any running reconnect loop with a new one keyed by `key`.
pub(crate) fn spawn_reconnect(inner: &Arc<Inner>, key: u64) {
    let cancel = CancellationToken::new();
    if let Some((_, previous)) = lock(&inner.reconnect_cancel).replace((key, cancel.clone())) {
        previous.cancel();
    }
    tokio::spawn(reconnect_loop(inner.clone(), key, cancel));
}

/// Reconnection loop with exponential backoff.
///
/// Returns a boxed future to break the recursive type cycle with the
/// stream error handler (which spawns this function).
pub(crate) fn reconnect_loop(
    inner: Arc<Inner>,
    key: u64,
    cancel: CancellationToken,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            if let Some(max) = inner.reconnect_config.max_attempts
                && attempt > max
            {
                warn!(attempts = max, "giving up on reconnecting");
                inner.set_state(ConnectionState::Closed);
                inner.emit(SubscriptionEvent::GaveUp { attempts: max });
                break;
            }

            // An open during a failed replay does not restart the sequence.
            let delay = inner.reconnect_config.delay_for_attempt(attempt);
            let delay_secs = delay.as_secs_f64();
            inner.set_state(ConnectionState::Reconnecting { attempt });
            inner.emit(SubscriptionEvent::Reconnecting {
                attempt,
                next_retry_secs: delay_secs,
            });
            info!(
                attempt,
                delay_secs = format_args!("{delay_secs:.1}"),
                "reconnecting"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if inner.topic_count() == 0 {
                debug!("no topics left, stopping reconnect");
                inner.set_state(ConnectionState::Closed);
                break;
            }

            let result = inner.resubscribe_all().await;

            if cancel.is_cancelled() {
                // Superseded or closed while replaying.
                if inner.topic_count() == 0 {
                    inner.take_connection(ConnectionState::Closed);
                }
                return;
            }

            match result {
                Ok(topics) => {
                    info!(topics, "resubscribed all topics");
                    inner.emit(SubscriptionEvent::Resubscribed { topics });
                    break;
                }
                Err(failed) => {
                    let next = inner.backoff.record_failures(attempt);
                    warn!(
                        attempt,
                        failed,
                        next_delay_secs = next.as_secs_f64(),
                        "resubscribe failed"
                    );
                    inner.take_connection(ConnectionState::Error);
                }
            }
        }

        // Clean up the cancel token if it's still ours.
        let mut guard = lock(&inner.reconnect_cancel);
        if guard.as_ref().is_some_and(|(k, _)| *k == key) {
            *guard = None;
        }
    })
}
