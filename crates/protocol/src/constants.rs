use std::time::Duration;

/// Path of the server-sent-event stream. The connection id is appended.
pub const EVENTS_PATH: &str = "/bitloops/events";

/// Path that allocates a connection id or binds a topic to one.
pub const SUBSCRIBE_PATH: &str = "/bitloops/events/subscribe";

/// Path that unbinds a topic from a connection id.
pub const UNSUBSCRIBE_PATH: &str = "/bitloops/events/unsubscribe";

/// Content type of every REST request body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type served on the event stream.
pub const CONTENT_TYPE_EVENT_STREAM: &str = "text/event-stream";

/// Header carrying the auth provider id in interactive-user mode.
pub const HEADER_PROVIDER_ID: &str = "provider-id";

/// Header carrying the OAuth client id in interactive-user mode.
pub const HEADER_CLIENT_ID: &str = "client-id";

/// Header carrying the browser/session uuid in interactive-user mode.
pub const HEADER_SESSION_UUID: &str = "session-uuid";

/// `Authorization` scheme used for interactive users (`User {accessToken}`).
pub const AUTH_SCHEME_USER: &str = "User";

/// `Authorization` value sent when no user is signed in.
pub const AUTH_UNAUTHORIZED: &str = "Unauthorized";

/// Event name assigned by the SSE format when the server sends none.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// First reconnect delay, and the value the delay resets to once a stream opens.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for the reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Path of the event stream for a connection id.
pub fn events_path(connection_id: &str) -> String {
    format!("{EVENTS_PATH}/{connection_id}")
}

/// Path of the subscribe endpoint.
///
/// An empty `connection_id` produces the allocation path (trailing slash,
/// no id segment).
pub fn subscribe_path(connection_id: &str) -> String {
    format!("{SUBSCRIBE_PATH}/{connection_id}")
}

/// Path of the unsubscribe endpoint for a connection id.
pub fn unsubscribe_path(connection_id: &str) -> String {
    format!("{UNSUBSCRIBE_PATH}/{connection_id}")
}
