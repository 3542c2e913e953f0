pub mod constants;
pub mod messages;
pub mod sse;

// Re-export primary types for convenience.
pub use messages::{SubscribeTopicRequest, SubscribeTopicsRequest, UnsubscribeTopicRequest};
pub use sse::{SseDecoder, SseError, SseEvent};
