use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Binds a single topic to a connection (or allocates one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeTopicRequest {
    pub topic: String,
    pub workspace_id: String,
}

/// Legacy form of [`SubscribeTopicRequest`] that carries a topic list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeTopicsRequest {
    pub topics: Vec<String>,
    pub workspace_id: String,
}

/// Unbinds a topic from a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeTopicRequest {
    pub workspace_id: String,
    pub topic: String,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Extracts the connection id from an allocation response body.
///
/// The server answers with the bare id, either as plain text or as a JSON
/// string. Returns `None` for an empty body.
pub fn parse_connection_id(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let id = match serde_json::from_str::<String>(trimmed) {
        Ok(s) => s,
        Err(_) => trimmed.to_string(),
    };
    if id.is_empty() { None } else { Some(id) }
}
