//! Incremental decoder for the `text/event-stream` format.
//!
//! Bytes are pushed in arbitrary chunks (as they arrive from the network);
//! complete events are returned as soon as their terminating blank line has
//! been seen. Follows the
//! [event stream interpretation](https://html.spec.whatwg.org/multipage/server-sent-events.html#event-stream-interpretation)
//! rules.

use std::time::Duration;

use crate::constants::DEFAULT_EVENT_NAME;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Errors from decoding an event stream.
#[derive(Debug, thiserror::Error)]
pub enum SseError {
    #[error("invalid UTF-8 in event stream: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// A dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; topic name for the Bitloops stream.
    pub event: String,
    /// Data payload, lines joined with `\n`.
    pub data: String,
    /// Last event id seen on the stream when this event was dispatched.
    pub id: String,
    /// Reconnection time advertised by the server, if any.
    pub retry: Option<Duration>,
}

/// Stateful event stream decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: String,
    has_data: bool,
    last_id: String,
    retry: Option<Duration>,
    started: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, SseError> {
        self.buf.extend_from_slice(chunk);

        if !self.started {
            if self.buf.len() < BOM.len() && BOM.starts_with(&self.buf) {
                return Ok(Vec::new());
            }
            if self.buf.starts_with(BOM) {
                self.buf.drain(..BOM.len());
            }
            self.started = true;
        }

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some((line_end, next)) = find_eol(&self.buf[consumed..]) {
            let line = std::str::from_utf8(&self.buf[consumed..consumed + line_end])?.to_owned();
            consumed += next;
            if let Some(ev) = self.process_line(&line) {
                events.push(ev);
            }
        }
        self.buf.drain(..consumed);
        Ok(events)
    }

    /// Last event id seen so far.
    pub fn last_event_id(&self) -> &str {
        &self.last_id
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_id = value.to_string();
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(SseEvent {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            data: std::mem::take(&mut self.data),
            id: self.last_id.clone(),
            retry: self.retry,
        })
    }
}

/// Finds the next end-of-line in `bytes`.
///
/// Returns `(line_end, remainder_start)`, or `None` if more data is needed
/// (including a trailing CR that may be the first half of CRLF).
fn find_eol(bytes: &[u8]) -> Option<(usize, usize)> {
    let pos = bytes.iter().position(|&b| b == CR || b == LF)?;
    if bytes[pos] == LF {
        return Some((pos, pos + 1));
    }
    match bytes.get(pos + 1) {
        None => None,
        Some(&LF) => Some((pos, pos + 2)),
        Some(_) => Some((pos, pos + 1)),
    }
}
