//! Event values and their Server-Sent Events wire encoding.
//!
//! An [`Event`] is built with chained setters and rendered through `Display`
//! into the `text/event-stream` frame format: one `field: value` line per
//! field, multi-line data split across `data:` lines, and a blank line as
//! the frame terminator.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// A single server-sent event.
///
/// Every field is optional; an event with only a comment is a valid frame
/// (that is exactly what heartbeats are). `event` and `id` values must be
/// single-line, so newlines are stripped from them at build time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    name: Option<String>,
    id: Option<String>,
    data: Option<String>,
    retry: Option<u64>,
    comment: Option<String>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event type (`event:` field).
    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.name = Some(strip_newlines(name.into()));
        self
    }

    /// Set the event identifier (`id:` field), echoed back by reconnecting
    /// clients as the `last-event-id` header.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(strip_newlines(id.into()));
        self
    }

    /// Set the payload (`data:` field). Multi-line payloads are split into
    /// one `data:` line per segment when serialized.
    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the payload to the JSON encoding of `value`.
    pub fn json_data<T>(self, value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        Ok(self.data(serde_json::to_string(value)?))
    }

    /// Set the client reconnection delay (`retry:` field).
    pub fn retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry.as_millis() as u64);
        self
    }

    /// Set a comment (`:` line). A zero-length comment is the conventional
    /// heartbeat frame.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// The event identifier, if any.
    pub fn event_id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(comment) = &self.comment {
            for line in comment.split('\n') {
                writeln!(f, ":{}", line)?;
            }
        }
        if let Some(name) = &self.name {
            writeln!(f, "event: {}", name)?;
        }
        if let Some(id) = &self.id {
            writeln!(f, "id: {}", id)?;
        }
        if let Some(retry) = self.retry {
            writeln!(f, "retry: {}", retry)?;
        }
        if let Some(data) = &self.data {
            for line in data.split('\n') {
                writeln!(f, "data: {}", line)?;
            }
        }
        writeln!(f)
    }
}

fn strip_newlines(value: String) -> String {
    if value.contains(['\r', '\n']) {
        value.replace(['\r', '\n'], "")
    } else {
        value
    }
}

/// Extract the event identifier from a raw, pre-formatted frame.
///
/// Matches the first line of the form `id:<ws>*<token>` where `<token>` is a
/// single run of non-whitespace characters reaching the end of the line.
/// Frames that do not match are forwarded without history retention.
pub(crate) fn extract_id(raw: &str) -> Option<&str> {
    raw.lines().find_map(|line| {
        let rest = line.strip_prefix("id:")?.trim_start();
        if rest.is_empty() || rest.contains(char::is_whitespace) {
            None
        } else {
            Some(rest)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_frame_serialization() {
        let event = Event::new()
            .event("update")
            .id("42")
            .retry(Duration::from_millis(3000))
            .data("hello");
        assert_eq!(
            event.to_string(),
            "event: update\nid: 42\nretry: 3000\ndata: hello\n\n"
        );
    }

    #[test]
    fn test_multiline_data_is_split() {
        let event = Event::new().data("line one\nline two");
        assert_eq!(event.to_string(), "data: line one\ndata: line two\n\n");
    }

    #[test]
    fn test_heartbeat_comment_frame() {
        assert_eq!(Event::new().comment("").to_string(), ":\n\n");
    }

    #[test]
    fn test_comment_with_text() {
        assert_eq!(Event::new().comment("ka").to_string(), ":ka\n\n");
    }

    #[test]
    fn test_newlines_stripped_from_name_and_id() {
        let event = Event::new().event("up\ndate").id("4\r\n2").data("x");
        assert_eq!(event.to_string(), "event: update\nid: 42\ndata: x\n\n");
    }

    #[test]
    fn test_json_data() {
        #[derive(Serialize)]
        struct Payload {
            n: u32,
        }
        let event = Event::new().json_data(&Payload { n: 7 }).unwrap();
        assert_eq!(event.to_string(), "data: {\"n\":7}\n\n");
    }

    #[test]
    fn test_extract_id_well_formed() {
        assert_eq!(extract_id("data: x\nid: 42\n\n"), Some("42"));
        assert_eq!(extract_id("id:abc\n\n"), Some("abc"));
    }

    #[test]
    fn test_extract_id_rejects_malformed() {
        // Value must be a single token reaching the end of the line.
        assert_eq!(extract_id("id: 4 2\n\n"), None);
        assert_eq!(extract_id("id:\n\n"), None);
        assert_eq!(extract_id("id: 42 \n\n"), None);
        assert_eq!(extract_id("data: id: 42\n\n"), None);
    }

    #[test]
    fn test_extract_id_first_match_wins() {
        assert_eq!(extract_id("id: 1\nid: 2\n\n"), Some("1"));
    }

    #[test]
    fn test_serialized_frame_round_trips_through_extract_id() {
        let frame = Event::new().id("evt-9").data("x").to_string();
        assert_eq!(extract_id(&frame), Some("evt-9"));
    }
}
