//! Server-sent-event framing for streaming operations.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Event types a streaming operation emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    MessageChunk,
    Finish,
    Error,
    Debug,
}

impl StreamEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageChunk => "message_chunk",
            Self::Finish => "finish",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for StreamEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders one `event: <type>\ndata: <json>\n\n` frame.
///
/// A string payload becomes `{"content": s}`; empty payloads (null, `""`,
/// `{}`) become `{}`.
#[must_use]
pub fn make_stream_event(event_type: StreamEventType, data: impl Into<Value>) -> String {
    let data = match data.into() {
        Value::Null => json!({}),
        Value::String(s) if s.is_empty() => json!({}),
        Value::String(s) => json!({ "content": s }),
        other => other,
    };
    format!("event: {event_type}\ndata: {data}\n\n")
}

/// Whether `chunk` is already a framed server-sent event.
#[must_use]
pub fn is_stream_frame(chunk: &str) -> bool {
    chunk.starts_with("event: ") && chunk.contains("\ndata: ")
}

/// Event type named on the `event:` line of a frame.
#[must_use]
pub fn frame_event_type(frame: &str) -> Option<&str> {
    frame
        .lines()
        .find_map(|line| line.strip_prefix("event: "))
        .map(str::trim)
}

/// Parsed JSON payload of a frame's `data:` line.
#[must_use]
pub fn frame_data(frame: &str) -> Option<Value> {
    frame
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .and_then(|data| serde_json::from_str(data).ok())
}

/// Frames a streamed chunk: existing frames pass through, a bare `finish`
/// marks the end of the stream, anything else is a message chunk.
#[must_use]
pub fn frame_chunk(chunk: &str) -> String {
    if is_stream_frame(chunk) {
        chunk.to_string()
    } else if chunk == StreamEventType::Finish.as_str() {
        make_stream_event(StreamEventType::Finish, Value::Null)
    } else {
        make_stream_event(StreamEventType::MessageChunk, chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_payload_wraps_as_content() {
        let frame = make_stream_event(StreamEventType::MessageChunk, "hi");
        assert_eq!(frame, "event: message_chunk\ndata: {\"content\":\"hi\"}\n\n");
    }

    #[test]
    fn empty_payload_becomes_empty_object() {
        assert_eq!(
            make_stream_event(StreamEventType::Finish, Value::Null),
            "event: finish\ndata: {}\n\n"
        );
        assert_eq!(
            make_stream_event(StreamEventType::Debug, ""),
            "event: debug\ndata: {}\n\n"
        );
    }

    #[test]
    fn non_ascii_is_kept_verbatim() {
        let frame = make_stream_event(StreamEventType::MessageChunk, "你好");
        assert!(frame.contains("你好"));
    }

    #[test]
    fn frames_are_inspectable() {
        let frame = make_stream_event(StreamEventType::Error, json!({"code": 3}));
        assert!(is_stream_frame(&frame));
        assert_eq!(frame_event_type(&frame), Some("error"));
        assert_eq!(frame_data(&frame), Some(json!({"code": 3})));
    }

    #[test]
    fn chunk_sequence_frames_in_order() {
        let events: Vec<_> = ["a", "b", "finish"]
            .iter()
            .map(|c| frame_chunk(c))
            .collect();
        let types: Vec<_> = events.iter().filter_map(|f| frame_event_type(f)).collect();
        assert_eq!(types, vec!["message_chunk", "message_chunk", "finish"]);
        assert_eq!(frame_data(&events[0]), Some(json!({"content": "a"})));
    }

    #[test]
    fn existing_frames_pass_through() {
        let frame = make_stream_event(StreamEventType::Debug, json!({"step": 1}));
        assert_eq!(frame_chunk(&frame), frame);
    }
}
