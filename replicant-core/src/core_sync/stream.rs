/*
    stream.rs - Newline-delimited JSON stream parser

    One StreamConnection holds the parse state of one long-lived HTTP
    response. The body arrives in arbitrary chunks; every complete line is
    one JSON message.

    Workflow:
    1. on_header(status): a status >= 400 switches into error mode, the
       body is then only collected as error payload.
    2. on_data(chunk): scan forward from `checked_until` for '\n'. Each hit
       yields the slice [content_start, newline) as one candidate message.
    3. A candidate that is not JSON, or is JSON shaped like
       {type, msg} / {error: {type, msg}}, is an error instead of a message.
    4. on_finished() without a prior error is itself an error: the server
       never ends this stream on purpose.

    Every connection reports at most one error. After close() all input is
    ignored and nothing is emitted.

    ┌────────────┐  Header/Chunk/Finished/Failed  ┌──────────────────┐
    │ transport  │ ─────────────────────────────► │ StreamConnection │
    └────────────┘                                └────────┬─────────┘
                                                           │ Message(Value)
                                                           │ Error(StreamError)
                                                           ▼
                                                   ConnectionManager
*/

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::errors::{CommunicationError, ErrorType, StreamError};
use super::transport::TransportEvent;

/// Output of the parser
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// One decoded data message
    Message(Value),
    /// The (single) error of this connection
    Error(StreamError),
}

/// Classification of one complete line
enum Line {
    Blank,
    Message(Value),
    Error(CommunicationError),
}

/// Shape check for `{"type": string, "msg": string}`.
fn as_communication_error(value: &Value) -> Option<CommunicationError> {
    let object = value.as_object()?;
    let kind = object.get("type")?.as_str()?;
    let msg = object.get("msg")?.as_str()?;
    Some(CommunicationError::new(kind, msg))
}

/// Structured error, either bare or wrapped in `{"error": ...}`.
fn structured_error(value: &Value) -> Option<CommunicationError> {
    as_communication_error(value).or_else(|| value.get("error").and_then(as_communication_error))
}

fn trim_line(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn classify(line: &[u8]) -> Line {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Line::Blank;
    }
    match serde_json::from_slice::<Value>(line) {
        Ok(value) => match structured_error(&value) {
            Some(error) => Line::Error(error),
            None => Line::Message(value),
        },
        Err(_) => Line::Error(CommunicationError::unknown(
            String::from_utf8_lossy(line).into_owned(),
        )),
    }
}

fn ends_with_brace(body: &[u8]) -> bool {
    body.iter()
        .rev()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'}')
}

/// Interpret a whole body as an error payload. Anything that is not a
/// structured error becomes an "unknown" error carrying the raw text.
fn error_payload(body: &[u8]) -> Option<CommunicationError> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let parsed = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| structured_error(&value));
    Some(parsed.unwrap_or_else(|| CommunicationError::unknown(text)))
}

/// Parse state of one streaming response
#[derive(Debug, Default)]
pub struct StreamConnection {
    buffer: Vec<u8>,
    /// Everything before this offset has been scanned for '\n'
    checked_until: usize,
    /// Start of the message currently being received
    content_start: usize,
    status: Option<u16>,
    has_error: bool,
    reported_error: bool,
    closed: bool,
    error_content: Option<CommunicationError>,
}

impl StreamConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn has_reported_error(&self) -> bool {
        self.reported_error
    }

    /// Payload of the reported error, if the server sent one.
    pub fn error_content(&self) -> Option<&CommunicationError> {
        self.error_content.as_ref()
    }

    /// Bytes received but not yet consumed as messages.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.content_start
    }

    /// Feed one transport event.
    pub fn on_event(&mut self, event: TransportEvent) -> Vec<StreamEvent> {
        match event {
            TransportEvent::Header { status } => {
                self.on_header(status);
                Vec::new()
            }
            TransportEvent::Chunk(bytes) => self.on_data(&bytes),
            TransportEvent::Finished => self.on_finished().into_iter().collect(),
            TransportEvent::Failed(message) => self.on_network_error(&message).into_iter().collect(),
        }
    }

    pub fn on_header(&mut self, status: u16) {
        if self.closed {
            return;
        }
        self.status = Some(status);
        if status >= 400 {
            debug!(status, "stream answered with error status");
            self.has_error = true;
        }
    }

    pub fn on_data(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.closed || self.reported_error {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        if self.has_error {
            // Only report early if the payload is already a complete
            // structured error, otherwise wait for the end of the body.
            // A JSON object can only be complete once it ends in '}'.
            if !chunk.contains(&b'}') || !ends_with_brace(&self.buffer) {
                return events;
            }
            let complete = serde_json::from_slice::<Value>(&self.buffer)
                .ok()
                .and_then(|value| structured_error(&value));
            if let Some(content) = complete {
                events.extend(self.report(Some(content), "Reported error by server"));
            }
            return events;
        }

        while self.checked_until < self.buffer.len() {
            let newline = self.buffer[self.checked_until..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.checked_until + offset);

            let Some(newline) = newline else {
                self.checked_until = self.buffer.len();
                break;
            };

            let line = classify(trim_line(&self.buffer[self.content_start..newline]));
            self.checked_until = newline + 1;
            self.content_start = newline + 1;

            match line {
                Line::Blank => continue,
                Line::Message(value) => {
                    trace!("stream message received");
                    events.push(StreamEvent::Message(value));
                }
                Line::Error(content) => {
                    self.has_error = true;
                    events.extend(self.report(Some(content), "Reported error by server"));
                    break;
                }
            }
        }

        self.compact();
        events
    }

    /// The response body ended.
    pub fn on_finished(&mut self) -> Option<StreamEvent> {
        if self.closed || self.reported_error {
            return None;
        }
        if self.has_error {
            let content = error_payload(&self.buffer);
            return self.report(content, "Reported error by server");
        }
        self.report(None, "The stream was closed unexpectedly")
    }

    /// The underlying request failed.
    pub fn on_network_error(&mut self, message: &str) -> Option<StreamEvent> {
        if self.closed || self.reported_error {
            return None;
        }
        if self.has_error {
            let content = error_payload(&self.buffer);
            return self.report(content, "Reported error by server");
        }
        self.reported_error = true;
        Some(StreamEvent::Error(StreamError::new(
            ErrorType::Server,
            None,
            format!("Network error: {}", message),
        )))
    }

    /// Stop processing. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.buffer = Vec::new();
            self.checked_until = 0;
            self.content_start = 0;
        }
    }

    fn report(&mut self, content: Option<CommunicationError>, message: &str) -> Option<StreamEvent> {
        if self.reported_error {
            return None;
        }
        self.reported_error = true;
        self.has_error = true;

        // an unexpected end of a healthy stream is a server side problem
        let healthy = self.status.map_or(true, |status| status < 400);
        let error_type = if content.is_none() && healthy {
            ErrorType::Server
        } else {
            ErrorType::from_status(self.status)
        };
        if let Some(content) = &content {
            warn!(%content, %error_type, "stream reported error");
        }
        self.error_content = content.clone();
        Some(StreamEvent::Error(StreamError::new(error_type, content, message)))
    }

    /// Drop consumed bytes so long-lived streams do not grow unbounded.
    fn compact(&mut self) {
        if self.content_start == 0 {
            return;
        }
        self.buffer.drain(..self.content_start);
        self.checked_until -= self.content_start;
        self.content_start = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn messages(events: &[StreamEvent]) -> Vec<Value> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Message(v) => Some(v.clone()),
                StreamEvent::Error(_) => None,
            })
            .collect()
    }

    fn errors(events: &[StreamEvent]) -> Vec<StreamError> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Error(err) => Some(err.clone()),
                StreamEvent::Message(_) => None,
            })
            .collect()
    }

    const BODY: &str = concat!(
        "{\"connected\":true}\n",
        "{\"changed\":{\"users\":[{\"id\":5,\"name\":\"A\"}]},\"from_change_id\":11,\"to_change_id\":11}\n",
        "\n",
        "{\"deleted\":{\"users\":[5]},\"from_change_id\":12,\"to_change_id\":12}\n",
    );

    #[test]
    fn test_whole_buffer() {
        let mut conn = StreamConnection::new();
        conn.on_header(200);
        let events = conn.on_data(BODY.as_bytes());
        let msgs = messages(&events);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0], json!({"connected": true}));
        assert_eq!(msgs[2]["to_change_id"], 12);
        assert!(errors(&events).is_empty());
        assert_eq!(conn.buffered(), 0);
    }

    #[test]
    fn test_message_split_across_chunks() {
        let mut conn = StreamConnection::new();
        assert!(conn.on_data(b"{\"a\":").is_empty());
        assert!(conn.on_data(b" 1").is_empty());
        let events = conn.on_data(b"}\n{\"b\":2}");
        assert_eq!(messages(&events), vec![json!({"a": 1})]);
        assert_eq!(conn.buffered(), 7);
        let events = conn.on_data(b"\n");
        assert_eq!(messages(&events), vec![json!({"b": 2})]);
    }

    #[test]
    fn test_every_split_offset_yields_same_messages() {
        let mut reference = StreamConnection::new();
        let expected = messages(&reference.on_data(BODY.as_bytes()));

        let bytes = BODY.as_bytes();
        for split in 0..=bytes.len() {
            let mut conn = StreamConnection::new();
            let mut events = conn.on_data(&bytes[..split]);
            events.extend(conn.on_data(&bytes[split..]));
            assert_eq!(messages(&events), expected, "split at {}", split);
        }
    }

    proptest! {
        #[test]
        fn prop_chunking_is_irrelevant(cuts in proptest::collection::vec(0usize..200, 0..12)) {
            let bytes = BODY.as_bytes();
            let mut reference = StreamConnection::new();
            let expected = messages(&reference.on_data(bytes));

            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (bytes.len() + 1)).collect();
            cuts.sort_unstable();

            let mut conn = StreamConnection::new();
            let mut events = Vec::new();
            let mut start = 0;
            for cut in cuts {
                events.extend(conn.on_data(&bytes[start..cut]));
                start = cut;
            }
            events.extend(conn.on_data(&bytes[start..]));
            prop_assert_eq!(messages(&events), expected);
        }
    }

    #[test]
    fn test_structured_error_in_stream() {
        let mut conn = StreamConnection::new();
        conn.on_header(200);
        let events = conn.on_data(b"{\"a\":1}\n{\"type\":\"ChangeIdTooLow\",\"msg\":\"nope\"}\n{\"b\":2}\n");
        assert_eq!(messages(&events), vec![json!({"a": 1})]);
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].content, Some(CommunicationError::new("ChangeIdTooLow", "nope")));
        assert!(conn.has_reported_error());

        // later data is ignored, no second report
        assert!(conn.on_data(b"garbage\n").is_empty());
        assert!(conn.on_finished().is_none());
    }

    #[test]
    fn test_wrapped_error_in_stream() {
        let mut conn = StreamConnection::new();
        let events = conn.on_data(b"{\"error\":{\"type\":\"auth_required\",\"msg\":\"login\"}}\n");
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].content.as_ref().unwrap().is_auth_required());
    }

    #[test]
    fn test_malformed_line_is_unknown_error() {
        let mut conn = StreamConnection::new();
        let events = conn.on_data(b"<html>bad gateway</html>\n");
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        let content = errs[0].content.clone().unwrap();
        assert_eq!(content.kind, "Unknown Error");
        assert_eq!(content.msg, "<html>bad gateway</html>");
    }

    #[test]
    fn test_error_status_reports_structured_body() {
        let mut conn = StreamConnection::new();
        conn.on_header(403);
        assert!(conn.on_data(b"{\"error\": {\"type\": \"auth_required\",").is_empty());
        let events = conn.on_data(b" \"msg\": \"login\"}}");
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].error_type, ErrorType::Client);
        assert!(errs[0].is_auth_failure());
        assert!(conn.on_finished().is_none());
    }

    #[test]
    fn test_error_body_rechecked_only_on_closing_brace() {
        let mut conn = StreamConnection::new();
        conn.on_header(500);
        assert!(conn.on_data(b"{\"type\": \"Server\", ").is_empty());
        // brace inside an unterminated string does not complete the value
        assert!(conn.on_data(b"\"msg\": \"a}").is_empty());
        assert!(conn.on_data(b" b\"").is_empty());
        let events = conn.on_data(b"}\n");
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].content.clone().unwrap().msg, "a} b");
    }

    #[test]
    fn test_ends_with_brace() {
        assert!(ends_with_brace(b"{\"a\":1}"));
        assert!(ends_with_brace(b"{}\r\n  "));
        assert!(!ends_with_brace(b"{\"a\":"));
        assert!(!ends_with_brace(b"   "));
    }

    #[test]
    fn test_error_status_with_html_body_reported_at_end() {
        let mut conn = StreamConnection::new();
        conn.on_header(502);
        assert!(conn.on_data(b"<html>Bad Gateway\n</html>\n").is_empty());
        match conn.on_finished() {
            Some(StreamEvent::Error(err)) => {
                assert_eq!(err.error_type, ErrorType::Server);
                assert_eq!(err.content.unwrap().msg, "<html>Bad Gateway\n</html>");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_finish_without_error_is_error() {
        let mut conn = StreamConnection::new();
        conn.on_header(200);
        conn.on_data(b"{\"a\":1}\n");
        match conn.on_finished() {
            Some(StreamEvent::Error(err)) => {
                assert_eq!(err.message, "The stream was closed unexpectedly");
                assert!(err.content.is_none());
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert!(conn.on_finished().is_none());
    }

    #[test]
    fn test_network_error_reported_once() {
        let mut conn = StreamConnection::new();
        assert!(conn.on_network_error("connection reset").is_some());
        assert!(conn.on_network_error("connection reset").is_none());
    }

    #[test]
    fn test_nothing_after_close() {
        let mut conn = StreamConnection::new();
        conn.on_data(b"{\"a\":");
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(conn.on_data(b"1}\n{\"b\":2}\n").is_empty());
        assert!(conn.on_finished().is_none());
        assert!(conn.on_network_error("late").is_none());
    }

    #[test]
    fn test_carriage_return_tolerated() {
        let mut conn = StreamConnection::new();
        let events = conn.on_data(b"{\"a\":1}\r\n");
        assert_eq!(messages(&events), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_on_event_dispatch() {
        let mut conn = StreamConnection::new();
        assert!(conn.on_event(TransportEvent::Header { status: 200 }).is_empty());
        let events = conn.on_event(TransportEvent::Chunk(bytes::Bytes::from_static(b"{\"x\":1}\n")));
        assert_eq!(messages(&events), vec![json!({"x": 1})]);
        let events = conn.on_event(TransportEvent::Finished);
        assert_eq!(errors(&events).len(), 1);
    }
}
