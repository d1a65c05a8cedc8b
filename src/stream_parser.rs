//! StreamParser-K: incrementally scans a raw, ever-growing byte buffer for
//! concatenated JSON objects with a known prefix set and yields typed
//! events, via a prefix-scan + depth/in-string/escape state machine that
//! restarts cleanly across chunk boundaries.

use serde_json::Value;

/// The five known JSON-object opening prefixes StreamParser-K scans for.
const PREFIXES: &[&str] = &[
    r#"{"content":"#,
    r#"{"name":"#,
    r#"{"followupPrompt":"#,
    r#"{"input":"#,
    r#"{"stop":"#,
];

/// A typed event yielded by [`StreamParser`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventK {
    Content(String),
    ToolUse {
        name: String,
        tool_use_id: String,
        partial_input: Option<String>,
        stop: bool,
    },
    ToolUseInput(String),
    ToolUseStop,
}

/// Restartable prefix-scanning state machine over an ever-growing byte
/// buffer: feeding the same bytes chunked at arbitrary boundaries yields
/// the same sequence of events.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a new chunk and drain as many complete events as the buffer
    /// currently contains. The unconsumed tail (an in-progress object, or
    /// bytes before the next known prefix) is retained for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEventK> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            let Some(prefix_pos) = self.earliest_prefix_position() else {
                // No complete known prefix in the buffer yet: it may be the
                // start of one straddling a chunk boundary, so keep it and
                // wait for more data rather than discarding it.
                break;
            };

            // Drop any bytes before the prefix; they can never start a
            // recognized object.
            if prefix_pos > 0 {
                self.buffer.drain(0..prefix_pos);
            }

            match find_matching_close(&self.buffer) {
                Some(end) => {
                    let object_bytes = self.buffer[..end].to_vec();
                    self.buffer.drain(0..end);

                    match serde_json::from_slice::<Value>(&object_bytes) {
                        Ok(value) => {
                            if let Some(event) = route(&value) {
                                events.push(event);
                            }
                        }
                        Err(_) => {
                            // Malformed JSON slice: discarded silently,
                            // scanning resumes past it.
                        }
                    }
                }
                None => {
                    // Incomplete object: wait for the next chunk.
                    break;
                }
            }
        }

        events
    }

    fn earliest_prefix_position(&self) -> Option<usize> {
        PREFIXES
            .iter()
            .filter_map(|p| find_subsequence(&self.buffer, p.as_bytes()))
            .min()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Walk `buffer` from index 0 (assumed to start at a `{`) tracking
/// (depth, in-string, escape-pending) to find the index just past the
/// matching top-level `}`. Returns `None` if the buffer ends before the
/// object closes.
fn find_matching_close(buffer: &[u8]) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in buffer.iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}

/// Route a parsed JSON object to its typed event by discriminant.
fn route(value: &Value) -> Option<StreamEventK> {
    let obj = value.as_object()?;

    if let Some(name) = obj.get("name").and_then(Value::as_str) {
        if let Some(tool_use_id) = obj.get("toolUseId").and_then(Value::as_str) {
            let partial_input = obj.get("input").map(|v| v.to_string());
            let stop = obj.get("stop").and_then(Value::as_bool).unwrap_or(false);
            return Some(StreamEventK::ToolUse {
                name: name.to_string(),
                tool_use_id: tool_use_id.to_string(),
                partial_input,
                stop,
            });
        }
    }

    if obj.contains_key("input") && !obj.contains_key("name") {
        let input = obj.get("input").map(|v| v.to_string()).unwrap_or_default();
        return Some(StreamEventK::ToolUseInput(input));
    }

    if let Some(content) = obj.get("content").and_then(Value::as_str) {
        if !obj.contains_key("followupPrompt") {
            return Some(StreamEventK::Content(content.to_string()));
        }
    }

    // Standalone `{"stop": ...}` object with neither name nor input: the
    // dedicated stop-of-stream discriminant.
    if obj.contains_key("stop") {
        return Some(StreamEventK::ToolUseStop);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_content_event() {
        let mut parser = StreamParser::new();
        let events = parser.feed(br#"{"content":"Hello"}"#);
        assert_eq!(events, vec![StreamEventK::Content("Hello".to_string())]);
    }

    #[test]
    fn test_event_split_across_chunk_boundary() {
        let mut parser = StreamParser::new();
        let whole = br#"{"content":"Hello world"}"#;
        let (first, second) = whole.split_at(10);

        assert!(parser.feed(first).is_empty());
        let events = parser.feed(second);
        assert_eq!(events, vec![StreamEventK::Content("Hello world".to_string())]);
    }

    #[test]
    fn test_chunked_at_every_byte_boundary_same_result() {
        let whole = br#"{"content":"a"}{"name":"ls","toolUseId":"t1","input":{"x":1},"stop":false}"#;

        let mut one_shot = StreamParser::new();
        let events_one_shot = one_shot.feed(whole);

        let mut byte_by_byte = StreamParser::new();
        let mut events_chunked = Vec::new();
        for byte in whole {
            events_chunked.extend(byte_by_byte.feed(&[*byte]));
        }

        assert_eq!(events_one_shot, events_chunked);
    }

    #[test]
    fn test_tool_use_event() {
        let mut parser = StreamParser::new();
        let events = parser.feed(br#"{"name":"ls","toolUseId":"t1","input":{},"stop":false}"#);
        assert_eq!(
            events,
            vec![StreamEventK::ToolUse {
                name: "ls".to_string(),
                tool_use_id: "t1".to_string(),
                partial_input: Some("{}".to_string()),
                stop: false,
            }]
        );
    }

    #[test]
    fn test_tool_use_input_continuation() {
        let mut parser = StreamParser::new();
        let events = parser.feed(br#"{"input":{"partial":"json"}}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEventK::ToolUseInput(_)));
    }

    #[test]
    fn test_stop_event() {
        let mut parser = StreamParser::new();
        let events = parser.feed(br#"{"stop":true}"#);
        assert_eq!(events, vec![StreamEventK::ToolUseStop]);
    }

    #[test]
    fn test_followup_prompt_is_not_a_content_event() {
        let mut parser = StreamParser::new();
        let events = parser.feed(br#"{"content":"x","followupPrompt":"y"}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn test_malformed_json_discarded_silently_scanning_resumes() {
        let mut parser = StreamParser::new();
        // Brace-balanced but syntactically invalid JSON value, followed by a
        // well-formed object: the first slice is discarded, scanning resumes
        // past it and recovers the second event.
        let input = br#"{"content": invalid}{"content":"ok"}"#;
        let events = parser.feed(input);
        assert_eq!(events, vec![StreamEventK::Content("ok".to_string())]);
    }

    #[test]
    fn test_leading_noise_before_prefix_is_dropped() {
        let mut parser = StreamParser::new();
        let events = parser.feed(br#"garbage-bytes{"content":"clean"}"#);
        assert_eq!(events, vec![StreamEventK::Content("clean".to_string())]);
    }
}
