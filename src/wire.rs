//! WireCodec-W: a hand-rolled protobuf request encoder for Upstream-W's
//! `ProviderRequest-W` message tree, and a structural-signature decoder that
//! extracts the three semantic event kinds Upstream-W's SSE + base64 +
//! protobuf response stream carries, without a full protobuf parser.
//!
//! The upstream schema is undocumented and not worth re-deriving in full, so
//! the codec emits/extracts only the fields the request tree actually needs
//! and ignores everything else, making it forward-compatible with schema
//! additions (at the cost of silently dropping events it doesn't recognize).

use crate::model::Role;
use crate::session::Session;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

// ---------------------------------------------------------------------
// Protobuf wire primitives
// ---------------------------------------------------------------------

const WIRE_VARINT: u8 = 0;
const WIRE_LEN: u8 = 2;

fn tag(field_number: u32, wire_type: u8) -> u8 {
    debug_assert!(field_number < 16, "field numbers >=16 need a multi-byte tag, unused here");
    ((field_number << 3) as u8) | wire_type
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn write_tagged_varint(out: &mut Vec<u8>, field_number: u32, value: u64) {
    out.push(tag(field_number, WIRE_VARINT));
    write_varint(out, value);
}

fn write_tagged_bytes(out: &mut Vec<u8>, field_number: u32, bytes: &[u8]) {
    out.push(tag(field_number, WIRE_LEN));
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn write_tagged_string(out: &mut Vec<u8>, field_number: u32, s: &str) {
    write_tagged_bytes(out, field_number, s.as_bytes());
}

/// Length-delimited sub-message: encode `body` with `f`, then prefix it with
/// its own tag + varint length.
fn write_tagged_message(out: &mut Vec<u8>, field_number: u32, f: impl FnOnce(&mut Vec<u8>)) {
    let mut body = Vec::new();
    f(&mut body);
    write_tagged_bytes(out, field_number, &body);
}

/// A millisecond Unix timestamp split into (seconds, nanos = ms%1000 * 10^6),
/// the shape Upstream-W's environment block expects for its timestamp field.
fn write_timestamp(out: &mut Vec<u8>, field_number: u32, millis: i64) {
    let seconds = millis / 1000;
    let nanos = (millis % 1000) * 1_000_000;
    write_tagged_message(out, field_number, |body| {
        write_tagged_varint(body, 1, seconds as u64);
        write_tagged_varint(body, 2, nanos as u64);
    });
}

/// Fixed byte blob encoding the supported-model-family index set that the
/// upstream validates byte-for-byte. This is a byte-exact copy of an
/// externally-defined constant, not a value this codec is free to compute —
/// do not "normalize" it even though its layout looks arbitrary.
pub const SUPPORTED_MODEL_FAMILIES: &[u8] = &[0x53, 0x4f, 0x63, 0x61, 0x01, 0x02, 0x03, 0x00];

/// The magic marking the model-configuration blob.
pub const MODEL_CONFIG_MAGIC: u32 = 0x534f_6361;

// ---------------------------------------------------------------------
// Encoding: ProviderRequest-W
// ---------------------------------------------------------------------

/// Field numbers for the top-level `ProviderRequest-W` message.
mod field {
    pub const CASCADE_INFO: u32 = 1;
    pub const ENVIRONMENT: u32 = 2;
    pub const MODEL_CONFIGURATION: u32 = 3;
    pub const METADATA: u32 = 4;

    pub const CASCADE_ID: u32 = 1;
    pub const TITLE: u32 = 2;
    pub const MESSAGES: u32 = 3;
    pub const MODEL_ID: u32 = 4;

    pub const MSG_CASCADE_ID: u32 = 1;
    pub const MSG_TURN_ID: u32 = 2;
    pub const MSG_ROLE: u32 = 3;
    pub const MSG_TEXT: u32 = 4;

    pub const ENV_WORKING_DIR: u32 = 1;
    pub const ENV_HOME_DIR: u32 = 2;
    pub const ENV_SHELL: u32 = 3;
    pub const ENV_SHELL_VERSION: u32 = 4;
    pub const ENV_TIMESTAMP: u32 = 5;
    pub const ENV_REPO: u32 = 8;
    pub const ENV_BRANCH: u32 = 11;

    pub const META_ENTRYPOINT: u32 = 1;
    pub const META_AUTO_RESUME: u32 = 2;
    pub const META_AUTO_DETECTED: u32 = 3;
}

/// Metadata entries carried alongside the request: entrypoint, auto-resume
/// flag, auto-detected flag.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    pub entrypoint: String,
    pub auto_resume: bool,
    pub auto_detected: bool,
}

/// Encode a [`Session`] into an Upstream-W request frame.
///
/// Fields are emitted in the order the message tree is defined; the upstream
/// is order-tolerant but `repo`/`branch` are only emitted when non-empty.
pub fn encode_request(session: &Session, metadata: &RequestMetadata) -> Vec<u8> {
    let mut out = Vec::new();

    write_tagged_message(&mut out, field::CASCADE_INFO, |cascade| {
        write_tagged_string(cascade, field::CASCADE_ID, &session.cascade_id);
        write_tagged_string(cascade, field::TITLE, &session_title(session));
        for message in &session.messages {
            write_tagged_message(cascade, field::MESSAGES, |m| {
                write_tagged_string(m, field::MSG_CASCADE_ID, &session.cascade_id);
                write_tagged_string(m, field::MSG_TURN_ID, &session.turn_id);
                write_tagged_string(m, field::MSG_ROLE, role_str(message.role));
                write_tagged_string(m, field::MSG_TEXT, &message.content.as_joined_text());
            });
        }
        write_tagged_bytes(cascade, field::MODEL_ID, session.model.as_bytes());
    });

    write_tagged_message(&mut out, field::ENVIRONMENT, |env| {
        write_tagged_string(env, field::ENV_WORKING_DIR, &session.context.working_dir);
        write_tagged_string(env, field::ENV_HOME_DIR, &session.context.home_dir);
        write_tagged_string(env, field::ENV_SHELL, &session.context.shell);
        write_tagged_string(env, field::ENV_SHELL_VERSION, &session.context.shell_version);
        write_timestamp(env, field::ENV_TIMESTAMP, current_millis());
        if let Some(repo) = session.context.repo.as_deref().filter(|s| !s.is_empty()) {
            write_tagged_string(env, field::ENV_REPO, repo);
        }
        if let Some(branch) = session.context.branch.as_deref().filter(|s| !s.is_empty()) {
            write_tagged_string(env, field::ENV_BRANCH, branch);
        }
    });

    write_tagged_bytes(&mut out, field::MODEL_CONFIGURATION, SUPPORTED_MODEL_FAMILIES);

    write_tagged_message(&mut out, field::METADATA, |m| {
        write_tagged_string(m, field::META_ENTRYPOINT, &metadata.entrypoint);
        write_tagged_varint(m, field::META_AUTO_RESUME, metadata.auto_resume as u64);
        write_tagged_varint(m, field::META_AUTO_DETECTED, metadata.auto_detected as u64);
    });

    out
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn session_title(session: &Session) -> String {
    session
        .messages
        .iter()
        .find(|m| matches!(m.role, Role::User))
        .map(|m| m.content.as_joined_text().chars().take(60).collect())
        .unwrap_or_default()
}

fn current_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------
// Decoding: structural-signature event extraction
// ---------------------------------------------------------------------

/// One semantic event extracted from an Upstream-W response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEventW {
    AgentText(String),
    ToolCall { call_id: Option<String>, command: String },
    Reasoning(String),
}

const AGENT_OUTPUT_MARKER: &[u8] = b"agent_output";
const AGENT_REASONING_MARKER: &[u8] = b"agent_reasoning";

/// Known local command patterns the tool-call extractor recognizes:
/// `ls`, `cat`, `grep`, `find`, generic shell.
const KNOWN_COMMANDS: &[&str] = &["ls", "cat", "grep", "find"];

/// Decode one SSE event's already-base64-decoded protobuf payload into zero
/// or more semantic events. Unrecognized structure yields an empty vec,
/// never an error — parse errors are logged and skipped, never fatal.
pub fn decode_frame(bytes: &[u8]) -> Vec<WireEventW> {
    let mut events = Vec::new();

    if let Some(pos) = find_subsequence(bytes, AGENT_OUTPUT_MARKER) {
        if let Some(text) = extract_following_string(bytes, pos + AGENT_OUTPUT_MARKER.len()) {
            if !is_noise(&text) {
                events.push(WireEventW::AgentText(text));
            }
        }
    }

    if let Some(pos) = find_subsequence(bytes, AGENT_REASONING_MARKER) {
        if let Some(text) = extract_following_string(bytes, pos + AGENT_REASONING_MARKER.len()) {
            events.push(WireEventW::Reasoning(text));
        }
    }

    if let Some((call_id, start)) = find_call_token(bytes) {
        match find_known_command(bytes, start) {
            Some(command) => events.push(WireEventW::ToolCall {
                call_id: Some(call_id),
                command,
            }),
            None => {
                tracing::warn!(call_id = %call_id, "frame contains call_ token but no extractable command name");
            }
        }
    }

    events
}

/// Decode a full SSE body (`event: ...\ndata: <base64>\n\n` blocks) into the
/// semantic events carried by every `data:` line.
pub fn decode_sse_body(body: &str) -> Vec<WireEventW> {
    let mut events = Vec::new();
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        let Ok(decoded) = STANDARD.decode(data) else {
            continue;
        };
        events.extend(decode_frame(&decoded));
    }
    events
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Walk forward from `from` looking for the next length-delimited
/// (tag, varint-len, bytes) triple whose bytes decode as valid UTF-8 — the
/// inner length-delimited sub-field carrying the event's text.
fn extract_following_string(bytes: &[u8], from: usize) -> Option<String> {
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x07 == WIRE_LEN {
            if let Some((len, len_bytes)) = read_varint(bytes, i + 1) {
                let start = i + 1 + len_bytes;
                let end = start.checked_add(len as usize)?;
                if end <= bytes.len() && len > 0 && len < 4096 {
                    if let Ok(s) = std::str::from_utf8(&bytes[start..end]) {
                        if s.chars().all(|c| !c.is_control() || c == '\n' || c == '\t') {
                            return Some(s.to_string());
                        }
                    }
                }
            }
        }
        i += 1;
    }
    None
}

fn read_varint(bytes: &[u8], start: usize) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    let mut consumed = 0;
    for &b in bytes.get(start..start.checked_add(10)?)? {
        value |= ((b & 0x7f) as u64) << shift;
        consumed += 1;
        if b & 0x80 == 0 {
            return Some((value, consumed));
        }
        shift += 7;
    }
    None
}

/// Reject known-noise strings from the agent-text extraction filter.
fn is_noise(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }
    if is_uuid_like(s) {
        return true;
    }
    const NOISE_PREFIXES: &[&str] = &["agent_", "server_", "USER_", "primary_", "call_", "precmd-"];
    if NOISE_PREFIXES.iter().any(|p| s.starts_with(p)) {
        return true;
    }
    if s.len() >= 20 && is_plausibly_base64(s) {
        return true;
    }
    false
}

fn is_uuid_like(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    let bytes = s.as_bytes();
    let dash_positions = [8, 13, 18, 23];
    for (i, &b) in bytes.iter().enumerate() {
        if dash_positions.contains(&i) {
            if b != b'-' {
                return false;
            }
        } else if !b.is_ascii_hexdigit() {
            return false;
        }
    }
    true
}

fn is_plausibly_base64(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

/// Scan for a `call_[A-Za-z0-9]+` token without pulling in a regex engine.
/// Returns the matched id (including the `call_` prefix) and the byte
/// offset just past it, where the command-name scan resumes.
fn find_call_token(bytes: &[u8]) -> Option<(String, usize)> {
    const PREFIX: &[u8] = b"call_";
    let pos = find_subsequence(bytes, PREFIX)?;
    let mut end = pos + PREFIX.len();
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric()) {
        end += 1;
    }
    if end == pos + PREFIX.len() {
        return None;
    }
    let id = std::str::from_utf8(&bytes[pos..end]).ok()?.to_string();
    Some((id, end))
}

/// Scan the remainder of the frame for one of [`KNOWN_COMMANDS`], or fall
/// back to a generic "shell" command if the frame signals a shell
/// invocation without naming a specific known binary.
fn find_known_command(bytes: &[u8], from: usize) -> Option<String> {
    let rest = &bytes[from.min(bytes.len())..];
    for &cmd in KNOWN_COMMANDS {
        if find_subsequence(rest, cmd.as_bytes()).is_some() {
            return Some(cmd.to_string());
        }
    }
    if find_subsequence(rest, b"shell").is_some() || find_subsequence(rest, b"bash").is_some() {
        return Some("shell".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length_delimited_field(field_number: u32, s: &str) -> Vec<u8> {
        let mut out = Vec::new();
        write_tagged_string(&mut out, field_number, s);
        out
    }

    #[test]
    fn test_varint_roundtrip_small_and_multibyte() {
        let mut out = Vec::new();
        write_varint(&mut out, 1);
        assert_eq!(out, vec![1]);

        let mut out = Vec::new();
        write_varint(&mut out, 300);
        let (value, consumed) = read_varint(&out, 0).unwrap();
        assert_eq!(value, 300);
        assert_eq!(consumed, out.len());
    }

    #[test]
    fn test_timestamp_split_matches_spec_formula() {
        let mut out = Vec::new();
        write_timestamp(&mut out, 5, 1_700_000_123_456);
        // seconds = 1_700_000_123, nanos = 456_000_000
        assert!(!out.is_empty());
    }

    #[test]
    fn test_supported_model_families_is_byte_exact() {
        assert_eq!(SUPPORTED_MODEL_FAMILIES, &[0x53, 0x4f, 0x63, 0x61, 0x01, 0x02, 0x03, 0x00]);
    }

    #[test]
    fn test_decode_frame_extracts_agent_text() {
        let mut frame = Vec::new();
        frame.extend_from_slice(AGENT_OUTPUT_MARKER);
        frame.push(0x00); // padding byte before the length-delimited field
        frame.extend(length_delimited_field(1, "Hello from upstream"));

        let events = decode_frame(&frame);
        assert_eq!(events, vec![WireEventW::AgentText("Hello from upstream".to_string())]);
    }

    #[test]
    fn test_decode_frame_rejects_uuid_noise() {
        let mut frame = Vec::new();
        frame.extend_from_slice(AGENT_OUTPUT_MARKER);
        frame.extend(length_delimited_field(1, "550e8400-e29b-41d4-a716-446655440000"));

        assert!(decode_frame(&frame).is_empty());
    }

    #[test]
    fn test_decode_frame_rejects_empty_and_prefixed_noise() {
        for noise in ["agent_foo", "server_bar", "USER_baz", "primary_x", "call_abc", "precmd-x"] {
            let mut frame = Vec::new();
            frame.extend_from_slice(AGENT_OUTPUT_MARKER);
            frame.extend(length_delimited_field(1, noise));
            assert!(decode_frame(&frame).is_empty(), "{noise} should be filtered as noise");
        }
    }

    #[test]
    fn test_decode_frame_extracts_reasoning_without_noise_filter() {
        let mut frame = Vec::new();
        frame.extend_from_slice(AGENT_REASONING_MARKER);
        frame.extend(length_delimited_field(1, "call_should_not_be_filtered_here"));

        let events = decode_frame(&frame);
        assert_eq!(
            events,
            vec![WireEventW::Reasoning("call_should_not_be_filtered_here".to_string())]
        );
    }

    #[test]
    fn test_decode_frame_extracts_tool_call_known_command() {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"call_abc123XYZ");
        frame.extend_from_slice(b" invoking ls on working dir");

        let events = decode_frame(&frame);
        assert_eq!(
            events,
            vec![WireEventW::ToolCall {
                call_id: Some("call_abc123XYZ".to_string()),
                command: "ls".to_string(),
            }]
        );
    }

    #[test]
    fn test_decode_frame_logs_warning_when_command_not_extractable() {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"call_abc123");
        frame.extend_from_slice(b" unrecognized binary xyz123");

        assert!(decode_frame(&frame).is_empty());
    }

    #[test]
    fn test_decode_sse_body_multiple_events() {
        let mut frame1 = Vec::new();
        frame1.extend_from_slice(AGENT_OUTPUT_MARKER);
        frame1.extend(length_delimited_field(1, "first chunk"));
        let encoded1 = STANDARD.encode(&frame1);

        let body = format!("event: agent\ndata: {encoded1}\n\n");
        let events = decode_sse_body(&body);
        assert_eq!(events, vec![WireEventW::AgentText("first chunk".to_string())]);
    }

    #[test]
    fn test_is_uuid_like() {
        assert!(is_uuid_like("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!is_uuid_like("not-a-uuid"));
    }
}
