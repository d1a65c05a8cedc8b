//! ContextCompressor: invoked on a context-overflow signal from a
//! [`crate::engine`] retry loop, applying an escalating level-parameterized
//! truncation/placeholder policy.

use crate::model::{Content, Message, Role};

/// Upper bound on `compressionLevel` before the caller must surface a
/// terminal context-exhausted error.
pub const MAX_COMPRESSION_LEVEL: u8 = 3;

fn keep_recent(level: u8) -> usize {
    (6i64 - 2 * level as i64).max(2) as usize
}

fn max_content_chars(level: u8) -> usize {
    (2000i64 - 500 * level as i64).max(500) as usize
}

/// Compress `messages` at `level` ∈ {1,2,3}.
pub struct ContextCompressor;

impl ContextCompressor {
    pub fn compress(messages: &[Message], level: u8) -> Vec<Message> {
        let keep_recent = keep_recent(level);
        let max_chars = max_content_chars(level);

        if messages.is_empty() {
            return Vec::new();
        }

        if messages.len() <= keep_recent + 1 {
            return messages
                .iter()
                .map(|m| truncate_message(m, max_chars))
                .collect();
        }

        let mut out = Vec::with_capacity(keep_recent + 3);

        // Message index 0 (system or first turn) is kept unchanged.
        out.push(messages[0].clone());

        let recent_start = messages.len() - keep_recent;
        let dropped = &messages[1..recent_start];

        if !dropped.is_empty() {
            let digest_text = if level == 1 {
                digest_of_first_three(dropped)
            } else {
                format!("[{} earlier messages elided]", dropped.len())
            };
            out.push(Message::user(digest_text));
            out.push(Message::assistant(
                "Understood, continuing with the summarized context.",
            ));
        }

        for message in &messages[recent_start..] {
            out.push(truncate_message(message, max_chars));
        }

        out
    }
}

fn digest_of_first_three(dropped: &[Message]) -> String {
    let lines: Vec<String> = dropped
        .iter()
        .take(3)
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let text = m.content.as_joined_text();
            let snippet: String = text.chars().take(120).collect();
            format!("- {role}: {snippet}")
        })
        .collect();
    format!(
        "[{} earlier messages elided; first {} summarized below]\n{}",
        dropped.len(),
        lines.len(),
        lines.join("\n")
    )
}

fn truncate_message(message: &Message, max_chars: usize) -> Message {
    match &message.content {
        Content::Text(text) => {
            if text.chars().count() <= max_chars {
                message.clone()
            } else {
                Message {
                    role: message.role,
                    content: Content::Text(truncate_with_suffix(text, max_chars)),
                }
            }
        }
        Content::Parts(_) => message.clone(),
    }
}

fn truncate_with_suffix(text: &str, max_chars: usize) -> String {
    let original_len = text.chars().count();
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}[truncated, original length: {original_len}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("user message {i}"))
                } else {
                    Message::assistant(format!("assistant message {i}"))
                }
            })
            .collect()
    }

    #[test]
    fn test_keep_recent_and_max_chars_formula() {
        assert_eq!(keep_recent(1), 4);
        assert_eq!(keep_recent(2), 2);
        assert_eq!(keep_recent(3), 2); // floor at 2
        assert_eq!(max_content_chars(1), 1500);
        assert_eq!(max_content_chars(2), 1000);
        assert_eq!(max_content_chars(3), 500);
    }

    #[test]
    fn test_short_history_only_truncates_content() {
        let msgs = messages(3);
        let out = ContextCompressor::compress(&msgs, 1);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_long_history_inserts_digest_pair_and_keeps_message_zero() {
        let msgs = messages(20);
        let out = ContextCompressor::compress(&msgs, 1);

        assert_eq!(out[0].content.as_joined_text(), msgs[0].content.as_joined_text());
        // index 0 + digest pair + keepRecent(4) tail messages.
        assert_eq!(out.len(), 1 + 2 + keep_recent(1));
        assert_eq!(out[1].role, Role::User);
        assert_eq!(out[2].role, Role::Assistant);
    }

    #[test]
    fn test_level_two_uses_fixed_notice_not_digest() {
        let msgs = messages(20);
        let out = ContextCompressor::compress(&msgs, 2);
        assert!(out[1].content.as_joined_text().contains("elided"));
        assert!(!out[1].content.as_joined_text().contains("- user:"));
    }

    #[test]
    fn test_truncates_oversized_tail_message_with_suffix() {
        let mut msgs = messages(20);
        let long_text = "x".repeat(3000);
        *msgs.last_mut().unwrap() = Message::assistant(long_text);

        let out = ContextCompressor::compress(&msgs, 1);
        let tail_text = out.last().unwrap().content.as_joined_text();
        assert!(tail_text.contains("[truncated, original length: 3000]"));
    }

    #[test]
    fn test_empty_messages_returns_empty() {
        assert!(ContextCompressor::compress(&[], 1).is_empty());
    }
}
