//! RequestAssembler: the pre-dispatch shaping pass applied to an external
//! [`ChatRequest`] before it is handed to a [`crate::engine`] — system-prompt
//! placement, adjacent-role coalescing, tool filtering, last-message
//! extraction, fallback content, and tool-result dedup.

use crate::model::{ChatRequest, Content, ContentPart, Message, Role, ToolSpec};
use std::collections::HashSet;

const TOOL_USE_GUIDELINE: &str =
    "Use the available tools when they would help answer the request.";

/// Provider-specific tool-name denylist, e.g. `Bash` is unavailable on Engine-K.
pub fn denylist_for(provider: crate::config::ProviderTag) -> &'static [&'static str] {
    match provider {
        crate::config::ProviderTag::K => &["Bash"],
        crate::config::ProviderTag::W => &[],
        crate::config::ProviderTag::O => &[],
    }
}

/// Assemble a provider-ready message list and tool set from an external
/// [`ChatRequest`].
pub struct RequestAssembler;

impl RequestAssembler {
    /// Run the full assembly pipeline, returning the reshaped messages and
    /// the filtered tool list.
    pub fn assemble(
        request: &ChatRequest,
        denylist: &[&str],
    ) -> (Vec<Message>, Option<Vec<ToolSpec>>) {
        let mut messages = request.messages.clone();

        Self::place_system_prompt(&mut messages, request.system.as_ref());
        let messages = Self::coalesce_adjacent_roles(messages);
        let messages = Self::extract_last_message(messages);
        let messages = Self::apply_fallback_content(messages);
        let messages = Self::dedup_tool_results(messages);

        let tools = Self::filter_tools(request.tools.as_ref(), denylist);

        (messages, tools)
    }

    /// (a) System-prompt placement: concatenate the tool-use guideline, fold
    /// into the first user message if one exists, else synthesize a
    /// standalone user turn carrying the prompt.
    fn place_system_prompt(messages: &mut Vec<Message>, system: Option<&crate::model::SystemPrompt>) {
        let Some(system) = system else {
            return;
        };

        let combined = format!("{}\n\n{}", system.as_text(), TOOL_USE_GUIDELINE);

        if let Some(first_user) = messages.iter_mut().find(|m| m.role == Role::User) {
            match &mut first_user.content {
                Content::Text(text) => {
                    *text = format!("{combined}\n\n{text}");
                }
                Content::Parts(parts) => {
                    parts.insert(0, ContentPart::Text { text: combined });
                }
            }
        } else {
            messages.insert(0, Message::user(combined));
        }
    }

    /// (b) Adjacent-role coalescing: merge any two consecutive messages of
    /// the same role. List content is extended; string content is joined
    /// with `\n`; mixed types break the merge (the messages are left
    /// separate).
    fn coalesce_adjacent_roles(messages: Vec<Message>) -> Vec<Message> {
        let mut merged: Vec<Message> = Vec::with_capacity(messages.len());

        for message in messages {
            match merged.last_mut() {
                Some(prev) if prev.role == message.role => {
                    match (&mut prev.content, message.content) {
                        (Content::Text(prev_text), Content::Text(next_text)) => {
                            prev_text.push('\n');
                            prev_text.push_str(&next_text);
                        }
                        (Content::Parts(prev_parts), Content::Parts(next_parts)) => {
                            prev_parts.extend(next_parts);
                        }
                        (_, other_content) => {
                            merged.push(Message {
                                role: message.role,
                                content: other_content,
                            });
                        }
                    }
                }
                _ => merged.push(message),
            }
        }

        merged
    }

    /// (d) Last-message extraction: the final message becomes the current
    /// turn. If it is an assistant message, keep it in history and append a
    /// synthetic `Continue` user turn. If history would otherwise end
    /// without an assistant reply preceding the trailing user turn,
    /// alternation is already preserved by construction, so no-op.
    fn extract_last_message(mut messages: Vec<Message>) -> Vec<Message> {
        match messages.last() {
            Some(last) if last.role == Role::Assistant => {
                messages.push(Message::user("Continue"));
            }
            None => {
                messages.push(Message::assistant("Continue"));
            }
            _ => {}
        }

        messages
    }

    /// (e) Fallback content: if a user message has no text after parsing,
    /// substitute `Tool results provided.` when tool-results exist in its
    /// content, else `Continue`. When the content is part-typed, the
    /// fallback is prepended as a synthetic text part rather than replacing
    /// the whole content — the structured `tool_use`/`tool_result` parts
    /// must survive for (f)'s dedup pass and for the provider-request
    /// builder's `tool_results()` extraction downstream.
    fn apply_fallback_content(mut messages: Vec<Message>) -> Vec<Message> {
        for message in messages.iter_mut() {
            if message.role != Role::User {
                continue;
            }
            if !message.content.is_empty_text() {
                continue;
            }

            let fallback = if !message.content.tool_results().is_empty() {
                "Tool results provided."
            } else {
                "Continue"
            };

            match &mut message.content {
                Content::Text(text) => *text = fallback.to_string(),
                Content::Parts(parts) => parts.insert(0, ContentPart::Text { text: fallback.to_string() }),
            }
        }

        messages
    }

    /// (f) Tool-result deduplication: within one outgoing request, keep only
    /// the first occurrence of each `tool_use_id` among `ToolResult` parts.
    fn dedup_tool_results(mut messages: Vec<Message>) -> Vec<Message> {
        let mut seen: HashSet<String> = HashSet::new();

        for message in messages.iter_mut() {
            if let Content::Parts(parts) = &mut message.content {
                parts.retain(|part| match part {
                    ContentPart::ToolResult { id, .. } => seen.insert(id.clone()),
                    _ => true,
                });
            }
        }

        messages
    }

    /// (c) Tool filtering: drop tools whose name is on the provider denylist.
    fn filter_tools(tools: Option<&Vec<ToolSpec>>, denylist: &[&str]) -> Option<Vec<ToolSpec>> {
        let tools = tools?;
        let filtered: Vec<ToolSpec> = tools
            .iter()
            .filter(|t| !denylist.contains(&t.name.as_str()))
            .cloned()
            .collect();
        Some(filtered)
    }
}
