//! Repair of provider quirks in assistant messages.
//!
//! Providers disagree on details the rest of the loop should never see:
//! missing `type` fields on tool calls, tool calls escaped into the
//! reasoning or content channel, duplicated assistant turns. Everything is
//! fixed here, before a message enters history.

use crate::message::{Message, Role, ToolCall};
use crate::tool::ToolRegistry;

/// Outcome of normalizing one assistant message.
#[derive(Debug, Clone)]
pub struct Normalized {
    /// The repaired message.
    pub message: Message,
    /// `true` when tool calls were recovered from text channels.
    pub tool_calls_extracted: bool,
}

/// Normalize a raw assistant message.
///
/// When `merge_thinking` is set, reasoning that accompanies tool calls is
/// prepended to the content instead of being discarded.
#[must_use]
pub fn normalize_response(
    mut message: Message,
    registry: &ToolRegistry,
    merge_thinking: bool,
) -> Normalized {
    // Some providers omit `type` on tool calls.
    if let Some(calls) = message.tool_calls.as_mut() {
        for call in calls {
            if call.kind.is_none() {
                call.kind = Some("function".to_owned());
            }
        }
    }

    let mut extracted = false;

    // Tool calls escaped into the reasoning channel.
    if !message.has_tool_calls() && !message.reasoning().is_empty() {
        if let Some((calls, stripped)) = registry.extract_calls(message.reasoning()) {
            message.tool_calls = Some(materialize(&calls));
            message.reasoning_content = Some(stripped);
            extracted = true;
        }
    }

    // Tool calls escaped into the content channel.
    if !message.has_tool_calls() {
        if let Some((calls, stripped)) = registry.extract_calls(&message.content) {
            message.tool_calls = Some(materialize(&calls));
            message.content = stripped;
            extracted = true;
        }
    }

    // Reasoning alongside tool calls is either merged or dropped.
    if message.has_tool_calls() && !message.reasoning().is_empty() {
        if merge_thinking {
            let reasoning = message.reasoning().trim().to_owned();
            if message.content.is_empty() {
                message.content = reasoning;
            } else {
                message.content = format!("{reasoning}\n\n{}", message.content);
            }
        }
        message.reasoning_content = None;
    }

    Normalized {
        message,
        tool_calls_extracted: extracted,
    }
}

/// Turn extracted calls into wire-shaped [`ToolCall`]s with synthetic ids.
fn materialize(calls: &[crate::tool::ExtractedCall]) -> Vec<ToolCall> {
    calls
        .iter()
        .enumerate()
        .map(|(idx, call)| {
            ToolCall::new(
                format!("extracted-{idx}"),
                &call.name,
                call.arguments.to_string(),
            )
        })
        .collect()
}

/// Drop a trailing assistant message from `history`.
///
/// Providers occasionally duplicate the assistant turn; calling this before
/// appending a new assistant message keeps the no-consecutive-assistant
/// invariant intact. Returns `true` when a message was dropped.
pub fn drop_trailing_assistant(history: &mut Vec<Message>) -> bool {
    if history.last().is_some_and(|m| m.role == Role::Assistant) {
        history.pop();
        true
    } else {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::error::ToolError;
    use crate::tool::{Tool, ToolContext};

    #[derive(Debug)]
    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "test tool"
        }

        fn schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, ToolError> {
            Ok(Value::Null)
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Named("read"))).unwrap();
        reg
    }

    fn assistant_with_reasoning(content: &str, reasoning: &str) -> Message {
        let mut msg = Message::assistant(content);
        msg.reasoning_content = Some(reasoning.to_owned());
        msg
    }

    #[test]
    fn backfills_missing_function_type() {
        let mut msg = Message::assistant("");
        msg.tool_calls = Some(vec![{
            let mut call = ToolCall::new("c1", "read", "{}");
            call.kind = None;
            call
        }]);

        let normalized = normalize_response(msg, &registry(), false);
        assert_eq!(
            normalized.message.tool_calls()[0].kind.as_deref(),
            Some("function")
        );
        assert!(!normalized.tool_calls_extracted);
    }

    #[test]
    fn extracts_calls_from_reasoning() {
        let msg = assistant_with_reasoning(
            "",
            "I should read it.\n<tool_call>{\"name\": \"read\", \"arguments\": {\"path\": \"/a\"}}</tool_call>",
        );

        let normalized = normalize_response(msg, &registry(), false);
        assert!(normalized.tool_calls_extracted);
        let calls = normalized.message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "read");
        // The leftover reasoning is discarded along with the embedded
        // syntax once the calls are structured.
        assert!(normalized.message.reasoning_content.is_none());
    }

    #[test]
    fn merge_thinking_keeps_stripped_reasoning_from_extraction() {
        let msg = assistant_with_reasoning(
            "",
            "I should read it.\n<tool_call>{\"name\": \"read\", \"arguments\": {\"path\": \"/a\"}}</tool_call>",
        );

        let normalized = normalize_response(msg, &registry(), true);
        assert!(normalized.tool_calls_extracted);
        // The embedded syntax is stripped; the surrounding prose survives
        // as content.
        assert!(!normalized.message.content.contains("<tool_call>"));
        assert!(normalized.message.content.contains("I should read it."));
        assert!(normalized.message.reasoning_content.is_none());
    }

    #[test]
    fn extracts_calls_from_content_when_reasoning_has_none() {
        let msg = Message::assistant(
            "<tool_call>{\"name\": \"read\", \"arguments\": {\"path\": \"/b\"}}</tool_call>",
        );

        let normalized = normalize_response(msg, &registry(), false);
        assert!(normalized.tool_calls_extracted);
        assert_eq!(normalized.message.tool_calls()[0].function.name, "read");
        assert!(normalized.message.content.is_empty());
    }

    #[test]
    fn reasoning_is_discarded_alongside_tool_calls_by_default() {
        let mut msg = assistant_with_reasoning("", "thinking hard");
        msg.tool_calls = Some(vec![ToolCall::new("c1", "read", "{}")]);

        let normalized = normalize_response(msg, &registry(), false);
        assert!(normalized.message.reasoning_content.is_none());
        assert!(normalized.message.content.is_empty());
    }

    #[test]
    fn merge_thinking_prepends_reasoning() {
        let mut msg = assistant_with_reasoning("working on it", "first, a plan");
        msg.tool_calls = Some(vec![ToolCall::new("c1", "read", "{}")]);

        let normalized = normalize_response(msg, &registry(), true);
        assert_eq!(normalized.message.content, "first, a plan\n\nworking on it");
        assert!(normalized.message.reasoning_content.is_none());
    }

    #[test]
    fn plain_answer_passes_through() {
        let msg = Message::assistant("The answer is 4.");
        let normalized = normalize_response(msg, &registry(), false);
        assert!(!normalized.tool_calls_extracted);
        assert!(!normalized.message.has_tool_calls());
        assert_eq!(normalized.message.content, "The answer is 4.");
    }

    #[test]
    fn drop_trailing_assistant_pops_only_assistants() {
        let mut history = vec![Message::user("hi"), Message::assistant("dup")];
        assert!(drop_trailing_assistant(&mut history));
        assert_eq!(history.len(), 1);
        assert!(!drop_trailing_assistant(&mut history));
        assert_eq!(history.len(), 1);
    }
}
