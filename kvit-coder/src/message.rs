//! Chat messages exchanged with the model.
//!
//! The types here follow the chat-completions wire conventions: a flat
//! [`Message`] record with a [`Role`], plain text content, optional
//! model-emitted reasoning, and, for assistant turns, a list of
//! requested [`ToolCall`]s. Tool results are messages with
//! `role == Role::Tool` carrying the `tool_call_id` they answer.

use serde::{Deserialize, Serialize};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool result message.
    Tool,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Function name and JSON-encoded arguments inside a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    /// Name of the tool to call.
    pub name: String,
    /// Arguments, JSON-encoded as a string per the wire format.
    #[serde(default)]
    pub arguments: String,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier, echoed back in the matching tool message.
    pub id: String,
    /// Call type. Always `"function"`; some providers omit it, so the
    /// normalizer backfills it.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// The function to invoke.
    pub function: ToolCallFunction,
}

impl ToolCall {
    /// Create a tool call with the given id, name, and argument string.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: Some("function".to_owned()),
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// Text content. Empty when an assistant turn carries only tool calls.
    #[serde(default)]
    pub content: String,

    /// Model-emitted thinking, when the provider exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,

    /// The tool call this message answers (tool role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool or function name (tool role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls requested by this assistant turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    /// Create an assistant message with text content only.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Create a tool result answering `tool_call_id`.
    #[must_use]
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            reasoning_content: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            tool_calls: None,
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning_content: None,
            tool_call_id: None,
            name: None,
            tool_calls: None,
        }
    }

    /// Returns `true` when this message carries at least one tool call.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Returns the tool calls, or an empty slice.
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }

    /// Returns the reasoning text, or an empty string.
    #[must_use]
    pub fn reasoning(&self) -> &str {
        self.reasoning_content.as_deref().unwrap_or_default()
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::assistant("")
    }
}

/// Returns `true` when appending an assistant message to `history` would
/// violate the no-consecutive-assistant invariant.
#[must_use]
pub fn last_is_assistant(history: &[Message]) -> bool {
    history.last().is_some_and(|m| m.role == Role::Assistant)
}

/// Index ranges of the trailing tool-result block, if history currently
/// ends in tool messages. Used by the context-overflow recovery path.
#[must_use]
pub fn trailing_tool_results(history: &[Message]) -> std::ops::Range<usize> {
    let mut start = history.len();
    while start > 0 && history[start - 1].role == Role::Tool {
        start -= 1;
    }
    start..history.len()
}
