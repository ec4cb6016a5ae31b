//! Recovery of tool calls that the model emitted as text.
//!
//! Some providers escape structured tool calls into the content or
//! reasoning channel instead of the `tool_calls` array. This module
//! pattern-matches the common escape artifacts against the registered
//! tool names and turns them back into structured calls:
//!
//! * the whole message body as a JSON object (`{"name": …, "arguments": …}`
//!   or `{"tool_calls": […]}`),
//! * inline `<tool_call>{…}</tool_call>` tags,
//! * inline `<function=name>{…}</function>` tags,
//! * a bare `name({…})` invocation on its own line.
//!
//! Only names present in the registry are accepted; anything else is left
//! in the text untouched.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::SharedTool;

static FUNCTION_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<function=([A-Za-z_][A-Za-z0-9_]*)>\s*(\{.*?\})\s*</function>")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

static CALL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\((\{[^\n]*\})\)\s*$")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// A tool invocation recovered from free-form text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCall {
    /// Registered tool name.
    pub name: String,
    /// Parsed arguments object.
    pub arguments: Value,
}

/// Returns `true` when `text` looks like an escaped tool invocation.
///
/// Deliberately broader than [`extract_calls`]: a `<tool_call>` or
/// `<function=…>` tag is a call artifact even when its JSON body is too
/// mangled to recover, and the loop should nudge the model rather than
/// treat the text as a final answer.
pub(super) fn looks_like_tool_call(text: &str, tools: &HashMap<String, SharedTool>) -> bool {
    if text.contains("<tool_call>") || text.contains("</tool_call>") || text.contains("<function=")
    {
        return true;
    }
    if CALL_LINE
        .captures_iter(text)
        .any(|caps| tools.contains_key(&caps[1]))
    {
        return true;
    }
    extract_calls(text, tools).is_some()
}

/// Extract all recoverable calls and strip their syntax from the text.
pub(super) fn extract_calls(
    text: &str,
    tools: &HashMap<String, SharedTool>,
) -> Option<(Vec<ExtractedCall>, String)> {
    if tools.is_empty() || text.trim().is_empty() {
        return None;
    }

    // The entire body as one JSON object is the strongest signal.
    if let Some(calls) = parse_whole_json(text, tools) {
        return Some((calls, String::new()));
    }

    let mut calls = Vec::new();
    let mut stripped = strip_tool_call_tags(text, tools, &mut calls);
    stripped = strip_regex(&FUNCTION_TAG, &stripped, tools, &mut calls);
    stripped = strip_regex(&CALL_LINE, &stripped, tools, &mut calls);

    if calls.is_empty() {
        None
    } else {
        Some((calls, stripped.trim().to_owned()))
    }
}

/// Parse the whole trimmed body as a JSON tool-call object.
fn parse_whole_json(text: &str, tools: &HashMap<String, SharedTool>) -> Option<Vec<ExtractedCall>> {
    let obj: Value = serde_json::from_str(text.trim()).ok()?;

    if let Some(entries) = obj.get("tool_calls").and_then(Value::as_array) {
        let mut calls = Vec::new();
        for entry in entries {
            let func = entry.get("function")?;
            let name = func.get("name")?.as_str()?;
            if !tools.contains_key(name) {
                return None;
            }
            calls.push(ExtractedCall {
                name: name.to_owned(),
                arguments: coerce_arguments(func.get("arguments")),
            });
        }
        return (!calls.is_empty()).then_some(calls);
    }

    let name = obj.get("name")?.as_str()?;
    if !tools.contains_key(name) {
        return None;
    }
    Some(vec![ExtractedCall {
        name: name.to_owned(),
        arguments: coerce_arguments(obj.get("arguments")),
    }])
}

/// Scan for `<tool_call>{…}</tool_call>` tags, collecting valid bodies and
/// removing their spans from the returned text.
fn strip_tool_call_tags(
    text: &str,
    tools: &HashMap<String, SharedTool>,
    calls: &mut Vec<ExtractedCall>,
) -> String {
    const OPEN: &str = "<tool_call>";
    const CLOSE: &str = "</tool_call>";

    let mut out = String::with_capacity(text.len());
    let mut remaining = text;

    while let Some(start) = remaining.find(OPEN) {
        let after_open = &remaining[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        let body = after_open[..end].trim();
        let rest = &after_open[end + CLOSE.len()..];

        match parse_tag_body(body, tools) {
            Some(call) => {
                // Drop the tag span from the text.
                out.push_str(&remaining[..start]);
                calls.push(call);
            }
            None => {
                // Unknown tool or malformed body: keep the span verbatim.
                out.push_str(&remaining[..start + OPEN.len() + end + CLOSE.len()]);
            }
        }
        remaining = rest;
    }
    out.push_str(remaining);
    out
}

/// Parse the JSON body of one `<tool_call>` tag.
fn parse_tag_body(body: &str, tools: &HashMap<String, SharedTool>) -> Option<ExtractedCall> {
    let obj: Value = serde_json::from_str(body).ok()?;
    let name = obj.get("name")?.as_str()?;
    if !tools.contains_key(name) {
        return None;
    }
    Some(ExtractedCall {
        name: name.to_owned(),
        arguments: coerce_arguments(obj.get("arguments")),
    })
}

/// Apply one of the regex forms, collecting matches for known tools and
/// stripping them; unknown names are left in place.
fn strip_regex(
    re: &Regex,
    text: &str,
    tools: &HashMap<String, SharedTool>,
    calls: &mut Vec<ExtractedCall>,
) -> String {
    re.replace_all(text, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        let args: Option<Value> = serde_json::from_str(&caps[2]).ok();
        match args {
            Some(args) if tools.contains_key(name) => {
                calls.push(ExtractedCall {
                    name: name.to_owned(),
                    arguments: args,
                });
                String::new()
            }
            _ => caps[0].to_owned(),
        }
    })
    .into_owned()
}

/// `arguments` may arrive as an object, a JSON-encoded string, or be
/// missing entirely.
fn coerce_arguments(args: Option<&Value>) -> Value {
    match args {
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
        }
        Some(v) => v.clone(),
        None => Value::Object(serde_json::Map::new()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::ToolError;
    use crate::tool::{Tool, ToolContext, ToolRegistry};

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
        reg.register(Arc::new(Named("web_search"))).unwrap();
        reg
    }

    mod tags {
        use super::*;

        #[test]
        fn single_tag_is_extracted_and_stripped() {
            let reg = registry();
            let text = "Let me look.\n<tool_call>{\"name\": \"read\", \"arguments\": {\"path\": \"/a\"}}</tool_call>\nDone.";

            let (calls, stripped) = reg.extract_calls(text).unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].name, "read");
            assert_eq!(calls[0].arguments["path"], "/a");
            assert!(!stripped.contains("<tool_call>"));
            assert!(stripped.contains("Let me look."));
            assert!(stripped.contains("Done."));
        }

        #[test]
        fn multiple_tags_preserve_order() {
            let reg = registry();
            let text = concat!(
                "<tool_call>{\"name\": \"read\", \"arguments\": {\"path\": \"/a\"}}</tool_call>\n",
                "<tool_call>{\"name\": \"read\", \"arguments\": {\"path\": \"/b\"}}</tool_call>",
            );

            let (calls, _) = reg.extract_calls(text).unwrap();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0].arguments["path"], "/a");
            assert_eq!(calls[1].arguments["path"], "/b");
        }

        #[test]
        fn unknown_tool_name_is_left_in_place() {
            let reg = registry();
            let text = "<tool_call>{\"name\": \"nuke\", \"arguments\": {}}</tool_call>";
            assert!(reg.extract_calls(text).is_none());
        }

        #[test]
        fn string_encoded_arguments_are_decoded() {
            let reg = registry();
            let text =
                "<tool_call>{\"name\": \"read\", \"arguments\": \"{\\\"path\\\": \\\"/a\\\"}\"}</tool_call>";
            let (calls, _) = reg.extract_calls(text).unwrap();
            assert_eq!(calls[0].arguments["path"], "/a");
        }
    }

    mod whole_json {
        use super::*;

        #[test]
        fn bare_object_with_name_and_arguments() {
            let reg = registry();
            let text = r#"{"name": "web_search", "arguments": {"q": "rust"}}"#;
            let (calls, stripped) = reg.extract_calls(text).unwrap();
            assert_eq!(calls[0].name, "web_search");
            assert_eq!(calls[0].arguments["q"], "rust");
            assert!(stripped.is_empty());
        }

        #[test]
        fn openai_shaped_tool_calls_array() {
            let reg = registry();
            let text = r#"{"tool_calls": [{"id": "c1", "type": "function", "function": {"name": "read", "arguments": "{\"path\": \"/x\"}"}}]}"#;
            let (calls, _) = reg.extract_calls(text).unwrap();
            assert_eq!(calls[0].name, "read");
            assert_eq!(calls[0].arguments["path"], "/x");
        }
    }

    mod regex_forms {
        use super::*;

        #[test]
        fn function_tag_form() {
            let reg = registry();
            let text = "<function=read>{\"path\": \"/a\"}</function>";
            let (calls, stripped) = reg.extract_calls(text).unwrap();
            assert_eq!(calls[0].name, "read");
            assert!(stripped.is_empty());
        }

        #[test]
        fn call_line_form() {
            let reg = registry();
            let text = "I will search now.\nweb_search({\"q\": \"tokio select\"})";
            let (calls, stripped) = reg.extract_calls(text).unwrap();
            assert_eq!(calls[0].name, "web_search");
            assert_eq!(calls[0].arguments["q"], "tokio select");
            assert_eq!(stripped, "I will search now.");
        }

        #[test]
        fn call_line_with_unknown_name_is_ignored() {
            let reg = registry();
            let text = "launch_missiles({\"target\": \"moon\"})";
            assert!(reg.extract_calls(text).is_none());
        }
    }

    #[test]
    fn plain_text_yields_nothing() {
        let reg = registry();
        assert!(reg.extract_calls("The answer is 42.").is_none());
        assert!(!reg.looks_like_tool_call("The answer is 42."));
    }

    #[test]
    fn looks_like_matches_extraction() {
        let reg = registry();
        let text = "<tool_call>{\"name\": \"read\", \"arguments\": {}}</tool_call>";
        assert!(reg.looks_like_tool_call(text));
    }
}
