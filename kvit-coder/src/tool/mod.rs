//! Tool capability records and the registry.
//!
//! A tool is a capability record: name, description, JSON schema for its
//! arguments, capability tags, a side-effect-free validator, and an
//! executor. The agent loop never introspects concrete tool types; it
//! resolves a name through [`ToolRegistry`] and calls [`Tool::check`] and
//! [`Tool::execute`] through the trait object.

mod extract;

pub use extract::ExtractedCall;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::{CoderError, Result, ToolError};

/// Capability tags classifying what a tool may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Reads workspace state without modifying it.
    Read,
    /// Writes or deletes files.
    Write,
    /// Produces an edit preview that must be confirmed by a follow-up call.
    Edit,
    /// Runs a subprocess. Exempt from the per-call deadline.
    Shell,
    /// Owns the on-disk message log write for the iteration it runs in.
    TaskLog,
}

/// Everything a tool executor may need from its host.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The workspace directory tools operate in.
    pub workspace: PathBuf,
    /// Cooperative cancellation signal for long-running executors.
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Create a context rooted at `workspace` with a fresh token.
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A tool the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name, snake_case.
    fn name(&self) -> &str;

    /// Human description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn schema(&self) -> Value;

    /// Capability tags. Defaults to none.
    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    /// Semantic validation of arguments, without side effects.
    ///
    /// # Errors
    ///
    /// Returns a [`ToolError`] (normally semantic) when the arguments are
    /// structurally valid JSON but unusable.
    fn check(&self, args: &Value) -> std::result::Result<(), ToolError> {
        let _ = args;
        Ok(())
    }

    /// Execute the tool.
    ///
    /// # Errors
    ///
    /// Returns a [`ToolError`]; its [`kind`](ToolError::kind) decides
    /// whether the loop backtracks or records the failure.
    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
    ) -> std::result::Result<Value, ToolError>;
}

/// Shared handle to a registered tool.
pub type SharedTool = Arc<dyn Tool>;

/// Name → tool lookup plus the LLM-facing definition list.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, SharedTool>,
    order: Vec<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Registration is write-once per name.
    ///
    /// # Errors
    ///
    /// Returns [`CoderError::DuplicateTool`] when the name is taken.
    pub fn register(&mut self, tool: SharedTool) -> Result<()> {
        let name = tool.name().to_owned();
        if self.tools.contains_key(&name) {
            return Err(CoderError::DuplicateTool(name));
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SharedTool> {
        self.tools.get(name)
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` when no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Returns `true` when `name` resolves to a tool tagged with `cap`.
    #[must_use]
    pub fn has_capability(&self, name: &str, cap: Capability) -> bool {
        self.get(name)
            .is_some_and(|t| t.capabilities().contains(&cap))
    }

    /// Tool definitions in the chat-completions `tools` format, in
    /// registration order.
    #[must_use]
    pub fn definitions(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.schema(),
                    }
                })
            })
            .collect()
    }

    /// Returns `true` when free-form `text` looks like an escaped tool
    /// invocation for one of the registered tools.
    #[must_use]
    pub fn looks_like_tool_call(&self, text: &str) -> bool {
        extract::looks_like_tool_call(text, &self.tools)
    }

    /// Extract structured tool calls embedded in free-form `text`.
    ///
    /// Returns the extracted calls and the text with the embedded call
    /// syntax stripped, or `None` when nothing was found.
    #[must_use]
    pub fn extract_calls(&self, text: &str) -> Option<(Vec<ExtractedCall>, String)> {
        extract::extract_calls(text, &self.tools)
    }
}
