//! The agent control loop.
//!
//! [`AgentLoop`] drives a tool-augmented chat session to completion:
//!
//! 1. Send the history and tool definitions to the model
//! 2. Classify and recover from provider errors
//! 3. Normalize the assistant message and append it
//! 4. Execute requested tool calls in order, bracketed by checkpoint turns
//! 5. Watch for duplicate calls and loops, backtrack on semantic failures
//! 6. Repeat until the model answers in plain text or a budget runs out
//!
//! The loop is bounded by [`AgentConfig::max_iterations`]; one iteration is
//! one LLM call plus all tool calls it requested. All run state lives in a
//! per-run structure inside [`AgentLoop::run`], so one loop value can be
//! reused across runs.
//!
//! # Edit previews
//!
//! A tool tagged [`Capability::Edit`](crate::tool::Capability::Edit) may
//! return a result whose JSON contains `"status": "preview"`. Until the
//! same tool is called again to resolve the preview, other mutating tools
//! are blocked with a semantic error.

mod runner;
#[cfg(test)]
pub(crate) mod testing;

pub use runner::AgentLoop;

use std::path::PathBuf;
use std::time::Duration;

use crate::backtrack::BacktrackConfig;
use crate::error::CoderError;
use crate::message::{Message, Role};
use crate::usage::AgentStats;

/// Per-run configuration of the agent loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model identifier sent to the gateway.
    pub model: String,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Completion budget per call.
    pub max_tokens: Option<u32>,
    /// Iteration budget. One iteration = one LLM call + its tool calls.
    pub max_iterations: usize,
    /// Overflow-rewrite attempts before escalating (HTTP 400 branch).
    pub max_context_overflow_retries: u32,
    /// Different-approach escalations before failing the run.
    pub max_different_approach_attempts: u32,
    /// Consecutive per-choice provider failures before failing the run.
    pub max_provider_failures: u32,
    /// Empty-content retries before promoting reasoning to content.
    pub max_empty_reasoning_retries: u32,
    /// Identical consecutive calls before a duplicate-loop failure.
    pub max_consecutive_duplicates: u32,
    /// Hard deadline for non-shell tools.
    pub tool_timeout: Duration,
    /// Prepend reasoning to content instead of discarding it.
    pub merge_thinking: bool,
    /// Suppress stderr progress and the final stats summary.
    pub quiet: bool,
    /// Authoritative on-disk message log (file-first mode).
    pub file_first_log: Option<PathBuf>,
    /// Backtracking policy.
    pub backtrack: BacktrackConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: None,
            max_tokens: None,
            max_iterations: 10,
            max_context_overflow_retries: 2,
            max_different_approach_attempts: 3,
            max_provider_failures: 2,
            max_empty_reasoning_retries: 3,
            max_consecutive_duplicates: 3,
            tool_timeout: Duration::from_secs(15),
            merge_thinking: false,
            quiet: false,
            file_first_log: None,
            backtrack: BacktrackConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Create a config for `model` with all defaults.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Set the iteration budget.
    #[must_use]
    pub const fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    /// Set the non-shell tool deadline.
    #[must_use]
    pub const fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Set the backtracking policy.
    #[must_use]
    pub const fn backtrack(mut self, config: BacktrackConfig) -> Self {
        self.backtrack = config;
        self
    }

    /// Suppress stderr progress output.
    #[must_use]
    pub const fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Enable file-first persistence against `log`.
    #[must_use]
    pub fn file_first(mut self, log: impl Into<PathBuf>) -> Self {
        self.file_first_log = Some(log.into());
        self
    }
}

/// Host hook that may amend each assistant message before it enters
/// history (e.g. a `[turn_N]` prefix, or a long-running-task notice).
pub trait ContextMiddleware: Send + Sync {
    /// Mutate the normalized assistant message for iteration `iteration`.
    fn amend_assistant(&self, iteration: usize, message: &mut Message);
}

/// The result of one agent run.
#[derive(Debug)]
pub struct AgentOutcome {
    /// Final message history.
    pub messages: Vec<Message>,
    /// Cumulative statistics.
    pub stats: AgentStats,
    /// Whether the run ended through cancellation.
    pub cancelled: bool,
    /// The unrecoverable error that terminated the run, if any.
    pub failure: Option<CoderError>,
}

impl AgentOutcome {
    /// Returns `true` when the run completed without an unrecoverable
    /// error. A cancelled run is not a failure.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.failure.is_none()
    }

    /// Content of the last assistant message, the run's final answer.
    #[must_use]
    pub fn final_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    /// Reasoning of the last assistant message, as an output fallback.
    #[must_use]
    pub fn final_reasoning(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .and_then(|m| m.reasoning_content.as_deref())
    }
}
