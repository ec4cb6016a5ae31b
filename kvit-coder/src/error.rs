//! Error types for the coder core.
//!
//! The taxonomy mirrors how the agent loop reacts to a failure: cancellation
//! terminates the run quietly, provider errors carry an HTTP status and a
//! permanent/transient classification, and tool failures carry an explicit
//! [`ToolErrorKind`] tag so the backtracking decision never depends on
//! string matching.

use thiserror::Error;

/// A type alias for `Result<T, CoderError>`.
pub type Result<T> = std::result::Result<T, CoderError>;

/// How a tool failure is treated by the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    /// A model-correctable condition: unknown tool, duplicate call,
    /// validation failure, read-before-edit violation. Eligible for
    /// backtracking.
    Semantic,
    /// An opaque failure (I/O, subprocess, provider-side). Written into
    /// history verbatim as a tool result.
    Opaque,
    /// The per-call deadline elapsed.
    Timeout,
    /// The caller cancelled the run while the tool was executing.
    Cancelled,
}

/// A failure produced by tool validation or execution.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ToolError {
    /// Classification tag driving the loop's error-handling path.
    pub kind: ToolErrorKind,
    /// Human-readable description, surfaced to the model.
    pub message: String,
}

impl ToolError {
    /// Create a semantic (backtrackable) tool error.
    #[must_use]
    pub fn semantic(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Semantic,
            message: message.into(),
        }
    }

    /// Create an opaque (non-backtrackable) tool error.
    #[must_use]
    pub fn opaque(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Opaque,
            message: message.into(),
        }
    }

    /// Create a timeout error for a call that exceeded its deadline.
    #[must_use]
    pub fn timeout(secs: u64) -> Self {
        Self {
            kind: ToolErrorKind::Timeout,
            message: format!("timed out after {secs} seconds"),
        }
    }

    /// Create a cancellation marker for a call interrupted by the user.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            kind: ToolErrorKind::Cancelled,
            message: "Cancelled by user".to_owned(),
        }
    }

    /// Returns `true` when the backtrack tracker should be consulted.
    #[must_use]
    pub const fn is_backtrackable(&self) -> bool {
        matches!(self.kind, ToolErrorKind::Semantic)
    }
}

/// The main error type for the coder core.
#[derive(Debug, Error)]
pub enum CoderError {
    /// The run was cancelled by the user or the caller's context.
    #[error("cancelled")]
    Cancelled,

    /// An error returned by the LLM endpoint.
    #[error("provider error{}: {message}", .status.map_or_else(String::new, |s| format!(" (HTTP {s})")))]
    Provider {
        /// HTTP status, when the failure came with one.
        status: Option<u16>,
        /// Body or transport-level description.
        message: String,
        /// `true` when retrying cannot help (permanent-500 markers,
        /// non-overflow 4xx).
        permanent: bool,
    },

    /// Consecutive per-choice provider errors exhausted their budget.
    #[error("provider returned {count} consecutive choice errors: {message}")]
    ProviderChoice {
        /// Number of consecutive failures observed.
        count: u32,
        /// The last per-choice error message.
        message: String,
    },

    /// Context-overflow recovery (HTTP 400 branch) ran out of attempts.
    #[error("context overflow not recoverable after {attempts} attempts")]
    ContextOverflow {
        /// Total chat attempts spent on the overflow branch.
        attempts: u32,
    },

    /// The model repeated the same tool call past the duplicate budget.
    #[error("duplicate call loop: {tool} called {count} times with same arguments")]
    DuplicateLoop {
        /// Name of the repeated tool.
        tool: String,
        /// How many times the identical call was made.
        count: u32,
    },

    /// A tool failed in a way the loop did not absorb.
    #[error("tool '{tool}' failed: {source}")]
    Tool {
        /// Name of the failing tool.
        tool: String,
        /// The underlying tool error.
        source: ToolError,
    },

    /// Registering a tool under a name that is already taken.
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    /// A checkpoint-store operation failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Checkpoint operations were requested while the engine is disabled.
    #[error("checkpoints not enabled")]
    CheckpointsDisabled,

    /// `restore_file` was asked for a path that did not exist at turn 0.
    #[error("'{path}' was not present at session start{}", fmt_candidates(.candidates))]
    FileNotAtSessionStart {
        /// The requested path.
        path: String,
        /// Restorable files ranked by similarity to the request.
        candidates: Vec<String>,
    },

    /// Another process holds the workspace lock.
    #[error("workspace is locked by pid {pid}")]
    WorkspaceLocked {
        /// PID recorded in the lock file.
        pid: u32,
    },

    /// A benchmark definition or harness step is invalid.
    #[error("benchmark error: {0}")]
    Bench(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error in a benchmark file.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// CSV read/write error in the results log.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(String),
}

fn fmt_candidates(candidates: &[String]) -> String {
    if candidates.is_empty() {
        String::new()
    } else {
        format!("; similar restorable files: {}", candidates.join(", "))
    }
}

impl CoderError {
    /// Create a provider error with a status and classification.
    #[must_use]
    pub fn provider(status: Option<u16>, message: impl Into<String>, permanent: bool) -> Self {
        Self::Provider {
            status,
            message: message.into(),
            permanent,
        }
    }

    /// Create a checkpoint error.
    #[must_use]
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    /// Create a benchmark error.
    #[must_use]
    pub fn bench(message: impl Into<String>) -> Self {
        Self::Bench(message.into())
    }

    /// Returns `true` for an HTTP 400, which upstream servers use to signal
    /// that the prompt exceeded the context window.
    #[must_use]
    pub const fn is_context_overflow(&self) -> bool {
        matches!(
            self,
            Self::Provider {
                status: Some(400),
                ..
            }
        )
    }

    /// Returns `true` when the run was ended by cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for CoderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
