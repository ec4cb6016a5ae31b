//! Benchmark definitions and the declarative validation DSL.
//!
//! A benchmark file is a YAML document with a top-level `benchmarks` list.
//! Each definition scripts one task: files to materialise, the user prompt
//! to hand the agent, and a list of checks run over the workspace and the
//! agent's output afterwards.

use serde::{Deserialize, Serialize};

use crate::error::{CoderError, Result};

/// One file or directory materialised into the workspace before a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupFile {
    /// Workspace-relative path.
    pub path: String,
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Base64-encoded binary content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Create a directory instead of a file.
    #[serde(default)]
    pub directory: bool,
}

/// The kind of a validation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    /// File at `target` contains `expected`.
    FileContains,
    /// File at `target` does not contain `expected`.
    FileNotContains,
    /// File at `target` equals `expected`, modulo trailing newlines.
    FileEquals,
    /// File at `target` exists.
    FileExists,
    /// File at `target` does not exist.
    FileNotExists,
    /// File at `target` has exactly `count` lines.
    FileLineCount,
    /// Line `line` (1-based) of the file at `target` equals `expected`.
    FileLineEquals,
    /// The tool named `target` was called at least once.
    ToolCalled,
    /// The tool named `target` was never called.
    ToolNotCalled,
    /// The tool named `target` was called with arguments matching `args`.
    ToolCalledWith,
    /// The final output contains `expected` (case-insensitive fallback).
    OutputContains,
    /// The final output does not contain `expected`.
    OutputNotContains,
    /// The final output matches the regex in `expected`.
    OutputMatches,
    /// The tool named `target` was called at least `count` times.
    MultiToolCalls,
    /// `command` exits successfully in the workspace, with `expected`
    /// optionally required in its stdout.
    RunCommand,
}

/// One declarative check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCheck {
    /// What to verify.
    #[serde(rename = "type")]
    pub check_type: CheckType,
    /// Target path, `"output"`, or a tool name, depending on the type.
    #[serde(default)]
    pub target: String,
    /// Expected string, where the type needs one.
    #[serde(default)]
    pub expected: String,
    /// Regex over the JSON arguments, for [`CheckType::ToolCalledWith`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    /// Shell command, for [`CheckType::RunCommand`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Count, for line counts and [`CheckType::MultiToolCalls`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// 1-based line number, for [`CheckType::FileLineEquals`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    /// Invert the result of the check.
    #[serde(default)]
    pub negate: bool,
}

impl ValidationCheck {
    /// Create a check of the given type against `target`.
    #[must_use]
    pub fn new(check_type: CheckType, target: impl Into<String>) -> Self {
        Self {
            check_type,
            target: target.into(),
            expected: String::new(),
            args: None,
            command: None,
            count: None,
            line: None,
            negate: false,
        }
    }

    /// Set the expected string.
    #[must_use]
    pub fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = expected.into();
        self
    }

    /// Set the count.
    #[must_use]
    pub const fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Invert the check.
    #[must_use]
    pub const fn negated(mut self) -> Self {
        self.negate = true;
        self
    }
}

/// A scripted task executed against the agent core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkDefinition {
    /// Unique identifier, e.g. `E2`.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Category used for grouping and filtering, e.g. `edit`.
    pub category: String,
    /// What a passing run demonstrates.
    #[serde(default)]
    pub goal: String,
    /// Files materialised into the workspace before the run.
    #[serde(default)]
    pub setup: Vec<SetupFile>,
    /// The user prompt.
    pub task: String,
    /// Checks run after the agent finishes.
    #[serde(default)]
    pub validation: Vec<ValidationCheck>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// The task is expected to use only read-class tools.
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Deserialize)]
struct BenchmarkFile {
    benchmarks: Vec<BenchmarkDefinition>,
}

/// Parse and validate a benchmark YAML document.
///
/// # Errors
///
/// Returns a benchmark error for missing mandatory fields or duplicate
/// ids, and a YAML error for malformed documents.
pub fn parse_suite(yaml: &str) -> Result<Vec<BenchmarkDefinition>> {
    let file: BenchmarkFile = serde_yaml::from_str(yaml)?;
    let mut seen = std::collections::HashSet::new();
    for benchmark in &file.benchmarks {
        if benchmark.id.trim().is_empty() {
            return Err(CoderError::bench("benchmark with empty id"));
        }
        if benchmark.category.trim().is_empty() {
            return Err(CoderError::bench(format!(
                "benchmark '{}' has no category",
                benchmark.id
            )));
        }
        if benchmark.task.trim().is_empty() {
            return Err(CoderError::bench(format!(
                "benchmark '{}' has no task",
                benchmark.id
            )));
        }
        if !seen.insert(benchmark.id.clone()) {
            return Err(CoderError::bench(format!(
                "duplicate benchmark id '{}'",
                benchmark.id
            )));
        }
    }
    Ok(file.benchmarks)
}

/// Load a benchmark suite from a file.
///
/// # Errors
///
/// I/O errors, plus everything [`parse_suite`] reports.
pub async fn load_suite(path: &std::path::Path) -> Result<Vec<BenchmarkDefinition>> {
    let yaml = tokio::fs::read_to_string(path).await?;
    parse_suite(&yaml)
}

/// Keep benchmarks matching the category and id filters. Empty filters
/// match everything.
#[must_use]
pub fn filter_suite(
    benchmarks: Vec<BenchmarkDefinition>,
    categories: &[String],
    ids: &[String],
) -> Vec<BenchmarkDefinition> {
    benchmarks
        .into_iter()
        .filter(|b| categories.is_empty() || categories.iter().any(|c| c == &b.category))
        .filter(|b| ids.is_empty() || ids.iter().any(|i| i == &b.id))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    const SUITE: &str = r#"
benchmarks:
  - id: E1
    name: append a line
    category: edit
    goal: the agent appends without clobbering
    setup:
      - path: notes.txt
        content: "first\n"
      - path: data
        directory: true
    task: "Append 'second' to notes.txt"
    validation:
      - type: file_contains
        target: notes.txt
        expected: second
      - type: tool_called
        target: write
    tags: [small]
  - id: R1
    category: read
    task: "How many lines are in notes.txt?"
    readonly: true
    validation:
      - type: output_contains
        target: output
        expected: "1"
"#;

    #[test]
    fn parses_a_full_suite() {
        let suite = parse_suite(SUITE).unwrap();
        assert_eq!(suite.len(), 2);

        let e1 = &suite[0];
        assert_eq!(e1.id, "E1");
        assert_eq!(e1.setup.len(), 2);
        assert!(e1.setup[1].directory);
        assert_eq!(e1.validation[0].check_type, CheckType::FileContains);
        assert!(!e1.readonly);

        let r1 = &suite[1];
        assert!(r1.readonly);
        assert!(r1.name.is_empty());
    }

    #[test]
    fn rejects_missing_mandatory_fields() {
        let missing_task = "benchmarks:\n  - id: X\n    category: c\n    task: ''\n";
        assert!(parse_suite(missing_task).is_err());

        let missing_category = "benchmarks:\n  - id: X\n    category: ''\n    task: t\n";
        assert!(parse_suite(missing_category).is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let dup = "benchmarks:\n  - id: X\n    category: c\n    task: t\n  - id: X\n    category: c\n    task: t\n";
        let err = parse_suite(dup).unwrap_err();
        assert!(err.to_string().contains("duplicate benchmark id"));
    }

    #[test]
    fn filters_by_category_and_id() {
        let suite = parse_suite(SUITE).unwrap();

        let edits = filter_suite(suite.clone(), &["edit".to_owned()], &[]);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].id, "E1");

        let by_id = filter_suite(suite.clone(), &[], &["R1".to_owned()]);
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].id, "R1");

        let all = filter_suite(suite, &[], &[]);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn negation_flag_roundtrips() {
        let yaml = "benchmarks:\n  - id: N1\n    category: c\n    task: t\n    validation:\n      - type: file_exists\n        target: out.txt\n        negate: true\n";
        let suite = parse_suite(yaml).unwrap();
        assert!(suite[0].validation[0].negate);
    }
}
