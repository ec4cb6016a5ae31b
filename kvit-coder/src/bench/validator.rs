//! Evaluation of declarative validation checks.
//!
//! Each check maps to a predicate over the workspace, the agent's final
//! output, and the observed tool calls. A failing check produces a
//! human-readable explanation; `negate` flips the predicate while keeping
//! the explanation useful.

use std::path::Path;

use regex::Regex;
use similar::TextDiff;

use super::definition::{CheckType, ValidationCheck};
use super::result::ToolInvocation;

/// Validate all checks, returning one message per failure.
pub async fn validate_all(
    checks: &[ValidationCheck],
    workspace: &Path,
    output: &str,
    tool_calls: &[ToolInvocation],
) -> Vec<String> {
    let mut errors = Vec::new();
    for check in checks {
        if let Err(message) = validate(check, workspace, output, tool_calls).await {
            errors.push(message);
        }
    }
    errors
}

/// Validate one check.
///
/// # Errors
///
/// Returns a description of the failed expectation.
pub async fn validate(
    check: &ValidationCheck,
    workspace: &Path,
    output: &str,
    tool_calls: &[ToolInvocation],
) -> Result<(), String> {
    let result = evaluate(check, workspace, output, tool_calls).await;
    if check.negate {
        match result {
            Ok(()) => Err(format!(
                "negated check unexpectedly passed: {:?} on '{}'",
                check.check_type, check.target
            )),
            Err(_) => Ok(()),
        }
    } else {
        result
    }
}

async fn evaluate(
    check: &ValidationCheck,
    workspace: &Path,
    output: &str,
    tool_calls: &[ToolInvocation],
) -> Result<(), String> {
    match check.check_type {
        CheckType::FileContains => {
            let contents = read_file(workspace, &check.target)?;
            if contents.contains(&check.expected) {
                Ok(())
            } else {
                Err(format!(
                    "file '{}' does not contain '{}'",
                    check.target, check.expected
                ))
            }
        }
        CheckType::FileNotContains => {
            let contents = read_file(workspace, &check.target)?;
            if contents.contains(&check.expected) {
                Err(format!(
                    "file '{}' unexpectedly contains '{}'",
                    check.target, check.expected
                ))
            } else {
                Ok(())
            }
        }
        CheckType::FileEquals => {
            let contents = read_file(workspace, &check.target)?;
            // Trailing-newline differences are noise, not failures.
            let actual = contents.trim_end_matches('\n');
            let expected = check.expected.trim_end_matches('\n');
            if actual == expected {
                Ok(())
            } else {
                let diff = TextDiff::from_lines(expected, actual)
                    .unified_diff()
                    .header("expected", "actual")
                    .to_string();
                Err(format!("file '{}' differs:\n{diff}", check.target))
            }
        }
        CheckType::FileExists => {
            if workspace.join(&check.target).exists() {
                Ok(())
            } else {
                Err(format!("file '{}' does not exist", check.target))
            }
        }
        CheckType::FileNotExists => {
            if workspace.join(&check.target).exists() {
                Err(format!("file '{}' unexpectedly exists", check.target))
            } else {
                Ok(())
            }
        }
        CheckType::FileLineCount => {
            let contents = read_file(workspace, &check.target)?;
            let expected = check.count.unwrap_or(0);
            let actual = contents.lines().count();
            if actual == expected {
                Ok(())
            } else {
                Err(format!(
                    "file '{}' has {actual} lines, expected {expected}",
                    check.target
                ))
            }
        }
        CheckType::FileLineEquals => {
            let contents = read_file(workspace, &check.target)?;
            let number = check.line.unwrap_or(1);
            let Some(line) = contents.lines().nth(number.saturating_sub(1)) else {
                return Err(format!(
                    "file '{}' has no line {number}",
                    check.target
                ));
            };
            if line == check.expected {
                Ok(())
            } else {
                Err(format!(
                    "file '{}' line {number} is '{line}', expected '{}'",
                    check.target, check.expected
                ))
            }
        }
        CheckType::ToolCalled => {
            if tool_calls.iter().any(|c| c.name == check.target) {
                Ok(())
            } else {
                Err(format!("tool '{}' was never called", check.target))
            }
        }
        CheckType::ToolNotCalled => {
            if tool_calls.iter().any(|c| c.name == check.target) {
                Err(format!("tool '{}' was unexpectedly called", check.target))
            } else {
                Ok(())
            }
        }
        CheckType::ToolCalledWith => {
            let joined: String = tool_calls
                .iter()
                .filter(|c| c.name == check.target)
                .map(|c| c.arguments.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            if joined.is_empty() {
                return Err(format!("tool '{}' was never called", check.target));
            }
            let pattern = check.args.as_deref().unwrap_or(&check.expected);
            let matched = match Regex::new(pattern) {
                Ok(re) => re.is_match(&joined),
                // An unparsable pattern degrades to a substring match.
                Err(_) => joined.contains(pattern),
            };
            if matched {
                Ok(())
            } else {
                Err(format!(
                    "tool '{}' was never called with arguments matching '{pattern}'",
                    check.target
                ))
            }
        }
        CheckType::OutputContains => {
            // Second chance: case-insensitive.
            if output.contains(&check.expected)
                || output.to_lowercase().contains(&check.expected.to_lowercase())
            {
                Ok(())
            } else {
                Err(format!("output does not contain '{}'", check.expected))
            }
        }
        CheckType::OutputNotContains => {
            if output.contains(&check.expected)
                || output.to_lowercase().contains(&check.expected.to_lowercase())
            {
                Err(format!("output unexpectedly contains '{}'", check.expected))
            } else {
                Ok(())
            }
        }
        CheckType::OutputMatches => {
            let re = Regex::new(&check.expected)
                .map_err(|e| format!("invalid regex '{}': {e}", check.expected))?;
            if re.is_match(output) {
                Ok(())
            } else {
                Err(format!("output does not match /{}/", check.expected))
            }
        }
        CheckType::MultiToolCalls => {
            let expected = check.count.unwrap_or(1);
            let actual = tool_calls.iter().filter(|c| c.name == check.target).count();
            if actual >= expected {
                Ok(())
            } else {
                Err(format!(
                    "tool '{}' was called {actual} times, expected at least {expected}",
                    check.target
                ))
            }
        }
        CheckType::RunCommand => {
            let Some(command) = check.command.as_deref() else {
                return Err("run_command check without a command".to_owned());
            };
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(workspace)
                .output()
                .await
                .map_err(|e| format!("failed to run '{command}': {e}"))?;
            if !output.status.success() {
                return Err(format!(
                    "command '{command}' failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ));
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !check.expected.is_empty() && !stdout.contains(&check.expected) {
                return Err(format!(
                    "command '{command}' output does not contain '{}'",
                    check.expected
                ));
            }
            Ok(())
        }
    }
}

fn read_file(workspace: &Path, target: &str) -> Result<String, String> {
    std::fs::read_to_string(workspace.join(target))
        .map_err(|e| format!("cannot read '{target}': {e}"))
}
