//! Execution of one benchmark run.
//!
//! A run either drives the in-process agent loop (quiet mode, file-first
//! off) or shells out to an external command with a `{prompt}`
//! placeholder. Either way, the workspace is rebuilt first and the
//! declarative checks are evaluated afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{AgentConfig, AgentLoop};
use crate::error::Result;
use crate::gateway::ChatClient;
use crate::message::Message;
use crate::tool::ToolRegistry;

use super::definition::BenchmarkDefinition;
use super::environment::Environment;
use super::result::{RunResult, ToolInvocation};
use super::validator;

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// System prompt for in-process runs.
    pub system_prompt: String,
    /// External command template with a `{prompt}` placeholder. When set,
    /// the in-process agent loop is bypassed.
    pub benchmark_cmd: Option<String>,
    /// Per-attempt timeout for the external command.
    pub command_timeout: Duration,
    /// External command attempts (backoff 1 s, 2 s, 4 s, 8 s between).
    pub command_retries: u32,
    /// Agent configuration for in-process runs.
    pub agent: AgentConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a coding agent working in the current directory.".to_owned(),
            benchmark_cmd: None,
            command_timeout: Duration::from_secs(120),
            command_retries: 5,
            agent: AgentConfig::default(),
        }
    }
}

/// Runs one benchmark at a time against an isolated workspace.
pub struct Executor {
    client: Arc<dyn ChatClient>,
    registry: Arc<ToolRegistry>,
    env: Environment,
    config: ExecutorConfig,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("env", &self.env)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Create an executor.
    #[must_use]
    pub fn new(
        client: Arc<dyn ChatClient>,
        registry: Arc<ToolRegistry>,
        env: Environment,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            client,
            registry,
            env,
            config,
        }
    }

    /// The environment runs execute in.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Execute one run of `benchmark`.
    ///
    /// # Errors
    ///
    /// Only environment-level failures (workspace rebuild) surface as
    /// errors; agent and validation failures are recorded in the result.
    pub async fn execute(
        &self,
        benchmark: &BenchmarkDefinition,
        run_number: u32,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let started_at = Utc::now();
        let timer = Instant::now();

        self.env.rebuild_workspace(benchmark).await?;

        let mut result = RunResult::failed(&benchmark.id, run_number, String::new());
        result.errors.clear();
        result.started_at = started_at;

        let (output, tool_calls) = if let Some(template) = &self.config.benchmark_cmd {
            let (output, ok) = self.run_external(template, &benchmark.task).await;
            if !ok {
                result.errors.push(format!(
                    "benchmark command failed after {} attempts",
                    self.config.command_retries
                ));
            }
            (output, Vec::new())
        } else {
            let history = vec![
                Message::system(&self.config.system_prompt),
                Message::user(&benchmark.task),
            ];
            let mut agent_config = self.config.agent.clone();
            agent_config.quiet = true;
            agent_config.file_first_log = None;

            let agent = AgentLoop::new(
                Arc::clone(&self.client),
                Arc::clone(&self.registry),
                self.env.workspace(),
                agent_config,
            );
            let outcome = agent.run(history, cancel.clone()).await;

            result.apply_stats(&outcome.stats);
            if let Some(failure) = &outcome.failure {
                result.errors.push(failure.to_string());
            }
            if outcome.cancelled {
                result.errors.push("run cancelled".to_owned());
            }

            let output = outcome
                .final_text()
                .filter(|t| !t.trim().is_empty())
                .or_else(|| outcome.final_reasoning())
                .unwrap_or_default()
                .to_owned();
            (output, extract_tool_calls(&outcome.messages))
        };

        let validation_errors = validator::validate_all(
            &benchmark.validation,
            self.env.workspace(),
            &output,
            &tool_calls,
        )
        .await;
        result.errors.extend(validation_errors);

        result.tool_calls = tool_calls;
        result.success = result.errors.is_empty();
        result.duration_ms = result
            .duration_ms
            .max(u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX));
        result.completed_at = Utc::now();

        debug!(
            benchmark = %benchmark.id,
            run = run_number,
            success = result.success,
            "run finished"
        );
        Ok(result)
    }

    /// Run the external command, retrying on non-zero exit. Returns the
    /// accumulated stdout+stderr and whether an attempt succeeded.
    async fn run_external(&self, template: &str, prompt: &str) -> (String, bool) {
        let quoted = shlex::try_quote(prompt)
            .map(|q| q.into_owned())
            .unwrap_or_else(|_| format!("'{}'", prompt.replace('\'', "'\\''")));
        let command_line = template.replace("{prompt}", &quoted);

        let mut combined = String::new();
        let mut delay = Duration::from_secs(1);

        for attempt in 1..=self.config.command_retries.max(1) {
            let child = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command_line)
                .current_dir(self.env.workspace())
                .output();

            match tokio::time::timeout(self.config.command_timeout, child).await {
                Ok(Ok(output)) => {
                    combined.push_str(&String::from_utf8_lossy(&output.stdout));
                    combined.push_str(&String::from_utf8_lossy(&output.stderr));
                    if output.status.success() {
                        return (combined, true);
                    }
                    warn!(attempt, status = ?output.status.code(), "benchmark command failed");
                }
                Ok(Err(err)) => {
                    warn!(attempt, error = %err, "benchmark command could not be spawned");
                    combined.push_str(&format!("[spawn error: {err}]\n"));
                }
                Err(_) => {
                    warn!(attempt, "benchmark command timed out");
                    combined.push_str("[command timed out]\n");
                }
            }

            if attempt < self.config.command_retries {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        (combined, false)
    }
}

/// Tool calls requested across all assistant messages, in order.
#[must_use]
pub fn extract_tool_calls(messages: &[Message]) -> Vec<ToolInvocation> {
    messages
        .iter()
        .filter(|m| m.role == crate::message::Role::Assistant)
        .flat_map(|m| m.tool_calls())
        .map(|call| ToolInvocation {
            name: call.function.name.clone(),
            arguments: call.function.arguments.clone(),
        })
        .collect()
}
