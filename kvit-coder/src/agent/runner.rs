//! The iteration state machine.
//!
//! All per-run mutable state lives in `RunState`; [`AgentLoop`] itself is
//! reusable across runs. History is a single owned sequence: backtracking
//! truncates it to a recorded length rather than keeping divergent copies.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::backtrack::BacktrackTracker;
use crate::checkpoint::CheckpointEngine;
use crate::detect::LoopDetector;
use crate::error::{CoderError, Result, ToolError, ToolErrorKind};
use crate::gateway::{ChatClient, ChatRequest, ChatResponse};
use crate::message::{Message, Role, ToolCall, trailing_tool_results};
use crate::normalize::{drop_trailing_assistant, normalize_response};
use crate::tool::{Capability, ToolContext, ToolRegistry};
use crate::usage::Usage;

use super::{AgentConfig, AgentOutcome, ContextMiddleware};

/// Placeholder written over trailing tool outputs during context-overflow
/// recovery.
const OVERFLOW_PLACEHOLDER: &str = "[Server error: tool output elided after a context overflow]";

/// User message injected when overflow rewrites were not enough.
const DIFFERENT_APPROACH: &str =
    "The conversation no longer fits the model's context window. Try a different approach \
     that needs less context, and keep tool outputs short.";

/// User message injected when the model keeps reasoning without acting.
const MAKE_THE_CALLS: &str =
    "Use the appropriate tools to complete your task. Make the tool calls now.";

/// Synthetic assistant content restoring role alternation on cancellation.
const CANCELLED_MARKER: &str = "[Operation cancelled by user]";

/// Synthetic tool result for calls interrupted by cancellation.
const CANCELLED_TOOL_RESULT: &str = "Cancelled by user";

// ---------------------------------------------------------------------------
// Progress ticker
// ---------------------------------------------------------------------------

/// Emits a dot to stderr every second while waiting on the LLM or a tool.
/// Joined before the iteration moves on.
struct Ticker {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    fn start(enabled: bool) -> Self {
        let stop = CancellationToken::new();
        let handle = enabled.then(|| {
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = stop.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(1)) => {
                            use std::io::Write as _;
                            eprint!(".");
                            let _ = std::io::stderr().flush();
                        }
                    }
                }
            })
        });
        Self {
            stop,
            handle,
        }
    }

    async fn finish(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

struct RunState {
    messages: Vec<Message>,
    stats: crate::usage::AgentStats,
    detector: LoopDetector,
    tracker: BacktrackTracker,
    provider_failures: u32,
    empty_retries: u32,
    last_call: Option<(String, String)>,
    duplicate_count: u32,
    /// `(prompt, completion, cost)` of the most recent successful chat
    /// call, for discarded-stats accounting on backtrack.
    last_recorded: (u64, u64, f64),
}

impl RunState {
    fn new(config: &AgentConfig, messages: Vec<Message>) -> Self {
        Self {
            messages,
            stats: crate::usage::AgentStats::default(),
            detector: LoopDetector::default(),
            tracker: BacktrackTracker::new(config.backtrack),
            provider_failures: 0,
            empty_retries: 0,
            last_call: None,
            duplicate_count: 0,
            last_recorded: (0, 0, 0.0),
        }
    }
}

/// How tool execution for one iteration ended.
enum ExecOutcome {
    /// All calls handled; proceed to loop detection.
    Continue,
    /// History was rewound to the pre-iteration length.
    Backtracked,
    /// Cancellation observed mid-tool; synthetic results were filled in.
    Cancelled,
    /// An unrecoverable failure.
    Fatal(CoderError),
}

/// Whether an absorbed error rewound history or was written into it.
enum ErrorFlow {
    Wrote,
    Backtracked,
}

// ---------------------------------------------------------------------------
// AgentLoop
// ---------------------------------------------------------------------------

/// The agent control loop over a chat client, a tool registry, and an
/// optional checkpoint engine.
pub struct AgentLoop {
    client: Arc<dyn ChatClient>,
    registry: Arc<ToolRegistry>,
    workspace: PathBuf,
    checkpoints: Option<Arc<CheckpointEngine>>,
    middleware: Option<Arc<dyn ContextMiddleware>>,
    config: AgentConfig,
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("workspace", &self.workspace)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AgentLoop {
    /// Create a loop over `client` and `registry`, with tools operating in
    /// `workspace`.
    #[must_use]
    pub fn new(
        client: Arc<dyn ChatClient>,
        registry: Arc<ToolRegistry>,
        workspace: impl Into<PathBuf>,
        config: AgentConfig,
    ) -> Self {
        Self {
            client,
            registry,
            workspace: workspace.into(),
            checkpoints: None,
            middleware: None,
            config,
        }
    }

    /// Attach a checkpoint engine; tool-calling iterations will be
    /// bracketed in turns.
    #[must_use]
    pub fn with_checkpoints(mut self, engine: Arc<CheckpointEngine>) -> Self {
        self.checkpoints = Some(engine);
        self
    }

    /// Attach a context middleware.
    #[must_use]
    pub fn with_middleware(mut self, middleware: Arc<dyn ContextMiddleware>) -> Self {
        self.middleware = Some(middleware);
        self
    }

    /// Drive the conversation to completion.
    ///
    /// `initial` must start with a system message. The returned outcome
    /// carries the final history, cumulative stats, and how the run ended.
    pub async fn run(&self, initial: Vec<Message>, cancel: CancellationToken) -> AgentOutcome {
        let span = info_span!(
            "agent",
            model = %self.config.model,
            max_iterations = self.config.max_iterations,
        );
        self.run_inner(initial, cancel).instrument(span).await
    }

    async fn run_inner(&self, initial: Vec<Message>, cancel: CancellationToken) -> AgentOutcome {
        let started = Instant::now();
        let mut state = RunState::new(&self.config, initial);
        let mut cancelled = false;
        let mut failure: Option<CoderError> = None;

        // File-first mode: seed the log with the initial history.
        if let Some(log) = &self.config.file_first_log {
            if !log.exists() {
                if let Err(err) = write_log(log, &state.messages).await {
                    warn!(error = %err, "failed to seed message log");
                }
            }
        }

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            // File-first mode: the on-disk log is authoritative at the top
            // of every iteration.
            if let Some(log) = &self.config.file_first_log {
                match read_log(log).await {
                    Ok(Some(messages)) => state.messages = messages,
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "failed to reload message log"),
                }
            }
            let pre_len = state.messages.len();
            debug!(iteration, history = pre_len, "starting iteration");

            // G1 + G2: dispatch with error recovery.
            let response = match self.request(&mut state, &cancel).await {
                Ok(response) => response,
                Err(CoderError::Cancelled) => {
                    cancelled = true;
                    restore_alternation(&mut state.messages);
                    break;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };

            // G3: normalize and append the assistant turn.
            let raw = response.message().cloned().unwrap_or_default();
            let normalized = normalize_response(raw, &self.registry, self.config.merge_thinking);
            let mut assistant = normalized.message;
            drop_trailing_assistant(&mut state.messages);
            if let Some(middleware) = &self.middleware {
                middleware.amend_assistant(iteration, &mut assistant);
            }
            state.messages.push(assistant.clone());

            // G5: finish detection.
            if !assistant.has_tool_calls() {
                if self.registry.looks_like_tool_call(&assistant.content) {
                    debug!("assistant text looks like a malformed tool call");
                    state.messages.push(Message::user("continue"));
                    self.append_log(&state, pre_len, false).await;
                    continue;
                }
                if assistant.content.trim().is_empty() && !assistant.reasoning().is_empty() {
                    if state.empty_retries < self.config.max_empty_reasoning_retries {
                        state.empty_retries += 1;
                        state.messages.pop();
                        continue;
                    }
                    // Retries spent: promote the reasoning and demand action.
                    if let Some(last) = state.messages.last_mut() {
                        last.content = last.reasoning().trim().to_owned();
                        last.reasoning_content = None;
                    }
                    state.messages.push(Message::user(MAKE_THE_CALLS));
                    state.empty_retries = 0;
                    self.append_log(&state, pre_len, false).await;
                    continue;
                }
                info!(iteration, "final answer produced");
                self.append_log(&state, pre_len, false).await;
                break;
            }
            state.empty_retries = 0;

            // G6 + G7: execute the calls, bracketed by a checkpoint turn.
            let calls = assistant.tool_calls().to_vec();
            if let Some(engine) = &self.checkpoints {
                if let Err(err) = engine.start_turn().await {
                    debug!(error = %err, "start_turn failed");
                }
            }
            let (outcome, task_log_ran) = self
                .execute_tools(&mut state, &calls, pre_len, &cancel)
                .await;
            if let Some(engine) = &self.checkpoints {
                if let Err(err) = engine.end_turn().await {
                    debug!(error = %err, "end_turn failed");
                }
            }

            match outcome {
                ExecOutcome::Continue => {
                    // G8: loop detection appends a reminder to the last
                    // tool result.
                    if let Some(detection) = state.detector.detect() {
                        warn!(tool = %detection.tool_name, kind = ?detection.kind, "tool loop detected");
                        if let Some(last) = state.messages.last_mut() {
                            if last.role == Role::Tool {
                                last.content.push_str(&detection.reminder());
                            }
                        }
                    }
                    self.append_log(&state, pre_len, task_log_ran).await;
                }
                ExecOutcome::Backtracked => {
                    debug!(iteration, "backtracked to pre-iteration history");
                }
                ExecOutcome::Cancelled => {
                    cancelled = true;
                    restore_alternation(&mut state.messages);
                    self.append_log(&state, pre_len, task_log_ran).await;
                    break;
                }
                ExecOutcome::Fatal(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        state.stats.total_agent_time = started.elapsed();
        if !self.config.quiet {
            eprintln!();
            eprintln!("{}", state.stats.summary_line());
        }

        AgentOutcome {
            messages: state.messages,
            stats: state.stats,
            cancelled,
            failure,
        }
    }

    // -----------------------------------------------------------------------
    // G1 + G2 + G4: dispatch, error classification, usage accounting
    // -----------------------------------------------------------------------

    async fn request(
        &self,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let mut overflow_failures = 0u32;
        let mut overflow_total = 0u32;
        let mut approach_attempts = 0u32;
        let mut choice_retried = false;

        loop {
            if cancel.is_cancelled() {
                return Err(CoderError::Cancelled);
            }

            let mut request = ChatRequest::new(&self.config.model, state.messages.clone())
                .tools(self.registry.definitions());
            if let Some(temperature) = self.config.temperature {
                request = request.temperature(temperature);
            }
            if let Some(max_tokens) = self.config.max_tokens {
                request = request.max_tokens(max_tokens);
            }

            let ticker = Ticker::start(!self.config.quiet);
            let llm_started = Instant::now();
            let result = self.client.chat(&request, cancel).await;
            state.stats.total_llm_time += llm_started.elapsed();
            ticker.finish().await;

            match result {
                Ok(response) => {
                    state.stats.steps += 1;
                    let usage = response.usage();
                    state.stats.record_usage(usage);
                    state.last_recorded = (usage.prompt_tokens, usage.completion_tokens, 0.0);

                    // Prefer native token counts and cost when available.
                    if let Some(id) = &response.id {
                        match self.client.generation_stats(id).await {
                            Ok(Some(generation)) => {
                                state.stats.record_generation(usage, &generation);
                                state.last_recorded = (
                                    generation.prompt_tokens(),
                                    generation.completion_tokens(),
                                    generation.total_cost,
                                );
                            }
                            Ok(None) => {}
                            Err(err) => debug!(error = %err, "generation stats query failed"),
                        }
                    }

                    if let Some(choice_error) = response.choice_error() {
                        warn!(error = %choice_error.message, "provider returned a per-choice error");
                        if !choice_retried {
                            choice_retried = true;
                            continue;
                        }
                        state.provider_failures += 1;
                        if state.provider_failures >= self.config.max_provider_failures {
                            return Err(CoderError::ProviderChoice {
                                count: state.provider_failures,
                                message: choice_error.message.clone(),
                            });
                        }
                        choice_retried = false;
                        continue;
                    }

                    state.provider_failures = 0;
                    return Ok(response);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) if err.is_context_overflow() => {
                    state.stats.steps += 1;
                    overflow_failures += 1;
                    overflow_total += 1;

                    if overflow_failures < self.config.max_context_overflow_retries {
                        let range = trailing_tool_results(&state.messages);
                        debug!(rewritten = range.len(), "context overflow: degrading tool outputs");
                        for message in &mut state.messages[range] {
                            message.content = OVERFLOW_PLACEHOLDER.to_owned();
                        }
                        continue;
                    }
                    if approach_attempts < self.config.max_different_approach_attempts {
                        approach_attempts += 1;
                        overflow_failures = 0;
                        debug!(attempt = approach_attempts, "context overflow: requesting a different approach");
                        state.messages.push(Message::user(DIFFERENT_APPROACH));
                        continue;
                    }
                    return Err(CoderError::ContextOverflow {
                        attempts: overflow_total,
                    });
                }
                Err(err) => {
                    state.stats.steps += 1;
                    return Err(err);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // G6: tool execution
    // -----------------------------------------------------------------------

    async fn execute_tools(
        &self,
        state: &mut RunState,
        calls: &[ToolCall],
        pre_len: usize,
        cancel: &CancellationToken,
    ) -> (ExecOutcome, bool) {
        let mut task_log_ran = false;

        for (idx, call) in calls.iter().enumerate() {
            if cancel.is_cancelled() {
                fill_cancelled(&mut state.messages, &calls[idx..]);
                return (ExecOutcome::Cancelled, task_log_ran);
            }
            let name = call.function.name.clone();

            // Unknown tool.
            let Some(tool) = self.registry.get(&name).cloned() else {
                let err = ToolError::semantic(format!("Unknown tool '{name}'"));
                match self.absorb_error(state, call, &Value::Null, &err, pre_len) {
                    ErrorFlow::Backtracked => return (ExecOutcome::Backtracked, task_log_ran),
                    ErrorFlow::Wrote => continue,
                }
            };

            // Unconfirmed edit preview blocks other mutating tools.
            if let Some(pending) = pending_edit(&state.messages, &self.registry) {
                let mutating = tool.capabilities().iter().any(|c| {
                    matches!(c, Capability::Write | Capability::Shell | Capability::Edit)
                });
                if name != pending && mutating {
                    let err = ToolError::semantic(format!(
                        "tool '{name}' is blocked while an edit preview from '{pending}' is \
                         unconfirmed; confirm or cancel that edit first"
                    ));
                    match self.absorb_error(state, call, &Value::Null, &err, pre_len) {
                        ErrorFlow::Backtracked => {
                            return (ExecOutcome::Backtracked, task_log_ran);
                        }
                        ErrorFlow::Wrote => continue,
                    }
                }
            }

            // Argument normalisation, parse, and semantic validation.
            let raw_args = normalize_arguments(&call.function.arguments);
            let args: Value = match serde_json::from_str(&raw_args) {
                Ok(value) => value,
                Err(parse_err) => {
                    let err =
                        ToolError::semantic(format!("invalid JSON arguments: {parse_err}"));
                    match self.absorb_error(state, call, &Value::Null, &err, pre_len) {
                        ErrorFlow::Backtracked => {
                            return (ExecOutcome::Backtracked, task_log_ran);
                        }
                        ErrorFlow::Wrote => continue,
                    }
                }
            };
            if let Err(err) = tool.check(&args) {
                match self.absorb_error(state, call, &args, &err, pre_len) {
                    ErrorFlow::Backtracked => return (ExecOutcome::Backtracked, task_log_ran),
                    ErrorFlow::Wrote => continue,
                }
            }

            // Immediate duplicate of the previous call.
            let is_duplicate = state
                .last_call
                .as_ref()
                .is_some_and(|(last_name, last_args)| {
                    *last_name == name && *last_args == raw_args
                });
            if is_duplicate {
                state.duplicate_count += 1;
                let times = state.duplicate_count + 1;
                if times >= self.config.max_consecutive_duplicates {
                    return (
                        ExecOutcome::Fatal(CoderError::DuplicateLoop { tool: name, count: times }),
                        task_log_ran,
                    );
                }
                let err = ToolError::semantic(format!(
                    "DUPLICATE CALL: '{name}' was just called with exactly these arguments; \
                     the result would be identical. Take a different action."
                ));
                match self.absorb_error(state, call, &args, &err, pre_len) {
                    ErrorFlow::Backtracked => return (ExecOutcome::Backtracked, task_log_ran),
                    ErrorFlow::Wrote => continue,
                }
            }
            state.duplicate_count = 0;
            state.last_call = Some((name.clone(), raw_args));

            if tool.capabilities().contains(&Capability::TaskLog) {
                task_log_ran = true;
            }

            // Execute. Non-shell tools get a hard deadline; shell tools
            // inherit only the outer cancellation.
            let ctx = ToolContext::new(&self.workspace).with_cancel(cancel.clone());
            let is_shell = tool.capabilities().contains(&Capability::Shell);
            let ticker = Ticker::start(!self.config.quiet);
            let tool_started = Instant::now();
            let result = if is_shell {
                tokio::select! {
                    () = cancel.cancelled() => Err(ToolError::cancelled()),
                    result = tool.execute(args.clone(), &ctx) => result,
                }
            } else {
                match tokio::time::timeout(
                    self.config.tool_timeout,
                    tool.execute(args.clone(), &ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::timeout(self.config.tool_timeout.as_secs())),
                }
            };
            state.stats.total_tool_time += tool_started.elapsed();
            ticker.finish().await;

            match result {
                Ok(value) => {
                    let rendered = serde_json::to_string_pretty(&value)
                        .unwrap_or_else(|_| value.to_string());
                    state.detector.record(&name, &args, &rendered, false);
                    state.messages.push(Message::tool(&call.id, &name, rendered));
                }
                Err(err) if err.kind == ToolErrorKind::Cancelled => {
                    fill_cancelled(&mut state.messages, &calls[idx..]);
                    return (ExecOutcome::Cancelled, task_log_ran);
                }
                Err(err) if err.is_backtrackable() => {
                    match self.absorb_error(state, call, &args, &err, pre_len) {
                        ErrorFlow::Backtracked => {
                            return (ExecOutcome::Backtracked, task_log_ran);
                        }
                        ErrorFlow::Wrote => {}
                    }
                }
                Err(err) => {
                    let rendered = format!("Error: {}", err.message);
                    state.detector.record(&name, &args, &rendered, true);
                    state.messages.push(Message::tool(&call.id, &name, rendered));
                }
            }
        }

        (ExecOutcome::Continue, task_log_ran)
    }

    /// Route a semantic failure through the backtrack tracker, or write it
    /// into history as a tool result.
    fn absorb_error(
        &self,
        state: &mut RunState,
        call: &ToolCall,
        args: &Value,
        err: &ToolError,
        pre_len: usize,
    ) -> ErrorFlow {
        let name = &call.function.name;
        debug!(tool = %name, error = %err.message, kind = ?err.kind, "tool failure");

        if err.is_backtrackable() {
            if state.tracker.should_backtrack(pre_len) {
                state.messages.truncate(pre_len);
                let (prompt, completion, cost) = state.last_recorded;
                state.tracker.record_discarded(Usage::new(prompt, completion), cost);
                state.stats.move_to_discarded(prompt, completion, cost);
                return ErrorFlow::Backtracked;
            }
            let config = *state.tracker.config();
            if config.enabled && config.max_retries > 0 && config.inject_user_on_exhaustion {
                state.messages.truncate(pre_len);
                let notice = state.tracker.exhaustion_message(&err.message);
                state.messages.push(Message::user(notice));
                let (prompt, completion, cost) = state.last_recorded;
                state.tracker.record_discarded(Usage::new(prompt, completion), cost);
                state.stats.move_to_discarded(prompt, completion, cost);
                return ErrorFlow::Backtracked;
            }
        }

        let rendered = format!("Error: {}", err.message);
        state.detector.record(name, args, &rendered, true);
        state.messages.push(Message::tool(&call.id, name, rendered));
        ErrorFlow::Wrote
    }

    /// Append the iteration's new messages to the file-first log.
    async fn append_log(&self, state: &RunState, pre_len: usize, task_log_ran: bool) {
        let Some(log) = &self.config.file_first_log else {
            return;
        };
        // A tasks tool owns the log write for its iteration.
        if task_log_ran {
            return;
        }
        if let Some(new) = state.messages.get(pre_len..) {
            if let Err(err) = append_messages(log, new).await {
                warn!(error = %err, "failed to append message log");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Trim stray characters and unwrap JSON-string-of-JSON arguments.
fn normalize_arguments(raw: &str) -> String {
    let mut text = raw.trim();
    for fence in ["```json", "```"] {
        text = text.strip_prefix(fence).unwrap_or(text);
    }
    text = text.strip_suffix("```").unwrap_or(text).trim();
    if text.is_empty() {
        return "{}".to_owned();
    }
    // Providers sometimes wrap the arguments object in an extra layer of
    // string quoting.
    if let Ok(Value::String(inner)) = serde_json::from_str::<Value>(text) {
        if serde_json::from_str::<Value>(&inner).is_ok() {
            return inner;
        }
    }
    text.to_owned()
}

/// The tool holding an unconfirmed edit preview, if any.
///
/// Scans backwards from the end of history until the previous user
/// message. An edit-capability tool result containing `"status": "preview"`
/// is unresolved until the same tool is called again.
fn pending_edit(messages: &[Message], registry: &ToolRegistry) -> Option<String> {
    for message in messages.iter().rev() {
        match message.role {
            Role::User => return None,
            Role::Tool => {
                let Some(name) = message.name.as_deref() else {
                    continue;
                };
                if registry.has_capability(name, Capability::Edit) {
                    let preview = message.content.contains("\"status\": \"preview\"")
                        || message.content.contains("\"status\":\"preview\"");
                    return preview.then(|| name.to_owned());
                }
            }
            _ => {}
        }
    }
    None
}

/// Fill synthetic results for tool calls interrupted by cancellation.
fn fill_cancelled(messages: &mut Vec<Message>, remaining: &[ToolCall]) {
    for call in remaining {
        messages.push(Message::tool(
            &call.id,
            &call.function.name,
            CANCELLED_TOOL_RESULT,
        ));
    }
}

/// Append the cancellation marker when history ends in a tool result, so
/// the no-consecutive-assistant invariant holds symmetric for resumes.
fn restore_alternation(messages: &mut Vec<Message>) {
    if messages.last().is_some_and(|m| m.role == Role::Tool) {
        messages.push(Message::assistant(CANCELLED_MARKER));
    }
}

async fn write_log(path: &std::path::Path, messages: &[Message]) -> Result<()> {
    let mut out = String::new();
    for message in messages {
        out.push_str(&serde_json::to_string(message)?);
        out.push('\n');
    }
    tokio::fs::write(path, out).await?;
    Ok(())
}

async fn append_messages(path: &std::path::Path, messages: &[Message]) -> Result<()> {
    use tokio::io::AsyncWriteExt as _;
    let mut out = String::new();
    for message in messages {
        out.push_str(&serde_json::to_string(message)?);
        out.push('\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(out.as_bytes()).await?;
    Ok(())
}

async fn read_log(path: &std::path::Path) -> Result<Option<Vec<Message>>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut messages = Vec::new();
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        messages.push(serde_json::from_str(line)?);
    }
    Ok(Some(messages))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::super::testing::{ScriptedClient, Step, tool_call_message};
    use super::*;
    use crate::backtrack::BacktrackConfig;
    use crate::checkpoint::{CheckpointConfig, CheckpointEngine};
    use crate::tool::Tool;

    // -- test tools ---------------------------------------------------------

    struct ReadTool;

    #[async_trait]
    impl Tool for ReadTool {
        fn name(&self) -> &str {
            "read"
        }
        fn description(&self) -> &str {
            "Read a file"
        }
        fn schema(&self) -> Value {
            json!({"type": "object", "properties": {"path": {"type": "string"}}})
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::Read]
        }
        fn check(&self, args: &Value) -> std::result::Result<(), ToolError> {
            if args.get("path").and_then(Value::as_str).is_none() {
                return Err(ToolError::semantic("missing required field 'path'"));
            }
            Ok(())
        }
        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, ToolError> {
            Ok(json!({"lines_read": 3, "content": "x\ny\nz\n"}))
        }
    }

    struct SearchTool;

    #[async_trait]
    impl Tool for SearchTool {
        fn name(&self) -> &str {
            "search"
        }
        fn description(&self) -> &str {
            "Search the tree"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, ToolError> {
            Ok(json!({"matches": []}))
        }
    }

    /// Always fails semantic validation.
    struct StrictTool;

    #[async_trait]
    impl Tool for StrictTool {
        fn name(&self) -> &str {
            "edit"
        }
        fn description(&self) -> &str {
            "Edit a file"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn check(&self, _args: &Value) -> std::result::Result<(), ToolError> {
            Err(ToolError::semantic("read the file before editing it"))
        }
        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, ToolError> {
            Ok(Value::Null)
        }
    }

    /// Fails execution with an opaque error.
    struct BoomTool;

    #[async_trait]
    impl Tool for BoomTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "Always explodes"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, ToolError> {
            Err(ToolError::opaque("disk failure"))
        }
    }

    /// Sleeps past any reasonable deadline.
    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    // -- fixtures -----------------------------------------------------------

    fn registry() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(ReadTool)).unwrap();
        reg.register(Arc::new(SearchTool)).unwrap();
        reg.register(Arc::new(StrictTool)).unwrap();
        reg.register(Arc::new(BoomTool)).unwrap();
        reg.register(Arc::new(SlowTool)).unwrap();
        Arc::new(reg)
    }

    fn quiet_config() -> AgentConfig {
        AgentConfig::new("test-model").quiet(true)
    }

    fn no_backtrack(config: AgentConfig) -> AgentConfig {
        config.backtrack(BacktrackConfig {
            enabled: false,
            ..BacktrackConfig::default()
        })
    }

    fn history(task: &str) -> Vec<Message> {
        vec![Message::system("you are helpful"), Message::user(task)]
    }

    fn agent_loop(client: ScriptedClient, config: AgentConfig) -> (AgentLoop, tempfile::TempDir) {
        let workspace = tempfile::tempdir().unwrap();
        let agent = AgentLoop::new(Arc::new(client), registry(), workspace.path(), config);
        (agent, workspace)
    }

    fn assert_alternation(messages: &[Message]) {
        for pair in messages.windows(2) {
            assert!(
                !(pair[0].role == Role::Assistant && pair[1].role == Role::Assistant),
                "consecutive assistant messages in history"
            );
        }
    }

    // -- scenarios ----------------------------------------------------------

    #[tokio::test]
    async fn single_shot_final_answer() {
        let client = ScriptedClient::new(vec![Step::Reply(Message::assistant("4"))]);
        let (agent, _ws) = agent_loop(client, quiet_config());

        let outcome = agent
            .run(history("what is 2+2?"), CancellationToken::new())
            .await;

        assert!(outcome.success());
        assert!(!outcome.cancelled);
        assert_eq!(outcome.stats.steps, 1);
        assert_eq!(outcome.final_text(), Some("4"));
        assert_eq!(outcome.messages.len(), 3);
        assert_alternation(&outcome.messages);
    }

    #[tokio::test]
    async fn generation_stats_refine_wire_usage() {
        let client = ScriptedClient::new(vec![Step::Reply(Message::assistant("4"))])
            .with_generation_stats(crate::usage::GenerationStats {
                native_tokens_prompt: 42,
                native_tokens_completion: 7,
                native_tokens_cached: 30,
                total_cost: 0.02,
                latency: 150.0,
                ..crate::usage::GenerationStats::default()
            });
        let (agent, _ws) = agent_loop(client, quiet_config());

        let outcome = agent.run(history("hi"), CancellationToken::new()).await;

        // Native counts replace the wire usage (10 prompt / 5 completion).
        assert_eq!(outcome.stats.total_prompt_tokens, 42);
        assert_eq!(outcome.stats.total_completion_tokens, 7);
        assert_eq!(outcome.stats.total_cache_read_tokens, 30);
        assert!((outcome.stats.total_cost - 0.02).abs() < 1e-9);
        assert!((outcome.stats.total_prompt_ms - 150.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn one_tool_call_then_answer() {
        let client = ScriptedClient::new(vec![
            Step::Reply(tool_call_message("c1", "read", json!({"path": "a.txt"}))),
            Step::Reply(Message::assistant("3 lines.")),
        ]);
        let workspace = tempfile::tempdir().unwrap();
        let engine = Arc::new(
            CheckpointEngine::initialize(workspace.path(), CheckpointConfig::default()).await,
        );
        let agent = AgentLoop::new(
            Arc::new(client),
            registry(),
            workspace.path(),
            quiet_config(),
        )
        .with_checkpoints(Arc::clone(&engine));

        let outcome = agent
            .run(history("count lines in a.txt"), CancellationToken::new())
            .await;

        assert!(outcome.success());
        assert_eq!(outcome.final_text(), Some("3 lines."));

        // The tool message answers c1, between the two assistant turns.
        let tool_msg = outcome
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
        assert!(tool_msg.content.contains("lines_read"));
        assert_alternation(&outcome.messages);

        // Exactly one checkpoint turn, with no file changes.
        let turns = engine.list().await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].turn, 1);
        assert_eq!(turns[1].files_changed, 0);
        engine.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_call_loop_terminates_the_run() {
        let call = || tool_call_message("c", "search", json!({"q": "foo"}));
        let client = ScriptedClient::new(vec![
            Step::Reply(call()),
            Step::Reply(call()),
            Step::Reply(call()),
        ]);
        let (agent, _ws) = agent_loop(client, no_backtrack(quiet_config()));

        let outcome = agent
            .run(history("find foo"), CancellationToken::new())
            .await;

        assert!(!outcome.success());
        let failure = outcome.failure.unwrap();
        assert_eq!(
            failure.to_string(),
            "duplicate call loop: search called 3 times with same arguments"
        );
        // The second call produced a DUPLICATE error tool result.
        assert!(
            outcome
                .messages
                .iter()
                .any(|m| m.role == Role::Tool && m.content.contains("DUPLICATE CALL"))
        );
    }

    #[tokio::test]
    async fn duplicate_counter_resets_when_a_different_call_intervenes() {
        let search = || tool_call_message("c", "search", json!({"q": "foo"}));
        let client = ScriptedClient::new(vec![
            Step::Reply(search()),
            Step::Reply(tool_call_message("c2", "read", json!({"path": "a.txt"}))),
            Step::Reply(search()),
            Step::Reply(search()),
            Step::Reply(Message::assistant("done")),
        ]);
        let (agent, _ws) = agent_loop(client, no_backtrack(quiet_config()));

        let outcome = agent.run(history("go"), CancellationToken::new()).await;

        // The intervening read reset the budget: only one duplicate error,
        // and the run finishes normally.
        assert!(outcome.success());
        assert_eq!(outcome.final_text(), Some("done"));
        let duplicates = outcome
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool && m.content.contains("DUPLICATE CALL"))
            .count();
        assert_eq!(duplicates, 1);
    }

    #[tokio::test]
    async fn context_overflow_recovery_rewrites_and_escalates() {
        let client = ScriptedClient::new(vec![
            Step::Reply(tool_call_message("c1", "read", json!({"path": "a.txt"}))),
            Step::Overflow,
            Step::Overflow,
            Step::Reply(Message::assistant("recovered")),
        ]);
        let (agent, _ws) = agent_loop(client, quiet_config());

        let outcome = agent
            .run(history("read the file"), CancellationToken::new())
            .await;

        assert!(outcome.success());
        assert_eq!(outcome.final_text(), Some("recovered"));
        // Both failing calls and both successes count as steps.
        assert_eq!(outcome.stats.steps, 4);

        // The tool output was degraded to the placeholder.
        let tool_msg = outcome
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.starts_with("[Server error"));

        // The different-approach user message was injected.
        assert!(
            outcome
                .messages
                .iter()
                .any(|m| m.role == Role::User && m.content.contains("different approach"))
        );
        assert_alternation(&outcome.messages);
    }

    #[tokio::test]
    async fn malformed_tool_call_text_prompts_continue() {
        let mangled = "<tool_call>{\"name\": \"read\", \"arguments\": {broken}</tool_call>";
        let client = ScriptedClient::new(vec![
            Step::Reply(Message::assistant(mangled)),
            Step::Reply(Message::assistant("done")),
        ]);
        let (agent, _ws) = agent_loop(client, quiet_config());

        let outcome = agent.run(history("go"), CancellationToken::new()).await;

        assert!(outcome.success());
        assert_eq!(outcome.final_text(), Some("done"));
        assert!(
            outcome
                .messages
                .iter()
                .any(|m| m.role == Role::User && m.content == "continue")
        );
    }

    #[tokio::test]
    async fn empty_content_with_reasoning_retries_then_promotes() {
        let empty = || {
            let mut msg = Message::assistant("");
            msg.reasoning_content = Some("I am thinking about tools".to_owned());
            msg
        };
        let client = ScriptedClient::new(vec![
            Step::Reply(empty()),
            Step::Reply(empty()),
            Step::Reply(empty()),
            Step::Reply(empty()),
            Step::Reply(Message::assistant("done")),
        ]);
        let (agent, _ws) = agent_loop(client, quiet_config());

        let outcome = agent.run(history("go"), CancellationToken::new()).await;

        assert!(outcome.success());
        assert_eq!(outcome.final_text(), Some("done"));
        // The promoted reasoning became an assistant message, followed by
        // the make-the-calls prompt.
        let promoted = outcome
            .messages
            .iter()
            .position(|m| m.role == Role::Assistant && m.content == "I am thinking about tools")
            .unwrap();
        assert_eq!(outcome.messages[promoted + 1].content, MAKE_THE_CALLS);
        assert_eq!(outcome.stats.steps, 5);
        assert_alternation(&outcome.messages);
    }

    #[tokio::test]
    async fn choice_error_retries_once_then_recovers() {
        let client = ScriptedClient::new(vec![
            Step::ChoiceError("upstream hiccup"),
            Step::Reply(Message::assistant("fine")),
        ]);
        let (agent, _ws) = agent_loop(client, quiet_config());

        let outcome = agent.run(history("hi"), CancellationToken::new()).await;
        assert!(outcome.success());
        assert_eq!(outcome.final_text(), Some("fine"));
        assert_eq!(outcome.stats.steps, 2);
    }

    #[tokio::test]
    async fn repeated_choice_errors_fail_the_run() {
        let client = ScriptedClient::new(vec![
            Step::ChoiceError("broken"),
            Step::ChoiceError("broken"),
            Step::ChoiceError("broken"),
            Step::ChoiceError("broken"),
        ]);
        let (agent, _ws) = agent_loop(client, quiet_config());

        let outcome = agent.run(history("hi"), CancellationToken::new()).await;
        assert!(!outcome.success());
        assert!(matches!(
            outcome.failure,
            Some(CoderError::ProviderChoice { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn permanent_provider_error_fails_the_run() {
        let client = ScriptedClient::new(vec![Step::Fail("gateway down")]);
        let (agent, _ws) = agent_loop(client, quiet_config());

        let outcome = agent.run(history("hi"), CancellationToken::new()).await;
        assert!(!outcome.success());
        assert!(!outcome.cancelled);
    }

    // -- backtracking -------------------------------------------------------

    #[tokio::test]
    async fn backtrack_rewinds_history_and_accounts_discards() {
        let bad_call = || tool_call_message("c", "edit", json!({"file": "a"}));
        let client = ScriptedClient::new(vec![
            Step::Reply(bad_call()),
            Step::Reply(bad_call()),
            Step::Reply(Message::assistant("gave up")),
        ]);
        let config = quiet_config().backtrack(BacktrackConfig {
            enabled: true,
            max_retries: 1,
            inject_user_on_exhaustion: false,
        });
        let (agent, _ws) = agent_loop(client, config);

        let outcome = agent.run(history("edit it"), CancellationToken::new()).await;

        assert!(outcome.success());
        assert_eq!(outcome.final_text(), Some("gave up"));
        // One backtrack, then the exhausted retry wrote the error.
        assert_eq!(outcome.stats.backtrack_count, 1);
        assert!(outcome.stats.discarded_prompt_tokens > 0);
        let errors: Vec<_> = outcome
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool && m.content.starts_with("Error:"))
            .collect();
        assert_eq!(errors.len(), 1);
        assert_alternation(&outcome.messages);
    }

    #[tokio::test]
    async fn exhaustion_can_inject_a_corrective_user_message() {
        let bad_call = || tool_call_message("c", "edit", json!({"file": "a"}));
        let client = ScriptedClient::new(vec![
            Step::Reply(bad_call()),
            Step::Reply(bad_call()),
            Step::Reply(Message::assistant("understood")),
        ]);
        let config = quiet_config().backtrack(BacktrackConfig {
            enabled: true,
            max_retries: 1,
            inject_user_on_exhaustion: true,
        });
        let (agent, _ws) = agent_loop(client, config);

        let outcome = agent.run(history("edit it"), CancellationToken::new()).await;

        assert!(outcome.success());
        let corrective = outcome
            .messages
            .iter()
            .find(|m| m.role == Role::User && m.content.starts_with("Your last action failed"))
            .unwrap();
        assert!(corrective.content.contains("read the file before editing it"));
        // No tool error ever reached history.
        assert!(
            !outcome
                .messages
                .iter()
                .any(|m| m.role == Role::Tool && m.content.starts_with("Error:"))
        );
    }

    #[tokio::test]
    async fn opaque_errors_are_written_not_backtracked() {
        let client = ScriptedClient::new(vec![
            Step::Reply(tool_call_message("c1", "boom", json!({}))),
            Step::Reply(Message::assistant("oh well")),
        ]);
        let (agent, _ws) = agent_loop(client, quiet_config());

        let outcome = agent.run(history("go"), CancellationToken::new()).await;
        assert!(outcome.success());
        assert_eq!(outcome.stats.backtrack_count, 0);
        let tool_msg = outcome
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(tool_msg.content, "Error: disk failure");
    }

    #[tokio::test]
    async fn unknown_tool_yields_a_semantic_error_result() {
        let client = ScriptedClient::new(vec![
            Step::Reply(tool_call_message("c1", "teleport", json!({}))),
            Step::Reply(Message::assistant("ok")),
        ]);
        let (agent, _ws) = agent_loop(client, no_backtrack(quiet_config()));

        let outcome = agent.run(history("go"), CancellationToken::new()).await;
        let tool_msg = outcome
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(tool_msg.content, "Error: Unknown tool 'teleport'");
    }

    // -- loop detection -----------------------------------------------------

    #[tokio::test]
    async fn alternating_calls_get_a_reminder() {
        let flip = || tool_call_message("f", "read", json!({"path": "a"}));
        let flop = || tool_call_message("g", "search", json!({"q": "a"}));
        let mut steps = Vec::new();
        for _ in 0..3 {
            steps.push(Step::Reply(flip()));
            steps.push(Step::Reply(flop()));
        }
        steps.push(Step::Reply(Message::assistant("done")));
        let client = ScriptedClient::new(steps);
        let (agent, _ws) = agent_loop(client, quiet_config().max_iterations(10));

        let outcome = agent.run(history("go"), CancellationToken::new()).await;

        assert!(outcome.success());
        let reminded: Vec<_> = outcome
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool && m.content.contains("<system-reminder>"))
            .collect();
        assert!(!reminded.is_empty());
        assert!(reminded[0].content.contains("different approach"));
    }

    // -- timeouts and cancellation ------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn non_shell_tools_hit_the_deadline() {
        let client = ScriptedClient::new(vec![
            Step::Reply(tool_call_message("c1", "slow", json!({}))),
            Step::Reply(Message::assistant("moving on")),
        ]);
        let config = quiet_config().tool_timeout(Duration::from_millis(50));
        let (agent, _ws) = agent_loop(client, config);

        let outcome = agent.run(history("go"), CancellationToken::new()).await;
        assert!(outcome.success());
        let tool_msg = outcome
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("timed out after"));
    }

    #[tokio::test]
    async fn pre_cancelled_token_ends_immediately() {
        let client = ScriptedClient::new(vec![Step::Reply(Message::assistant("never"))]);
        let (agent, _ws) = agent_loop(client, quiet_config());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = agent.run(history("go"), cancel).await;

        assert!(outcome.cancelled);
        assert!(outcome.success());
        assert_eq!(outcome.stats.steps, 0);
    }

    // -- iteration budget ---------------------------------------------------

    #[tokio::test]
    async fn iteration_budget_bounds_the_loop() {
        let call = |i: usize| tool_call_message(&format!("c{i}"), "read", json!({"path": format!("f{i}")}));
        let steps: Vec<Step> = (0..20).map(|i| Step::Reply(call(i))).collect();
        let client = ScriptedClient::new(steps);
        let (agent, _ws) = agent_loop(client, quiet_config().max_iterations(4));

        let outcome = agent.run(history("go"), CancellationToken::new()).await;
        // One LLM call per iteration, never more than the budget.
        assert_eq!(outcome.stats.steps, 4);
    }

    // -- file-first persistence ---------------------------------------------

    #[tokio::test]
    async fn file_first_log_is_authoritative_and_appended() {
        let workspace = tempfile::tempdir().unwrap();
        let log = workspace.path().join("messages.jsonl");

        // Pre-seed a log that differs from the in-memory history.
        let seeded = vec![
            Message::system("you are helpful"),
            Message::user("answer from the log"),
        ];
        let mut contents = String::new();
        for msg in &seeded {
            contents.push_str(&serde_json::to_string(msg).unwrap());
            contents.push('\n');
        }
        std::fs::write(&log, contents).unwrap();

        let client = ScriptedClient::new(vec![Step::Reply(Message::assistant("from log"))]);
        let config = quiet_config().file_first(&log);
        let agent = AgentLoop::new(Arc::new(client), registry(), workspace.path(), config);

        // Pass a different in-memory history; the log must win.
        let outcome = agent
            .run(history("ignored prompt"), CancellationToken::new())
            .await;

        assert_eq!(outcome.final_text(), Some("from log"));
        assert!(
            outcome
                .messages
                .iter()
                .any(|m| m.content == "answer from the log")
        );

        // The final assistant message was appended to the log.
        let log_contents = std::fs::read_to_string(&log).unwrap();
        assert_eq!(log_contents.lines().count(), 3);
        assert!(log_contents.lines().last().unwrap().contains("from log"));
    }

    // -- helpers ------------------------------------------------------------

    #[test]
    fn argument_normalisation_unwraps_quoted_json() {
        assert_eq!(normalize_arguments(r#"{"a": 1}"#), r#"{"a": 1}"#);
        assert_eq!(
            normalize_arguments(r#""{\"a\": 1}""#),
            r#"{"a": 1}"#
        );
        assert_eq!(normalize_arguments("  "), "{}");
        assert_eq!(normalize_arguments("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
    }

    #[test]
    fn pending_edit_detects_unconfirmed_previews() {
        let mut registry = ToolRegistry::new();

        struct EditTool;
        #[async_trait]
        impl Tool for EditTool {
            fn name(&self) -> &str {
                "apply_edit"
            }
            fn description(&self) -> &str {
                "Edit with preview"
            }
            fn schema(&self) -> Value {
                json!({"type": "object"})
            }
            fn capabilities(&self) -> &[Capability] {
                &[Capability::Edit]
            }
            async fn execute(
                &self,
                _args: Value,
                _ctx: &ToolContext,
            ) -> std::result::Result<Value, ToolError> {
                Ok(Value::Null)
            }
        }
        registry.register(Arc::new(EditTool)).unwrap();

        let preview = json!({"status": "preview", "diff": "+x"});
        let messages = vec![
            Message::user("edit it"),
            Message::assistant(""),
            Message::tool("c1", "apply_edit", serde_json::to_string_pretty(&preview).unwrap()),
        ];
        assert_eq!(pending_edit(&messages, &registry), Some("apply_edit".to_owned()));

        // A later user message clears the pending state.
        let mut cleared = messages;
        cleared.push(Message::user("never mind"));
        assert_eq!(pending_edit(&cleared, &registry), None);
    }
}
