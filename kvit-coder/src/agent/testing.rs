//! Scripted chat client for tests.
//!
//! Replays a fixed sequence of responses and errors, in the spirit of a
//! mock provider: no network, deterministic, and cheap to assert against.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{CoderError, Result};
use crate::gateway::{ChatClient, ChatRequest, ChatResponse, Choice, ChoiceError};
use crate::message::{Message, ToolCall};
use crate::usage::{GenerationStats, Usage};

/// One scripted exchange.
#[derive(Debug)]
pub(crate) enum Step {
    /// A successful response carrying this assistant message.
    Reply(Message),
    /// A successful response with a per-choice error instead of content.
    ChoiceError(&'static str),
    /// HTTP 400, the context-overflow signal.
    Overflow,
    /// A permanent provider failure.
    Fail(&'static str),
}

/// Deterministic [`ChatClient`] that pops one [`Step`] per call.
#[derive(Debug)]
pub(crate) struct ScriptedClient {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    generation: Option<GenerationStats>,
}

impl ScriptedClient {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            generation: None,
        }
    }

    /// Serve these generation stats for every completion id.
    pub(crate) fn with_generation_stats(mut self, stats: GenerationStats) -> Self {
        self.generation = Some(stats);
        self
    }

    /// Number of chat calls made so far.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn chat(
        &self,
        _request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        if cancel.is_cancelled() {
            return Err(CoderError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let step = self
            .steps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();

        match step {
            Some(Step::Reply(message)) => {
                let finish = if message.has_tool_calls() {
                    "tool_calls"
                } else {
                    "stop"
                };
                Ok(ChatResponse {
                    id: Some(format!("gen-{}", self.calls())),
                    model: Some("scripted".to_owned()),
                    choices: vec![Choice {
                        message,
                        finish_reason: Some(finish.to_owned()),
                        error: None,
                    }],
                    usage: Some(Usage::new(10, 5)),
                })
            }
            Some(Step::ChoiceError(message)) => Ok(ChatResponse {
                id: None,
                model: Some("scripted".to_owned()),
                choices: vec![Choice {
                    message: Message::assistant(""),
                    finish_reason: None,
                    error: Some(ChoiceError {
                        message: message.to_owned(),
                        code: None,
                    }),
                }],
                usage: None,
            }),
            Some(Step::Overflow) => Err(CoderError::provider(
                Some(400),
                "context length exceeded",
                true,
            )),
            Some(Step::Fail(message)) => Err(CoderError::provider(Some(503), message, false)),
            None => Err(CoderError::provider(Some(500), "script exhausted", true)),
        }
    }

    async fn generation_stats(&self, _id: &str) -> Result<Option<GenerationStats>> {
        Ok(self.generation)
    }
}

/// An assistant message requesting one tool call.
pub(crate) fn tool_call_message(id: &str, tool: &str, args: Value) -> Message {
    let mut msg = Message::assistant("");
    msg.tool_calls = Some(vec![ToolCall::new(id, tool, args.to_string())]);
    msg
}
