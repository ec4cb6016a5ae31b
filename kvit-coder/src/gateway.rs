//! LLM gateway: the chat-completions caller and its retry policy.
//!
//! Two operations are exposed through the [`ChatClient`] trait:
//!
//! * [`chat`](ChatClient::chat): a synchronous (non-streaming) POST to an
//!   OpenAI-compatible `/chat/completions`;
//! * [`generation_stats`](ChatClient::generation_stats): an optional GET
//!   to `/generation?id=…` returning native token counts and cost.
//!
//! [`HttpGateway`] is the production implementation. Every attempt uses a
//! fresh transport: long-idle local servers drop pooled connections and
//! answer the next reuse with a stale EOF.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CoderError, Result};
use crate::message::Message;
use crate::usage::{GenerationStats, Usage};

/// Substrings in an HTTP 500 body that mark the failure as permanent:
/// prompt-template and role-ordering bugs do not heal with retries.
const PERMANENT_500_MARKERS: &[&str] = &[
    "failed to render template",
    "roles must alternate",
    "value is not callable",
    "is undefined",
    "invalid role",
];

/// A chat completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,

    /// Conversation messages.
    pub messages: Vec<Message>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Tool definitions in the wire format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,

    /// Tool-choice directive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    /// Always `false`; streaming is not used.
    pub stream: bool,
}

impl ChatRequest {
    /// Create a request for `model` over `messages`.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Self::default()
        }
    }

    /// Attach tool definitions and let the model choose freely.
    #[must_use]
    pub fn tools(mut self, tools: Vec<Value>) -> Self {
        if !tools.is_empty() {
            self.tools = Some(tools);
            self.tool_choice = Some(Value::String("auto".to_owned()));
        }
        self
    }

    /// Set the sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the completion budget.
    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A per-choice error object some providers attach instead of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceError {
    /// Error description.
    #[serde(default)]
    pub message: String,
    /// Provider-specific error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
}

/// One completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// The generated message.
    pub message: Message,
    /// Why the model stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Provider-side error for this choice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChoiceError>,
}

/// A chat completion response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Completion id, used for the generation-stats follow-up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Model that produced the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Completion choices; only the first is consumed.
    #[serde(default)]
    pub choices: Vec<Choice>,
    /// Token usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// The first choice, if any.
    #[must_use]
    pub fn primary(&self) -> Option<&Choice> {
        self.choices.first()
    }

    /// The per-choice error of the first choice, if any.
    #[must_use]
    pub fn choice_error(&self) -> Option<&ChoiceError> {
        self.primary().and_then(|c| c.error.as_ref())
    }

    /// The assistant message of the first choice.
    #[must_use]
    pub fn message(&self) -> Option<&Message> {
        self.primary().map(|c| &c.message)
    }

    /// Wire usage, or zeros.
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.usage.unwrap_or_default()
    }
}

/// Client interface the agent loop talks to.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a chat completion request.
    ///
    /// # Errors
    ///
    /// Returns [`CoderError::Cancelled`] when the token fires, or a
    /// [`CoderError::Provider`] after the retry budget is spent.
    async fn chat(&self, request: &ChatRequest, cancel: &CancellationToken)
    -> Result<ChatResponse>;

    /// Query detailed stats for a completed generation.
    ///
    /// The default implementation reports the capability as absent.
    ///
    /// # Errors
    ///
    /// Implementations may surface transport errors; callers treat any
    /// error as "stats unavailable".
    async fn generation_stats(&self, id: &str) -> Result<Option<GenerationStats>> {
        let _ = id;
        Ok(None)
    }
}

/// Retry configuration and endpoint location for [`HttpGateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Endpoint base, e.g. `http://localhost:8080/v1`.
    pub base_url: String,
    /// Bearer token, when the endpoint wants one.
    pub api_key: Option<String>,
    /// Total chat attempts before giving up.
    pub max_attempts: u32,
    /// First backoff delay; doubles per retry.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_owned(),
            api_key: None,
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(128),
        }
    }
}

impl GatewayConfig {
    /// Create a config pointing at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Set the bearer token.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Whether a failed attempt is worth repeating.
enum AttemptError {
    /// Transient: connection errors, 429, most 5xx, empty bodies.
    Retry(CoderError),
    /// Permanent: 4xx and the marked 500s. Surfaced immediately.
    Fail(CoderError),
}

/// The production chat-completions caller.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    config: GatewayConfig,
}

impl HttpGateway {
    /// Create a gateway from config.
    #[must_use]
    pub const fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Build the transport for a single attempt. Pooling is disabled so
    /// every attempt opens a fresh connection.
    fn transport(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()?)
    }

    async fn attempt(&self, request: &ChatRequest) -> std::result::Result<ChatResponse, AttemptError> {
        let client = self.transport().map_err(AttemptError::Fail)?;
        let url = format!("{}/chat/completions", self.config.base_url);

        let mut req = client.post(&url).json(request);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            AttemptError::Retry(CoderError::provider(None, e.to_string(), false))
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            AttemptError::Retry(CoderError::provider(Some(status), e.to_string(), false))
        })?;

        classify(status, &body)
    }
}

/// Classify one HTTP exchange into a response or a retry decision.
fn classify(status: u16, body: &str) -> std::result::Result<ChatResponse, AttemptError> {
    match status {
        200..=299 => parse_body(body, status),
        429 => Err(AttemptError::Retry(CoderError::provider(
            Some(status),
            truncated(body),
            false,
        ))),
        500 if is_permanent_500(body) => Err(AttemptError::Fail(CoderError::provider(
            Some(status),
            truncated(body),
            true,
        ))),
        500..=599 => Err(AttemptError::Retry(CoderError::provider(
            Some(status),
            truncated(body),
            false,
        ))),
        _ => Err(AttemptError::Fail(CoderError::provider(
            Some(status),
            truncated(body),
            true,
        ))),
    }
}

/// Parse a 2xx body, accommodating one specific upstream content-length
/// bug: a body truncated by exactly one closing brace.
fn parse_body(body: &str, status: u16) -> std::result::Result<ChatResponse, AttemptError> {
    if body.trim().is_empty() {
        return Err(AttemptError::Retry(CoderError::provider(
            Some(status),
            "empty response body",
            false,
        )));
    }
    match serde_json::from_str::<ChatResponse>(body) {
        Ok(resp) => Ok(resp),
        Err(err) if err.is_eof() => {
            let repaired = format!("{body}}}");
            serde_json::from_str::<ChatResponse>(&repaired).map_err(|_| {
                AttemptError::Retry(CoderError::provider(
                    Some(status),
                    format!("unparseable truncated body: {err}"),
                    false,
                ))
            })
        }
        Err(err) => Err(AttemptError::Retry(CoderError::provider(
            Some(status),
            format!("unparseable body: {err}"),
            false,
        ))),
    }
}

fn is_permanent_500(body: &str) -> bool {
    let lower = body.to_lowercase();
    PERMANENT_500_MARKERS.iter().any(|m| lower.contains(m))
}

fn truncated(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_owned()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

#[async_trait]
impl ChatClient for HttpGateway {
    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let mut delay = self.config.initial_backoff;

        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(CoderError::Cancelled);
            }

            match self.attempt(request).await {
                Ok(response) => return Ok(response),
                Err(AttemptError::Fail(err)) => return Err(err),
                Err(AttemptError::Retry(err)) => {
                    if attempt == self.config.max_attempts {
                        return Err(err);
                    }
                    warn!(attempt, error = %err, delay_s = delay.as_secs(), "chat attempt failed, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(CoderError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.config.max_backoff);
                }
            }
        }

        // max_attempts >= 1, so the loop always returns before falling out.
        Err(CoderError::provider(None, "retry budget exhausted", false))
    }

    async fn generation_stats(&self, id: &str) -> Result<Option<GenerationStats>> {
        #[derive(Deserialize)]
        struct Wrapper {
            data: GenerationStats,
        }

        let client = self.transport()?;
        let url = format!("{}/generation", self.config.base_url);

        let mut req = client.get(&url).query(&[("id", id)]);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        if !response.status().is_success() {
            debug!(id, status = response.status().as_u16(), "generation stats unavailable");
            return Ok(None);
        }
        let wrapper: Wrapper = response.json().await?;
        Ok(Some(wrapper.data))
    }
}
