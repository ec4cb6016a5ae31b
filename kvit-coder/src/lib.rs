//! Core of a headless coding agent.
//!
//! This crate drives a tool-augmented language-model session against a
//! working directory: a bounded [`agent`] loop alternates LLM calls and
//! tool executions, recovers from provider failures, detects call loops,
//! backtracks over semantic tool errors, snapshots the working tree per
//! turn through the [`checkpoint`] engine, and can replay scripted tasks
//! deterministically through the [`bench`] harness.
//!
//! The crate is headless by design: argument parsing, configuration
//! loading, terminal rendering, and the concrete tool implementations
//! live in the host. What the host supplies is a [`gateway::ChatClient`],
//! a [`tool::ToolRegistry`], and a workspace path.
//!
//! ```rust,ignore
//! use kvit_coder::agent::{AgentConfig, AgentLoop};
//! use kvit_coder::gateway::{GatewayConfig, HttpGateway};
//! use kvit_coder::message::Message;
//!
//! let client = Arc::new(HttpGateway::new(GatewayConfig::new(endpoint)));
//! let agent = AgentLoop::new(client, registry, workspace, AgentConfig::new(model));
//! let outcome = agent.run(vec![
//!     Message::system(system_prompt),
//!     Message::user(task),
//! ], cancel).await;
//! ```

pub mod agent;
pub mod backtrack;
pub mod bench;
pub mod checkpoint;
pub mod detect;
pub mod error;
pub mod gateway;
pub mod message;
pub mod normalize;
pub mod tool;
pub mod usage;

pub use agent::{AgentConfig, AgentLoop, AgentOutcome};
pub use error::{CoderError, Result, ToolError, ToolErrorKind};
pub use gateway::{ChatClient, ChatRequest, ChatResponse, GatewayConfig, HttpGateway};
pub use message::{Message, Role, ToolCall};
pub use usage::{AgentStats, GenerationStats, Usage};
