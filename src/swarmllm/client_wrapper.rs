//! Shared primitives for provider-agnostic model clients.
//!
//! The engine talks to language models exclusively through the
//! [`ModelClient`] trait; the supporting structs describe chat messages,
//! sampling options, and token accounting. Concrete implementations live in
//! [`crate::clients`] — the engine itself never constructs an HTTP request.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use swarmllm::client_wrapper::{ChatOptions, Message, ModelClient, Role};
//! use swarmllm::clients::ollama::OllamaClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let client = OllamaClient::new("http://localhost:11434");
//!
//!     let response = client
//!         .chat(
//!             "qwen2.5:7b",
//!             &[Message::user("Who are you?")],
//!             &ChatOptions::default(),
//!         )
//!         .await?;
//!
//!     println!("Assistant: {}", response.content);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::error::Error;

/// Result alias used across the model-facing surfaces.
pub type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Represents the possible roles for a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (or engine-assembled task prompt).
    User,
    /// An assistant authored message (model responses).
    Assistant,
    /// A tool-result message fed back into the conversation after a dispatch.
    Tool,
}

impl Role {
    /// Wire name used by chat APIs (`"system"`, `"user"`, `"assistant"`,
    /// `"tool"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single chat message.
///
/// `tool_name` is set only on [`Role::Tool`] messages and names the tool
/// whose output the message carries.
#[derive(Debug, Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: String,
    /// For tool-result messages, the fully-qualified tool name.
    pub tool_name: Option<String>,
}

impl Message {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_name: None,
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_name: None,
        }
    }

    /// Build an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_name: None,
        }
    }

    /// Build a tool-result message attributed to `tool_name`.
    pub fn tool(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_name: Some(tool_name.into()),
        }
    }
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    /// Number of prompt/input tokens reported by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens reported by the provider.
    pub output_tokens: usize,
}

impl TokenUsage {
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// Sampling and transport options for one chat call.
///
/// `tools` is a pass-through hint for providers with native function
/// calling; the engine parses tool invocations from the response text
/// regardless, so implementations are free to ignore it.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Sampling temperature, `0.0..=2.0`.
    pub temperature: f32,
    /// Schemas of the tools available to this call, as a provider hint only.
    pub tools: Option<Vec<serde_json::Value>>,
    /// Ask the provider to stream. Implementations that stream must still
    /// return the final concatenated text.
    pub stream: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            tools: None,
            stream: false,
        }
    }
}

/// The provider's answer to one chat call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Final assistant text (concatenated when streamed).
    pub content: String,
    /// Provider-specific completion status (e.g. `"stop"`), when reported.
    pub finish_reason: Option<String>,
    /// Token accounting, when the provider reports it.
    pub usage: Option<TokenUsage>,
}

/// Trait-driven abstraction for a concrete model provider.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so one client can
/// serve every concurrently running task. The abstraction deliberately
/// excludes conversation bookkeeping — message history is owned per task by
/// the executor.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send a full request/response style chat completion to `model`.
    ///
    /// The `messages` slice must include any system priming messages the
    /// caller wishes to send. Cancellation and per-call timeouts are enforced
    /// by the engine around this call, not inside it.
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> ClientResult<ChatResponse>;

    /// Enumerate the model identifiers this provider can serve.
    ///
    /// Used only by startup/config surfaces; the default returns an empty
    /// list.
    async fn list_models(&self) -> ClientResult<Vec<String>> {
        Ok(Vec::new())
    }
}
