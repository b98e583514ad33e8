//! Ollama chat client.
//!
//! A [`ModelClient`] implementation over a local Ollama server's
//! `/api/chat` endpoint, with optional NDJSON streaming (chunks are
//! concatenated; the engine only consumes final text) and model
//! enumeration via `/api/tags`.
//!
//! # Example
//!
//! ```rust,no_run
//! use swarmllm::client_wrapper::{ChatOptions, Message, ModelClient};
//! use swarmllm::clients::ollama::OllamaClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let client = OllamaClient::new("http://localhost:11434");
//!
//!     for model in client.list_models().await? {
//!         println!("available: {}", model);
//!     }
//!
//!     let response = client
//!         .chat("qwen2.5:7b", &[Message::user("Hello!")], &ChatOptions::default())
//!         .await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```

use crate::swarmllm::client_wrapper::{
    ChatOptions, ChatResponse, ClientResult, Message, ModelClient, TokenUsage,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: WireOptions,
}

#[derive(Serialize)]
struct WireOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ChatWireResponse {
    #[serde(default)]
    message: Option<WireResponseMessage>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<usize>,
    #[serde(default)]
    eval_count: Option<usize>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

/// [`ModelClient`] for a local Ollama server.
pub struct OllamaClient {
    base_url: String,
    http: reqwest::Client,
}

impl OllamaClient {
    /// Client for the server at `base_url` (no trailing slash needed).
    ///
    /// The underlying HTTP client keeps connections pooled and alive so
    /// back-to-back model calls avoid reconnect overhead.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static configuration");
        Self { base_url, http }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn wire_messages<'a>(messages: &'a [Message]) -> Vec<WireMessage<'a>> {
        messages
            .iter()
            .map(|message| WireMessage {
                role: message.role.as_str(),
                content: &message.content,
            })
            .collect()
    }

    async fn chat_blocking(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> ClientResult<ChatResponse> {
        let request = ChatRequest {
            model,
            messages: Self::wire_messages(messages),
            stream: false,
            options: WireOptions {
                temperature: options.temperature,
            },
        };
        let response = self
            .http
            .post(self.endpoint("/api/chat"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let wire: ChatWireResponse = response.json().await?;
        Ok(ChatResponse {
            content: wire.message.map(|m| m.content).unwrap_or_default(),
            finish_reason: wire.done_reason,
            usage: usage_from(wire.prompt_eval_count, wire.eval_count),
        })
    }

    /// Streamed variant: read the NDJSON chunks and concatenate their
    /// message deltas into the final text.
    async fn chat_streaming(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> ClientResult<ChatResponse> {
        let request = ChatRequest {
            model,
            messages: Self::wire_messages(messages),
            stream: true,
            options: WireOptions {
                temperature: options.temperature,
            },
        };
        let response = self
            .http
            .post(self.endpoint("/api/chat"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let mut content = String::new();
        let mut finish_reason = None;
        let mut prompt_tokens = None;
        let mut eval_tokens = None;
        let mut pending = String::new();

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            pending.push_str(&String::from_utf8_lossy(&chunk?));
            // One JSON object per line; a partial trailing line stays pending.
            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let wire: ChatWireResponse = match serde_json::from_str(line) {
                    Ok(wire) => wire,
                    Err(err) => {
                        log::debug!("skipping malformed stream line: {}", err);
                        continue;
                    }
                };
                if let Some(message) = wire.message {
                    content.push_str(&message.content);
                }
                if wire.done_reason.is_some() {
                    finish_reason = wire.done_reason;
                }
                if wire.prompt_eval_count.is_some() {
                    prompt_tokens = wire.prompt_eval_count;
                }
                if wire.eval_count.is_some() {
                    eval_tokens = wire.eval_count;
                }
            }
        }

        Ok(ChatResponse {
            content,
            finish_reason,
            usage: usage_from(prompt_tokens, eval_tokens),
        })
    }
}

fn usage_from(prompt: Option<usize>, eval: Option<usize>) -> Option<TokenUsage> {
    match (prompt, eval) {
        (None, None) => None,
        (prompt, eval) => Some(TokenUsage {
            input_tokens: prompt.unwrap_or(0),
            output_tokens: eval.unwrap_or(0),
        }),
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> ClientResult<ChatResponse> {
        if options.stream {
            self.chat_streaming(model, messages, options).await
        } else {
            self.chat_blocking(model, messages, options).await
        }
    }

    async fn list_models(&self) -> ClientResult<Vec<String>> {
        let response = self
            .http
            .get(self.endpoint("/api/tags"))
            .send()
            .await?
            .error_for_status()?;
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|entry| entry.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = OllamaClient::new("http://localhost:11434/");
        assert_eq!(client.endpoint("/api/chat"), "http://localhost:11434/api/chat");
    }

    #[test]
    fn usage_requires_at_least_one_count() {
        assert!(usage_from(None, None).is_none());
        let usage = usage_from(Some(10), None).unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(usage.total(), 10);
    }
}
