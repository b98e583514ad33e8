//! Per-task agent execution: prompt assembly and the tool-call loop.
//!
//! An [`AgentExecutor`] runs exactly one task under one role. It assembles
//! the task prompt (role system prompt, the role's effective tools,
//! dependency results, the task description), then iterates:
//!
//! 1. acquire a pool slot for the role's model (bounded wait),
//! 2. call the model with the accumulated history (bounded by the per-call
//!    timeout),
//! 3. release the slot and parse the response for tool calls,
//! 4. dispatch each call in emission order, feeding results (or error text)
//!    back into the history.
//!
//! The loop terminates on the first response with no tool calls (the task
//! result), on two consecutive empty responses, on garbage output, or on
//! the role's iteration budget. For the latter three, one optional
//! escalation attempt reruns a single iteration on the configured fallback
//! model with the same history.
//!
//! Tool-level failures never terminate the task: the model sees the error
//! text and may adapt. Forbidden and unknown tool names come back to the
//! model as synthetic tool results for the same reason.

use crate::swarmllm::cancel::CancelToken;
use crate::swarmllm::client_wrapper::{ChatOptions, Message, ModelClient};
use crate::swarmllm::config::EngineConfig;
use crate::swarmllm::errors::{TaskError, TaskErrorKind};
use crate::swarmllm::model_pool::{ModelPool, PoolError};
use crate::swarmllm::parser::{CompositeParser, ParsedCall};
use crate::swarmllm::plan::Task;
use crate::swarmllm::registry::AgentRole;
use crate::swarmllm::tool_backend::{BackendError, ToolBackend, ToolDescriptor};
use crate::swarmllm::trace::{TraceEvent, TraceEventType, TraceLogger};
use std::sync::Arc;

/// Tools listed with full description and schema; beyond this, name and a
/// one-line description only.
const TOOL_BLOCK_FULL_LIMIT: usize = 10;

/// Result of a dependency task, injected into the dependent's prompt.
pub struct DependencyResult {
    /// Id of the completed dependency.
    pub id: String,
    /// Its result text (truncated at injection time).
    pub result: String,
}

/// Executes a single task with a single role.
pub struct AgentExecutor {
    client: Arc<dyn ModelClient>,
    backend: Arc<dyn ToolBackend>,
    pool: ModelPool,
    config: Arc<EngineConfig>,
}

impl AgentExecutor {
    /// Executor over the shared engine collaborators.
    pub fn new(
        client: Arc<dyn ModelClient>,
        backend: Arc<dyn ToolBackend>,
        pool: ModelPool,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            client,
            backend,
            pool,
            config,
        }
    }

    /// Run `task` to a terminal result.
    ///
    /// `snapshot` is the full tool snapshot (used to distinguish unknown
    /// from forbidden names); `effective` is this role's permitted subset;
    /// `dependencies` are the completed direct dependencies in plan order.
    pub async fn execute(
        &self,
        task: &Task,
        role: &AgentRole,
        snapshot: &[ToolDescriptor],
        effective: &[ToolDescriptor],
        dependencies: &[DependencyResult],
        cancel: &CancelToken,
        trace: &TraceLogger,
    ) -> Result<String, TaskError> {
        let parser = CompositeParser::new()
            .with_known_tools(snapshot.iter().map(|tool| tool.name.clone()));

        let mut history = vec![
            Message::system(role.system_prompt.clone()),
            Message::user(self.build_task_prompt(task, effective, dependencies)),
        ];

        let outcome = self
            .run_loop(task, role, &role.model, effective, &parser, &mut history, cancel, trace)
            .await;

        let error = match outcome {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        if error.kind.escalatable()
            && self.config.escalation_enabled()
            && self.config.fallback_model_id.is_some()
        {
            let fallback = self.config.fallback_model_id.clone().expect("checked above");
            log::info!(
                "task {}: escalating to '{}' after {}",
                task.id,
                fallback,
                error.kind
            );
            trace
                .emit(
                    TraceEvent::new(TraceEventType::Escalation)
                        .with_task(&task.id)
                        .with_role(&role.name)
                        .with_data(serde_json::json!({
                            "from_model": role.model,
                            "to_model": fallback,
                            "reason": error.kind.as_str(),
                        })),
                )
                .await;

            if let Ok(result) = self
                .escalation_attempt(task, role, &fallback, effective, &parser, &mut history, cancel, trace)
                .await
            {
                return Ok(result);
            }
        }

        Err(error)
    }

    /// The main tool-call loop on `model`.
    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        task: &Task,
        role: &AgentRole,
        model: &str,
        effective: &[ToolDescriptor],
        parser: &CompositeParser,
        history: &mut Vec<Message>,
        cancel: &CancelToken,
        trace: &TraceLogger,
    ) -> Result<String, TaskError> {
        let mut tool_iterations = 0usize;
        let mut consecutive_empty = 0usize;
        let mut round = 0usize;

        loop {
            round += 1;
            let response = self
                .model_round(task, role, model, history, cancel, trace, round)
                .await?;

            trace
                .emit(
                    TraceEvent::new(TraceEventType::LoopIteration)
                        .with_task(&task.id)
                        .with_role(&role.name)
                        .with_data(serde_json::json!({
                            "round": round,
                            "tool_iterations": tool_iterations,
                            "response_chars": response.len(),
                        })),
                )
                .await;

            if response.trim().is_empty() {
                consecutive_empty += 1;
                if consecutive_empty >= 2 {
                    return Err(TaskError::new(
                        TaskErrorKind::EmptyResponse,
                        "model returned empty output on two consecutive iterations",
                    ));
                }
                continue;
            }
            consecutive_empty = 0;

            if is_corrupt(&response) {
                return Err(TaskError::new(
                    TaskErrorKind::CorruptOutput,
                    "model output starts with non-ASCII garbage and contains no recognizable words",
                ));
            }

            let calls = parser.parse(&response);
            if calls.is_empty() {
                trace
                    .emit(
                        TraceEvent::new(TraceEventType::EarlyExit)
                            .with_task(&task.id)
                            .with_role(&role.name)
                            .with_data(serde_json::json!({
                                "round": round,
                                "tool_iterations": tool_iterations,
                            })),
                    )
                    .await;
                return Ok(response);
            }

            history.push(Message::assistant(response));
            self.dispatch_calls(task, role, effective, &calls, history, cancel, trace)
                .await?;

            tool_iterations += 1;
            if tool_iterations >= role.loop_limit {
                return Err(TaskError::new(
                    TaskErrorKind::LoopLimit,
                    format!("{} tool iterations exhausted", role.loop_limit),
                ));
            }
        }
    }

    /// One final iteration on the fallback model; success only when it
    /// yields a terminal (call-free, non-empty, non-corrupt) response.
    #[allow(clippy::too_many_arguments)]
    async fn escalation_attempt(
        &self,
        task: &Task,
        role: &AgentRole,
        model: &str,
        effective: &[ToolDescriptor],
        parser: &CompositeParser,
        history: &mut Vec<Message>,
        cancel: &CancelToken,
        trace: &TraceLogger,
    ) -> Result<String, TaskError> {
        let response = self
            .model_round(task, role, model, history, cancel, trace, 0)
            .await?;
        if response.trim().is_empty() {
            return Err(TaskError::new(
                TaskErrorKind::EmptyResponse,
                "fallback model returned empty output",
            ));
        }
        if is_corrupt(&response) {
            return Err(TaskError::new(
                TaskErrorKind::CorruptOutput,
                "fallback model output is corrupt",
            ));
        }
        let calls = parser.parse(&response);
        if !calls.is_empty() {
            // Executing further tool rounds would restart the loop; the
            // escalation budget is exactly one attempt.
            return Err(TaskError::new(
                TaskErrorKind::LoopLimit,
                "fallback model requested more tool calls",
            ));
        }
        Ok(response)
    }

    /// Acquire a slot, call the model once with the history, release.
    #[allow(clippy::too_many_arguments)]
    async fn model_round(
        &self,
        task: &Task,
        role: &AgentRole,
        model: &str,
        history: &[Message],
        cancel: &CancelToken,
        trace: &TraceLogger,
        round: usize,
    ) -> Result<String, TaskError> {
        if cancel.is_cancelled() {
            return Err(TaskError::new(TaskErrorKind::Cancelled, "task cancelled"));
        }

        let slot = tokio::select! {
            slot = self.pool.acquire(model, self.config.pool_acquire_timeout) => {
                slot.map_err(|err| match err {
                    PoolError::AcquireTimeout(_) | PoolError::NoEndpoint(_) => {
                        TaskError::new(TaskErrorKind::PoolTimeout, err.to_string())
                    }
                })?
            }
            _ = cancel.cancelled() => {
                return Err(TaskError::new(TaskErrorKind::Cancelled, "task cancelled"));
            }
        };

        trace
            .emit(
                TraceEvent::new(TraceEventType::ModelCall)
                    .with_task(&task.id)
                    .with_role(&role.name)
                    .with_data(serde_json::json!({
                        "model": model,
                        "endpoint": slot.url(),
                        "round": round,
                        "messages": history.len(),
                    })),
            )
            .await;

        let options = ChatOptions {
            temperature: role.temperature,
            ..ChatOptions::default()
        };
        let call = self.client.chat(model, history, &options);
        let response = tokio::select! {
            response = tokio::time::timeout(self.config.model_call_timeout, call) => {
                match response {
                    Ok(Ok(response)) => response.content,
                    Ok(Err(err)) => {
                        // Transport failures are treated like an empty round so
                        // the loop's empty-response accounting (and escalation)
                        // applies.
                        log::warn!("task {}: model call failed: {}", task.id, err);
                        String::new()
                    }
                    Err(_) => {
                        return Err(TaskError::new(
                            TaskErrorKind::ModelTimeout,
                            format!("model call exceeded {:?}", self.config.model_call_timeout),
                        ));
                    }
                }
            }
            _ = cancel.cancelled() => {
                return Err(TaskError::new(TaskErrorKind::Cancelled, "task cancelled"));
            }
        };
        drop(slot);
        Ok(response)
    }

    /// Dispatch parsed calls in order, appending each result to the history.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_calls(
        &self,
        task: &Task,
        role: &AgentRole,
        effective: &[ToolDescriptor],
        calls: &[ParsedCall],
        history: &mut Vec<Message>,
        cancel: &CancelToken,
        trace: &TraceLogger,
    ) -> Result<(), TaskError> {
        for call in calls {
            let known = effective.iter().any(|tool| tool.name == call.name);
            let args = serde_json::Value::Object(call.args.clone());

            let (result_text, error_kind) = if !known {
                let kind = TaskErrorKind::ForbiddenTool;
                (
                    format!(
                        "Error ({}): tool '{}' is not available to this agent",
                        kind, call.name
                    ),
                    Some(kind),
                )
            } else {
                let dispatch = self.backend.call(&call.name, &args);
                let output = tokio::select! {
                    output = dispatch => output,
                    _ = cancel.cancelled() => {
                        return Err(TaskError::new(TaskErrorKind::Cancelled, "task cancelled"));
                    }
                };
                match output {
                    Ok(output) if output.is_error => (
                        format!("Error ({}): {}", TaskErrorKind::ToolFailed, output.text),
                        Some(TaskErrorKind::ToolFailed),
                    ),
                    Ok(output) => (output.text, None),
                    Err(BackendError::UnknownTool(name)) => (
                        format!(
                            "Error ({}): tool '{}' does not exist",
                            TaskErrorKind::UnknownTool,
                            name
                        ),
                        Some(TaskErrorKind::UnknownTool),
                    ),
                }
            };

            trace
                .emit(
                    TraceEvent::new(TraceEventType::ToolCall)
                        .with_task(&task.id)
                        .with_role(&role.name)
                        .with_data(serde_json::json!({
                            "tool": call.name,
                            "arguments": args,
                            "result": result_text,
                            "error_kind": error_kind.map(|kind| kind.as_str()),
                        })),
                )
                .await;

            history.push(Message::tool(&call.name, result_text));
        }
        Ok(())
    }

    /// Assemble the user prompt for one task.
    fn build_task_prompt(
        &self,
        task: &Task,
        effective: &[ToolDescriptor],
        dependencies: &[DependencyResult],
    ) -> String {
        let mut prompt = String::new();

        if !effective.is_empty() {
            prompt.push_str("## Your tools\n");
            for (index, tool) in effective.iter().enumerate() {
                if index < TOOL_BLOCK_FULL_LIMIT {
                    prompt.push_str(&format!("### {}\n{}\nArguments schema: {}\n", tool.name, tool.description, tool.schema));
                } else {
                    prompt.push_str(&format!("- {}: {}\n", tool.name, one_line(&tool.description)));
                }
            }
            prompt.push_str(
                "\nTo call a tool, respond with a tagged block, e.g. \
                 <builtin.read_file><path>notes.txt</path></builtin.read_file>, or a JSON \
                 object {\"name\": \"<tool>\", \"arguments\": {...}}. A fenced ```python \
                 block is executed as code. You may emit several calls in one response; \
                 I will reply with their results. When you are done, answer in plain \
                 text with no tool calls.\n",
            );
        }

        if !dependencies.is_empty() {
            prompt.push_str("\n## Results from earlier tasks\n");
            let mut budget = self.config.context_max_chars;
            for dependency in dependencies {
                if budget == 0 {
                    prompt.push_str("[... remaining dependency results omitted]\n");
                    break;
                }
                let per_dep = self.config.dep_result_max_chars.min(budget);
                let truncated = truncate_chars(&dependency.result, per_dep);
                budget -= truncated.chars().count().min(budget);
                prompt.push_str(&format!("### Result of {}\n{}\n", dependency.id, truncated));
            }
        }

        prompt.push_str("\n## Task\n");
        prompt.push_str(&task.description);
        prompt.push('\n');
        if let Some(expected) = &task.expected_output {
            prompt.push_str(&format!("\nExpected output: {}\n", expected));
        }
        prompt.push_str("\nComplete the task now.");
        prompt
    }
}

/// First line of a description, for the collapsed tool listing.
fn one_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

/// Character-bounded truncation with a marker.
fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", kept)
}

/// Garbage heuristic: leading codepoint above ASCII and no ASCII word of
/// length ≥ 3 anywhere in the text.
fn is_corrupt(text: &str) -> bool {
    let first = match text.trim_start().chars().next() {
        Some(c) => c,
        None => return false,
    };
    if (first as u32) <= 127 {
        return false;
    }
    !text
        .split_whitespace()
        .any(|word| word.len() >= 3 && word.chars().all(|c| c.is_ascii_alphanumeric()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_detection() {
        assert!(is_corrupt("ÿÿÿ ¤¤ §§"));
        assert!(!is_corrupt("ÿ but the words are fine"));
        assert!(!is_corrupt("plain answer"));
        assert!(!is_corrupt(""));
    }

    #[test]
    fn truncation_preserves_short_text() {
        assert_eq!(truncate_chars("short", 10), "short");
        let long = "x".repeat(50);
        let truncated = truncate_chars(&long, 10);
        assert!(truncated.chars().count() <= 10);
        assert!(truncated.ends_with('…'));
    }
}
