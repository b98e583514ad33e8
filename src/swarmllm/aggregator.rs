//! Final response composition.
//!
//! The aggregator turns the scheduler's outcomes into the user-facing
//! response: one block per task (role label, status, result or error), and
//! a trailing `N/M tasks completed` line. This is deterministic text
//! composition — no model call — unless the optional LLM pass is enabled,
//! in which case one call to the `AGGREGATOR` role (or the planner model)
//! rewrites the composed text into prose, with the input bounded by a
//! configurable budget.

use crate::swarmllm::client_wrapper::{ChatOptions, Message, ModelClient};
use crate::swarmllm::config::EngineConfig;
use crate::swarmllm::plan::TaskStatus;
use crate::swarmllm::registry::AgentRegistry;
use crate::swarmllm::scheduler::TaskOutcome;
use crate::swarmllm::trace::{TraceEvent, TraceEventType, TraceLogger};

/// Below this size a result is never truncated by the LLM-pass budget.
const TRUNCATION_FLOOR_CHARS: usize = 200;

/// Composes the final response from task outcomes.
pub struct Aggregator<'a> {
    registry: &'a AgentRegistry,
    config: &'a EngineConfig,
}

impl<'a> Aggregator<'a> {
    /// Aggregator over the registry (for role labels) and configuration.
    pub fn new(registry: &'a AgentRegistry, config: &'a EngineConfig) -> Self {
        Self { registry, config }
    }

    /// Deterministic composition: every task, its status, its result or
    /// error, and the `N/M tasks completed` summary line.
    pub fn compose(&self, outcomes: &[TaskOutcome]) -> String {
        let mut blocks = Vec::with_capacity(outcomes.len() + 1);
        for outcome in outcomes {
            let label = self
                .registry
                .get(&outcome.role)
                .map(|role| role.label())
                .unwrap_or_else(|_| outcome.role.clone());

            let mut block = format!("{} [{}]: {}\n", label, outcome.id, outcome.status);
            match outcome.status {
                TaskStatus::Completed => {
                    block.push_str(outcome.result.as_deref().unwrap_or(""));
                }
                _ => {
                    let kind = outcome
                        .error_kind
                        .map(|kind| kind.as_str())
                        .unwrap_or("unknown");
                    let message = outcome.error_message.as_deref().unwrap_or("");
                    block.push_str(&format!("Error ({}): {}", kind, message));
                }
            }
            blocks.push(block);
        }

        let completed = outcomes
            .iter()
            .filter(|outcome| outcome.status == TaskStatus::Completed)
            .count();
        blocks.push(format!("{}/{} tasks completed", completed, outcomes.len()));
        blocks.join("\n\n")
    }

    /// Composition followed by the optional single LLM rewrite.
    ///
    /// Falls back to the deterministic text when the pass is disabled or
    /// the model call fails; the summary line is re-appended if the model
    /// dropped it.
    pub async fn compose_final(
        &self,
        client: &dyn ModelClient,
        outcomes: &[TaskOutcome],
        trace: &TraceLogger,
    ) -> String {
        let composed = self.compose(outcomes);
        trace
            .emit(
                TraceEvent::new(TraceEventType::Aggregation).with_data(serde_json::json!({
                    "task_count": outcomes.len(),
                    "use_llm": self.config.aggregator_use_llm,
                    "composed_chars": composed.len(),
                })),
            )
            .await;

        if !self.config.aggregator_use_llm {
            return composed;
        }

        let bounded = self.bound_input(outcomes);
        let (model, temperature, system_prompt) = match self.registry.get("AGGREGATOR") {
            Ok(role) => (role.model.clone(), role.temperature, role.system_prompt.clone()),
            Err(_) => match self.config.planner_model() {
                Some(model) => (
                    model.to_string(),
                    0.3,
                    "You turn multi-agent task reports into one clear answer for the user."
                        .to_string(),
                ),
                None => return composed,
            },
        };

        let summary_line = composed
            .lines()
            .last()
            .unwrap_or_default()
            .to_string();
        let prompt = format!(
            "Rewrite the following task report as a concise answer for the user. \
             Keep every task's contribution; keep error information for failed tasks; \
             end with the line '{}'.\n\n{}",
            summary_line, bounded
        );

        let messages = [Message::system(system_prompt), Message::user(prompt)];
        let options = ChatOptions {
            temperature,
            ..ChatOptions::default()
        };
        match client.chat(&model, &messages, &options).await {
            Ok(response) if !response.content.trim().is_empty() => {
                let mut text = response.content;
                if !text.contains(&summary_line) {
                    text.push_str(&format!("\n\n{}", summary_line));
                }
                text
            }
            Ok(_) => composed,
            Err(err) => {
                log::warn!("aggregator LLM pass failed, using composed text: {}", err);
                composed
            }
        }
    }

    /// Compose with individual results truncated, longest first, until the
    /// whole text fits the LLM-pass input budget.
    fn bound_input(&self, outcomes: &[TaskOutcome]) -> String {
        let cap = self.config.aggregator_max_input_chars;
        let mut trimmed: Vec<TaskOutcome> = outcomes.to_vec();

        loop {
            let composed = self.compose(&trimmed);
            if composed.chars().count() <= cap {
                return composed;
            }
            // Halve the longest result; stop shrinking once everything is
            // small and the overhead alone exceeds the budget.
            let longest = trimmed
                .iter_mut()
                .filter_map(|outcome| outcome.result.as_mut())
                .max_by_key(|result| result.chars().count());
            match longest {
                Some(result) if result.chars().count() > TRUNCATION_FLOOR_CHARS => {
                    let keep = result.chars().count() / 2;
                    let mut shorter: String = result.chars().take(keep).collect();
                    shorter.push_str("…[truncated]");
                    *result = shorter;
                }
                _ => return self.compose(&trimmed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarmllm::errors::TaskErrorKind;

    fn outcome(id: &str, role: &str, status: TaskStatus) -> TaskOutcome {
        TaskOutcome {
            id: id.to_string(),
            role: role.to_string(),
            status,
            result: matches!(status, TaskStatus::Completed)
                .then(|| format!("result of {}", id)),
            error_kind: (!matches!(status, TaskStatus::Completed))
                .then_some(TaskErrorKind::UpstreamFailed),
            error_message: (!matches!(status, TaskStatus::Completed))
                .then(|| "dependency 'task_1' failed".to_string()),
            duration_ms: 5,
        }
    }

    #[test]
    fn lists_every_task_with_trailing_summary() {
        let registry = AgentRegistry::builtin();
        let config = EngineConfig::default();
        let aggregator = Aggregator::new(&registry, &config);

        let outcomes = vec![
            outcome("task_1", "EXECUTOR", TaskStatus::Completed),
            outcome("task_2", "READER", TaskStatus::Cancelled),
        ];
        let text = aggregator.compose(&outcomes);

        assert!(text.contains("EXECUTOR [task_1]: completed"));
        assert!(text.contains("result of task_1"));
        assert!(text.contains("READER [task_2]: cancelled"));
        assert!(text.contains("Error (upstream_failed)"));
        assert!(text.ends_with("1/2 tasks completed"));
    }

    #[test]
    fn composition_starts_with_the_first_tasks_role() {
        let registry = AgentRegistry::builtin();
        let config = EngineConfig::default();
        let aggregator = Aggregator::new(&registry, &config);
        let text = aggregator.compose(&[outcome("task_1", "EXECUTOR", TaskStatus::Completed)]);
        let label = registry.get("EXECUTOR").unwrap().label();
        assert!(text.starts_with(&label));
        assert!(text.ends_with("1/1 tasks completed"));
    }

    #[test]
    fn llm_input_truncates_longest_result_first() {
        let registry = AgentRegistry::builtin();
        let config = EngineConfig {
            aggregator_max_input_chars: 600,
            ..EngineConfig::default()
        };
        let aggregator = Aggregator::new(&registry, &config);

        let mut big = outcome("task_1", "EXECUTOR", TaskStatus::Completed);
        big.result = Some("x".repeat(5000));
        let mut small = outcome("task_2", "EXECUTOR", TaskStatus::Completed);
        small.result = Some("tiny".to_string());

        let bounded = aggregator.bound_input(&[big, small]);
        assert!(bounded.contains("tiny"));
        assert!(bounded.contains("…[truncated]"));
        assert!(bounded.chars().count() < 5000);
    }
}
