//! Query decomposition: prompt assembly, plan parsing, validation, retry.
//!
//! The [`TaskPlanner`] turns a user query into a validated [`Plan`] with a
//! single model call (plus at most one retry):
//!
//! 1. Assemble the planning prompt — planner system prompt, the agent
//!    catalog, a bounded tool catalog, and up to three keyword-scored
//!    few-shot examples.
//! 2. Call the planner model and lift the first balanced JSON object out of
//!    the response (code fences and surrounding prose are tolerated).
//! 3. Validate via [`Plan::from_spec`]. On failure, re-prompt once with the
//!    validation error as feedback. On a second failure (or a transport
//!    error on both attempts), fall back to a single-task `EXECUTOR` plan
//!    wrapping the original query.
//!
//! Every attempt and outcome is traced.

use crate::swarmllm::client_wrapper::{ChatOptions, Message, ModelClient};
use crate::swarmllm::config::EngineConfig;
use crate::swarmllm::parser::balanced_object_end;
use crate::swarmllm::plan::{Plan, PlanSpec, TaskSpec};
use crate::swarmllm::registry::AgentRegistry;
use crate::swarmllm::tool_backend::ToolDescriptor;
use crate::swarmllm::trace::{TraceEvent, TraceEventType, TraceLogger};
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;

/// Tool-catalog bounds: list everything up to this many tools, then group
/// by server with at most `CATALOG_PER_SERVER` entries each.
const CATALOG_FLAT_LIMIT: usize = 20;
const CATALOG_PER_SERVER: usize = 5;

/// Errors that make planning impossible (fallback included).
#[derive(Debug)]
pub enum PlannerError {
    /// No planner model is configured and no endpoint provides one.
    NoModel,
    /// The fallback plan needs the `EXECUTOR` role, which is not registered.
    MissingFallbackRole,
}

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerError::NoModel => write!(f, "no planner model configured"),
            PlannerError::MissingFallbackRole => {
                write!(f, "fallback plan requires an EXECUTOR role in the registry")
            }
        }
    }
}

impl Error for PlannerError {}

/// A canned query→plan pair used as a few-shot example.
struct PlanExample {
    category: &'static str,
    triggers: &'static [&'static str],
    query: &'static str,
    plan: &'static str,
}

lazy_static! {
    /// Static example library, scored against the query by keyword overlap.
    static ref PLAN_EXAMPLES: Vec<PlanExample> = vec![
        PlanExample {
            category: "code",
            triggers: &["code", "implement", "fix", "refactor", "bug", "function", "patch", "test"],
            query: "Fix the off-by-one bug in src/pager.rs and run the tests",
            plan: r#"{"tasks":[{"id":"task_1","description":"Read src/pager.rs and locate the off-by-one bug","agent_type":"READER","dependencies":[]},{"id":"task_2","description":"Patch src/pager.rs to fix the bug found in task_1","agent_type":"CODER","dependencies":["task_1"]},{"id":"task_3","description":"Run the test suite and report the outcome","agent_type":"EXECUTOR","dependencies":["task_2"]}]}"#,
        },
        PlanExample {
            category: "files",
            triggers: &["file", "files", "read", "write", "list", "directory", "folder", "rename"],
            query: "List the files in 'docs' and read the largest one",
            plan: r#"{"tasks":[{"id":"task_1","description":"List the files in 'docs' with their sizes","agent_type":"READER","dependencies":[]},{"id":"task_2","description":"Read the largest file found in task_1 and return its content","agent_type":"READER","dependencies":["task_1"]}]}"#,
        },
        PlanExample {
            category: "research",
            triggers: &["summarize", "explain", "compare", "research", "find", "analyze", "review"],
            query: "Read README.md and summarize the project",
            plan: r#"{"tasks":[{"id":"task_1","description":"Read README.md","agent_type":"READER","dependencies":[]},{"id":"task_2","description":"Summarize the content gathered in task_1 in three paragraphs","agent_type":"EXECUTOR","dependencies":["task_1"],"expected_output":"A three paragraph summary"}]}"#,
        },
        PlanExample {
            category: "system",
            triggers: &["run", "command", "execute", "install", "shell", "script", "process"],
            query: "Run 'git status' and explain what it reports",
            plan: r#"{"tasks":[{"id":"task_1","description":"Run the command 'git status' and capture its output","agent_type":"EXECUTOR","dependencies":[]},{"id":"task_2","description":"Explain the output captured in task_1 in plain language","agent_type":"EXECUTOR","dependencies":["task_1"]}]}"#,
        },
    ];
}

/// Score the example library against a query and return the top `k`.
///
/// Score is the number of trigger words present in the lowercased query's
/// word set; zero-score examples are excluded; ties break by lexical
/// category order.
fn select_examples(query: &str, k: usize) -> Vec<&'static PlanExample> {
    let words: HashSet<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect();

    let mut scored: Vec<(usize, &PlanExample)> = PLAN_EXAMPLES
        .iter()
        .map(|example| {
            let score = example
                .triggers
                .iter()
                .filter(|trigger| words.contains(**trigger))
                .count();
            (score, example)
        })
        .filter(|(score, _)| *score > 0)
        .collect();

    scored.sort_by(|(sa, ea), (sb, eb)| sb.cmp(sa).then(ea.category.cmp(eb.category)));
    scored.into_iter().take(k).map(|(_, example)| example).collect()
}

/// Render the tool catalog, bounded regardless of installed tool count.
///
/// With at most [`CATALOG_FLAT_LIMIT`] tools every tool gets a
/// `name: description` line. Beyond that, tools are grouped by server
/// prefix with at most [`CATALOG_PER_SERVER`] entries per server and a
/// `... N more` marker for the remainder.
fn build_tool_catalog(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return "(no tools connected)".to_string();
    }
    if tools.len() <= CATALOG_FLAT_LIMIT {
        return tools
            .iter()
            .map(|tool| format!("{}: {}", tool.name, tool.description))
            .collect::<Vec<_>>()
            .join("\n");
    }

    let mut by_server: BTreeMap<&str, Vec<&ToolDescriptor>> = BTreeMap::new();
    for tool in tools {
        by_server.entry(tool.server()).or_default().push(tool);
    }

    let mut lines = Vec::new();
    for (server, server_tools) in by_server {
        lines.push(format!("[{}] ({} tools)", server, server_tools.len()));
        for tool in server_tools.iter().take(CATALOG_PER_SERVER) {
            lines.push(format!("  {}: {}", tool.name, tool.description));
        }
        if server_tools.len() > CATALOG_PER_SERVER {
            lines.push(format!("  ... {} more", server_tools.len() - CATALOG_PER_SERVER));
        }
    }
    lines.join("\n")
}

/// Lift the first balanced JSON object out of a model response.
fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let len = balanced_object_end(&text[start..])?;
    Some(&text[start..start + len])
}

/// Builds planning prompts and turns model responses into validated plans.
pub struct TaskPlanner<'a> {
    registry: &'a AgentRegistry,
    config: &'a EngineConfig,
}

impl<'a> TaskPlanner<'a> {
    /// Planner over the given registry and engine configuration.
    pub fn new(registry: &'a AgentRegistry, config: &'a EngineConfig) -> Self {
        Self { registry, config }
    }

    /// Produce a validated plan for `query`, retrying once and falling back
    /// to a single `EXECUTOR` task when both attempts fail.
    pub async fn plan(
        &self,
        client: &dyn ModelClient,
        tools: &[ToolDescriptor],
        query: &str,
        trace: &TraceLogger,
    ) -> Result<Plan, PlannerError> {
        let model = self
            .config
            .planner_model()
            .ok_or(PlannerError::NoModel)?
            .to_string();

        let mut feedback: Option<String> = None;
        for attempt in 1..=2u32 {
            let prompt = self.build_prompt(tools, query, feedback.as_deref());
            trace
                .emit(
                    TraceEvent::new(TraceEventType::PlanRequest).with_data(serde_json::json!({
                        "attempt": attempt,
                        "model": model.as_str(),
                        "query": query,
                        "prompt": prompt.as_str(),
                    })),
                )
                .await;

            let messages = [
                Message::system(self.planner_system_prompt()),
                Message::user(prompt),
            ];
            let options = ChatOptions {
                temperature: self.planner_temperature(),
                ..ChatOptions::default()
            };

            let response = match client.chat(&model, &messages, &options).await {
                Ok(response) => response,
                Err(err) => {
                    log::warn!("planner attempt {} failed: {}", attempt, err);
                    trace
                        .emit(
                            TraceEvent::new(TraceEventType::PlanValidationFailed).with_data(
                                serde_json::json!({
                                    "attempt": attempt,
                                    "error": format!("model call failed: {}", err),
                                }),
                            ),
                        )
                        .await;
                    feedback = Some("the previous attempt produced no response".to_string());
                    continue;
                }
            };

            match self.parse_and_validate(&response.content) {
                Ok(plan) => {
                    let ids: Vec<&str> = plan.tasks().iter().map(|t| t.id.as_str()).collect();
                    log::info!("plan accepted with {} task(s): {:?}", plan.len(), ids);
                    trace
                        .emit(
                            TraceEvent::new(TraceEventType::PlanResult).with_data(
                                serde_json::json!({
                                    "attempt": attempt,
                                    "task_count": plan.len(),
                                    "task_ids": ids,
                                    "response": response.content,
                                }),
                            ),
                        )
                        .await;
                    return Ok(plan);
                }
                Err(error) => {
                    log::warn!("plan attempt {} rejected: {}", attempt, error);
                    trace
                        .emit(
                            TraceEvent::new(TraceEventType::PlanValidationFailed).with_data(
                                serde_json::json!({
                                    "attempt": attempt,
                                    "error": error.as_str(),
                                    "response": response.content,
                                }),
                            ),
                        )
                        .await;
                    feedback = Some(error);
                }
            }
        }

        // Both attempts failed: wrap the query in a single EXECUTOR task.
        if !self.registry.contains("EXECUTOR") {
            return Err(PlannerError::MissingFallbackRole);
        }
        log::warn!("falling back to single-task plan");
        let fallback = PlanSpec {
            tasks: vec![TaskSpec {
                id: "task_1".to_string(),
                description: query.to_string(),
                agent_type: "EXECUTOR".to_string(),
                dependencies: Vec::new(),
                expected_output: None,
            }],
        };
        let plan = Plan::from_spec(fallback, self.registry)
            .map_err(|_| PlannerError::MissingFallbackRole)?;
        trace
            .emit(
                TraceEvent::new(TraceEventType::PlanResult).with_data(serde_json::json!({
                    "attempt": "fallback",
                    "task_count": 1,
                    "task_ids": ["task_1"],
                })),
            )
            .await;
        Ok(plan)
    }

    fn planner_system_prompt(&self) -> String {
        self.registry
            .get("PLANNER")
            .map(|role| role.system_prompt.clone())
            .unwrap_or_else(|_| {
                "You are a planning assistant. Decompose the request into subtasks \
                 and respond with JSON only."
                    .to_string()
            })
    }

    fn planner_temperature(&self) -> f32 {
        self.registry
            .get("PLANNER")
            .map(|role| role.temperature)
            .unwrap_or(0.2)
    }

    /// Assemble the planning prompt.
    fn build_prompt(
        &self,
        tools: &[ToolDescriptor],
        query: &str,
        feedback: Option<&str>,
    ) -> String {
        let mut prompt = String::new();

        prompt.push_str("## Available agents\n");
        for name in self.registry.roles() {
            if name == "PLANNER" {
                continue;
            }
            let role = self.registry.get(name).expect("listed role exists");
            prompt.push_str(&format!("- {}: {}", role.name, role.description));
            if !role.planning_hints.is_empty() {
                prompt.push_str(&format!(" ({})", role.planning_hints));
            }
            prompt.push('\n');
        }

        prompt.push_str("\n## Available tools\n");
        prompt.push_str(&build_tool_catalog(tools));
        prompt.push('\n');

        let examples = select_examples(query, self.config.planner_max_examples.min(3));
        if !examples.is_empty() {
            prompt.push_str("\n## Examples\n");
            for example in examples {
                prompt.push_str(&format!("Query: {}\nPlan: {}\n\n", example.query, example.plan));
            }
        }

        prompt.push_str("\n## Request\n");
        prompt.push_str(query);
        prompt.push('\n');

        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\nYour previous plan was rejected: {}. Produce a corrected plan.\n",
                feedback
            ));
        }

        prompt.push_str(
            "\nRespond with exactly one JSON object of the form \
             {\"tasks\":[{\"id\":\"task_1\",\"description\":\"...\",\"agent_type\":\"...\",\
             \"dependencies\":[],\"expected_output\":\"...\"}]} and nothing else. \
             Between 1 and 12 tasks; dependencies reference earlier task ids.",
        );
        prompt
    }

    /// Parse the model response into a spec and validate it against the
    /// registry. The returned error string doubles as retry feedback.
    fn parse_and_validate(&self, response: &str) -> Result<Plan, String> {
        let json = extract_first_json_object(response)
            .ok_or_else(|| "no JSON object found in the response".to_string())?;
        let spec: PlanSpec =
            serde_json::from_str(json).map_err(|err| format!("malformed plan JSON: {}", err))?;
        Plan::from_spec(spec, self.registry).map_err(|err| err.to_string())
    }
}
