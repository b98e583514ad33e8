//! Scheduler scenarios: dependency ordering, upstream failure, concurrency
//! caps, and external cancellation.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use swarmllm::cancel::CancelToken;
use swarmllm::client_wrapper::{ChatOptions, ChatResponse, ClientResult, Message, ModelClient};
use swarmllm::config::{EndpointConfig, EngineConfig};
use swarmllm::engine::DelegationEngine;
use swarmllm::errors::TaskErrorKind;
use swarmllm::plan::TaskStatus;
use swarmllm::registry::{AgentRegistry, AgentRole};
use swarmllm::tool_backend::{BackendError, ToolBackend, ToolDescriptor, ToolOutput};

const PLANNER_MODEL: &str = "planner-model";
const EXEC_MODEL: &str = "exec-model";
const READER_MODEL: &str = "reader-model";

fn role(name: &str, model: &str, loop_limit: usize) -> AgentRole {
    AgentRole {
        name: name.to_string(),
        emoji: None,
        description: format!("{} role", name),
        planning_hints: String::new(),
        system_prompt: format!("You are {}.", name),
        model: model.to_string(),
        temperature: 0.2,
        max_context_tokens: 4096,
        loop_limit,
        default_tools: vec!["builtin.list_files".to_string()],
        forbidden_tools: Vec::new(),
    }
}

fn registry() -> AgentRegistry {
    let mut registry = AgentRegistry::empty();
    registry.insert(role("EXECUTOR", EXEC_MODEL, 3));
    registry.insert(role("READER", READER_MODEL, 3));
    registry
}

fn config(max_parallel: usize) -> EngineConfig {
    EngineConfig {
        planner_model_id: Some(PLANNER_MODEL.to_string()),
        max_parallel_tasks: max_parallel,
        endpoints: vec![
            EndpointConfig::new("http://stub-a", EXEC_MODEL).with_max_concurrent(2),
            EndpointConfig::new("http://stub-b", READER_MODEL).with_max_concurrent(2),
        ],
        ..EngineConfig::default()
    }
}

#[derive(Default)]
struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<String>>>,
    calls: Mutex<Vec<(String, Vec<Message>)>>,
}

impl ScriptedClient {
    fn script(&self, model: &str, responses: &[&str]) {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .extend(responses.iter().map(|s| s.to_string()));
    }

    fn calls_for(&self, model: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == model)
            .count()
    }

    fn prompt_of_nth_call(&self, model: &str, n: usize) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == model)
            .nth(n)
            .map(|(_, messages)| messages[1].content.clone())
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        _options: &ChatOptions,
    ) -> ClientResult<ChatResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(|queue| queue.pop_front());
        Ok(ChatResponse {
            content: next.unwrap_or_else(|| "done".to_string()),
            finish_reason: Some("stop".to_string()),
            usage: None,
        })
    }
}

/// Backend where every tool call fails.
struct FaultyBackend {
    tools: Vec<ToolDescriptor>,
}

impl FaultyBackend {
    fn new() -> Self {
        Self {
            tools: vec![ToolDescriptor::new(
                "builtin.list_files",
                "List directory entries",
                serde_json::json!({}),
            )],
        }
    }
}

#[async_trait]
impl ToolBackend for FaultyBackend {
    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }

    async fn call(
        &self,
        _name: &str,
        _args: &serde_json::Value,
    ) -> Result<ToolOutput, BackendError> {
        Ok(ToolOutput::err("injected fault"))
    }
}

/// Plain backend that answers every tool call successfully.
struct OkBackend {
    tools: Vec<ToolDescriptor>,
}

impl OkBackend {
    fn new() -> Self {
        Self {
            tools: vec![ToolDescriptor::new(
                "builtin.list_files",
                "List directory entries",
                serde_json::json!({}),
            )],
        }
    }
}

#[async_trait]
impl ToolBackend for OkBackend {
    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }

    async fn call(
        &self,
        _name: &str,
        _args: &serde_json::Value,
    ) -> Result<ToolOutput, BackendError> {
        Ok(ToolOutput::ok("ok"))
    }
}

/// A dependent task starts only after its dependency completes and its
/// prompt carries the dependency's labeled result.
#[tokio::test]
async fn dependent_task_sees_labeled_upstream_result() {
    let client = Arc::new(ScriptedClient::default());
    client.script(
        PLANNER_MODEL,
        &[r#"{"tasks":[
            {"id":"task_1","description":"Read README.md","agent_type":"READER","dependencies":[]},
            {"id":"task_2","description":"Summarize the README","agent_type":"EXECUTOR","dependencies":["task_1"]}]}"#],
    );
    client.script(READER_MODEL, &["CONTENTS_OF_README_MARKER"]);
    client.script(EXEC_MODEL, &["A fine summary."]);

    let engine = DelegationEngine::new(config(4), registry(), client.clone(), Arc::new(OkBackend::new()));
    let output = engine
        .run("Read README.md and summarize", &CancelToken::new())
        .await
        .unwrap();

    assert!(output.outcomes.iter().all(|o| o.status == TaskStatus::Completed));

    // task_2's prompt injects task_1's result under a label naming task_1.
    let exec_prompt = client.prompt_of_nth_call(EXEC_MODEL, 0).unwrap();
    assert!(exec_prompt.contains("Result of task_1"));
    assert!(exec_prompt.contains("CONTENTS_OF_README_MARKER"));

    // Happens-before across the dependency edge: the reader call was
    // recorded before the executor call.
    let calls = client.calls.lock().unwrap();
    let reader_index = calls.iter().position(|(m, _)| m == READER_MODEL).unwrap();
    let exec_index = calls.iter().position(|(m, _)| m == EXEC_MODEL).unwrap();
    assert!(reader_index < exec_index);
}

/// A task that exhausts its loop budget fails with loop_limit and its
/// dependent is cancelled without ever touching the model.
#[tokio::test]
async fn upstream_failure_cancels_downstream() {
    let client = Arc::new(ScriptedClient::default());
    client.script(
        PLANNER_MODEL,
        &[r#"{"tasks":[
            {"id":"task_1","description":"Keep trying the tool","agent_type":"EXECUTOR","dependencies":[]},
            {"id":"task_2","description":"Use the tool output","agent_type":"READER","dependencies":["task_1"]}]}"#],
    );
    // Loop limit is 3; every response asks for the failing tool again.
    let tool_call = "<builtin.list_files><path>src</path></builtin.list_files>";
    client.script(EXEC_MODEL, &[tool_call, tool_call, tool_call, tool_call]);

    let engine =
        DelegationEngine::new(config(4), registry(), client.clone(), Arc::new(FaultyBackend::new()));
    let output = engine.run("try the tool", &CancelToken::new()).await.unwrap();

    let task_1 = &output.outcomes[0];
    assert_eq!(task_1.status, TaskStatus::Failed);
    assert_eq!(task_1.error_kind, Some(TaskErrorKind::LoopLimit));

    let task_2 = &output.outcomes[1];
    assert_eq!(task_2.status, TaskStatus::Cancelled);
    assert_eq!(task_2.error_kind, Some(TaskErrorKind::UpstreamFailed));
    assert!(task_2.error_message.as_deref().unwrap().contains("task_1"));

    // The cancelled task never invoked its model.
    assert_eq!(client.calls_for(READER_MODEL), 0);

    // Partial success is still a normal run with a full report.
    assert!(output.final_text.trim_end().ends_with("1/2 tasks completed"));
}

/// Client that counts concurrent in-flight calls and sleeps to make
/// overlap observable.
struct CountingClient {
    plan: String,
    current: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl ModelClient for CountingClient {
    async fn chat(
        &self,
        model: &str,
        _messages: &[Message],
        _options: &ChatOptions,
    ) -> ClientResult<ChatResponse> {
        if model == PLANNER_MODEL {
            return Ok(ChatResponse {
                content: self.plan.clone(),
                finish_reason: None,
                usage: None,
            });
        }
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ChatResponse {
            content: "task done".to_string(),
            finish_reason: Some("stop".to_string()),
            usage: None,
        })
    }
}

/// Five independent tasks under `max_parallel_tasks = 2` never overlap
/// more than two at a time and need at least three waves of wall time.
#[tokio::test]
async fn concurrency_cap_is_honored() {
    let tasks: Vec<String> = (1..=5)
        .map(|i| {
            format!(
                r#"{{"id":"task_{}","description":"independent work {}","agent_type":"EXECUTOR","dependencies":[]}}"#,
                i, i
            )
        })
        .collect();
    let delay = Duration::from_millis(50);
    let client = Arc::new(CountingClient {
        plan: format!(r#"{{"tasks":[{}]}}"#, tasks.join(",")),
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        delay,
    });

    let engine =
        DelegationEngine::new(config(2), registry(), client.clone(), Arc::new(OkBackend::new()));
    let started = Instant::now();
    let output = engine.run("five things", &CancelToken::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(output.outcomes.len(), 5);
    assert!(output.outcomes.iter().all(|o| o.status == TaskStatus::Completed));
    assert!(
        client.peak.load(Ordering::SeqCst) <= 2,
        "peak concurrency {} exceeded the cap",
        client.peak.load(Ordering::SeqCst)
    );
    // ceil(5 / 2) = 3 waves of model time at minimum.
    assert!(elapsed >= delay * 3 - Duration::from_millis(5));
    assert!(output.final_text.trim_end().ends_with("5/5 tasks completed"));
}

/// Sequential mode: the same plan with `max_parallel_tasks = 1` never
/// overlaps tasks at all.
#[tokio::test]
async fn sequential_mode_runs_one_at_a_time() {
    let tasks: Vec<String> = (1..=3)
        .map(|i| {
            format!(
                r#"{{"id":"task_{}","description":"work {}","agent_type":"EXECUTOR","dependencies":[]}}"#,
                i, i
            )
        })
        .collect();
    let client = Arc::new(CountingClient {
        plan: format!(r#"{{"tasks":[{}]}}"#, tasks.join(",")),
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        delay: Duration::from_millis(20),
    });

    let engine =
        DelegationEngine::new(config(1), registry(), client.clone(), Arc::new(OkBackend::new()));
    let output = engine.run("three things", &CancelToken::new()).await.unwrap();

    assert!(output.outcomes.iter().all(|o| o.status == TaskStatus::Completed));
    assert_eq!(client.peak.load(Ordering::SeqCst), 1);
}

/// Client that hangs until the engine's cancellation path interrupts it.
struct SlowClient {
    plan: String,
}

#[async_trait]
impl ModelClient for SlowClient {
    async fn chat(
        &self,
        model: &str,
        _messages: &[Message],
        _options: &ChatOptions,
    ) -> ClientResult<ChatResponse> {
        if model == PLANNER_MODEL {
            return Ok(ChatResponse {
                content: self.plan.clone(),
                finish_reason: None,
                usage: None,
            });
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ChatResponse {
            content: "too late".to_string(),
            finish_reason: None,
            usage: None,
        })
    }
}

/// External cancellation trips in-flight tasks and returns well inside the
/// grace period, with every task reported cancelled.
#[tokio::test]
async fn external_cancellation_stops_the_run() {
    let client = Arc::new(SlowClient {
        plan: r#"{"tasks":[
            {"id":"task_1","description":"slow work","agent_type":"EXECUTOR","dependencies":[]},
            {"id":"task_2","description":"later work","agent_type":"EXECUTOR","dependencies":["task_1"]}]}"#
            .to_string(),
    });

    let engine = DelegationEngine::new(config(2), registry(), client, Arc::new(OkBackend::new()));
    let cancel = CancelToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trip.cancel();
    });

    let started = Instant::now();
    let output = engine.run("slow query", &cancel).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(output.outcomes.len(), 2);
    for outcome in &output.outcomes {
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert_eq!(outcome.error_kind, Some(TaskErrorKind::Cancelled));
    }
    assert!(output.final_text.trim_end().ends_with("0/2 tasks completed"));
}
