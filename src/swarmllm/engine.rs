//! The top-level delegation engine.
//!
//! [`DelegationEngine`] wires the planner, scheduler, executor, model pool,
//! aggregator, and trace logger behind a single entry point:
//! [`DelegationEngine::run`]. One call takes a user query to a final
//! response:
//!
//! ```text
//! query → Planner → Plan → Scheduler ⇄ AgentExecutor ⇄ {ModelPool, ToolBackend}
//!                                   ↓
//!                              Aggregator → final text
//! ```
//!
//! The engine holds no process-wide mutable state: configuration is fixed
//! at construction and every `run` owns its own trace file, pool bookkeeping
//! aside. `run` returns normally with per-task outcomes even when tasks
//! fail; it errors only when no plan can be produced at all or the trace
//! file cannot be opened.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use swarmllm::cancel::CancelToken;
//! use swarmllm::clients::ollama::OllamaClient;
//! use swarmllm::config::{EndpointConfig, EngineConfig};
//! use swarmllm::engine::DelegationEngine;
//! use swarmllm::registry::AgentRegistry;
//! use swarmllm::tool_backend::BuiltinToolBackend;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig {
//!     endpoints: vec![EndpointConfig::new("http://localhost:11434", "qwen2.5:7b")],
//!     ..EngineConfig::default()
//! };
//! let engine = DelegationEngine::new(
//!     config,
//!     AgentRegistry::builtin(),
//!     Arc::new(OllamaClient::new("http://localhost:11434")),
//!     Arc::new(BuiltinToolBackend::new("workspace".into())?),
//! );
//!
//! let output = engine.run("Read README.md and summarize it", &CancelToken::new()).await?;
//! println!("{}", output.final_text);
//! # Ok(())
//! # }
//! ```

use crate::swarmllm::aggregator::Aggregator;
use crate::swarmllm::cancel::CancelToken;
use crate::swarmllm::client_wrapper::ModelClient;
use crate::swarmllm::clock::{Clock, SystemClock};
use crate::swarmllm::config::EngineConfig;
use crate::swarmllm::executor::AgentExecutor;
use crate::swarmllm::model_pool::ModelPool;
use crate::swarmllm::planner::{PlannerError, TaskPlanner};
use crate::swarmllm::registry::AgentRegistry;
use crate::swarmllm::scheduler::{Scheduler, TaskOutcome};
use crate::swarmllm::tool_backend::ToolBackend;
use crate::swarmllm::trace::TraceLogger;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Errors that prevent a run from producing any outcome at all.
///
/// Task failures are *not* engine errors — they come back as outcomes.
#[derive(Debug)]
pub enum EngineError {
    /// Planning failed beyond recovery (no model, or the fallback role is
    /// missing).
    Planner(PlannerError),
    /// The trace file could not be opened or closed.
    Trace(io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Planner(err) => write!(f, "planning failed: {}", err),
            EngineError::Trace(err) => write!(f, "trace file error: {}", err),
        }
    }
}

impl Error for EngineError {}

/// Everything one run produced.
#[derive(Debug)]
pub struct RunOutput {
    /// The aggregated user-facing response.
    pub final_text: String,
    /// Per-task terminal records, in plan order.
    pub outcomes: Vec<TaskOutcome>,
    /// Path of this run's trace file, when tracing was enabled.
    pub trace_path: Option<PathBuf>,
}

/// Wires the engine components behind `run(query)`.
pub struct DelegationEngine {
    config: Arc<EngineConfig>,
    registry: Arc<AgentRegistry>,
    client: Arc<dyn ModelClient>,
    backend: Arc<dyn ToolBackend>,
    clock: Arc<dyn Clock>,
    pool: ModelPool,
}

impl DelegationEngine {
    /// Build an engine from its four collaborators.
    pub fn new(
        config: EngineConfig,
        registry: AgentRegistry,
        client: Arc<dyn ModelClient>,
        backend: Arc<dyn ToolBackend>,
    ) -> Self {
        let pool = ModelPool::new(config.endpoints.clone());
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            client,
            backend,
            clock: Arc::new(SystemClock),
            pool,
        }
    }

    /// Substitute the time source (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The engine's registry (read-only).
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Execute one query end to end.
    ///
    /// Always returns per-task outcomes when a plan could be produced;
    /// failed and cancelled tasks appear in the final text with their error
    /// kind and message, followed by the `N/M tasks completed` line.
    pub async fn run(
        &self,
        query: &str,
        cancel: &CancelToken,
    ) -> Result<RunOutput, EngineError> {
        let run_id = Uuid::new_v4();
        log::info!("run {} started: {}", run_id, preview(query));

        let trace = Arc::new(
            TraceLogger::create(
                self.config.trace_level,
                &self.config.trace_dir,
                self.config.trace_truncate_chars,
            )
            .map_err(EngineError::Trace)?,
        );
        let trace_path = trace.path().map(PathBuf::from);

        let snapshot = Arc::new(self.backend.list_tools().await);
        log::debug!("tool snapshot: {} tool(s)", snapshot.len());

        let planner = TaskPlanner::new(&self.registry, &self.config);
        let plan = match planner
            .plan(self.client.as_ref(), &snapshot, query, &trace)
            .await
        {
            Ok(plan) => plan,
            Err(err) => {
                // Close the trace file with its summary even on a dead end.
                if let Ok(trace) = Arc::try_unwrap(trace) {
                    let _ = trace.finish().await;
                }
                return Err(EngineError::Planner(err));
            }
        };

        let executor = Arc::new(AgentExecutor::new(
            self.client.clone(),
            self.backend.clone(),
            self.pool.clone(),
            self.config.clone(),
        ));
        let scheduler = Scheduler::new(
            executor,
            self.registry.clone(),
            self.pool.clone(),
            self.config.clone(),
            self.clock.clone(),
        );
        let outcomes = scheduler.run(&plan, snapshot, cancel, &trace).await;

        let aggregator = Aggregator::new(&self.registry, &self.config);
        let final_text = aggregator
            .compose_final(self.client.as_ref(), &outcomes, &trace)
            .await;

        match Arc::try_unwrap(trace) {
            Ok(trace) => trace.finish().await.map_err(EngineError::Trace)?,
            Err(_) => log::warn!("trace logger still shared at run end; summary skipped"),
        }

        log::info!(
            "run {} finished: {}/{} tasks completed",
            run_id,
            outcomes
                .iter()
                .filter(|o| o.status == crate::swarmllm::plan::TaskStatus::Completed)
                .count(),
            outcomes.len()
        );

        Ok(RunOutput {
            final_text,
            outcomes,
            trace_path,
        })
    }
}

/// Newline-free, bounded preview of the query for log lines.
fn preview(text: &str) -> String {
    const MAX_PREVIEW_CHARS: usize = 120;
    let normalized = text.replace(['\n', '\r'], " ");
    let mut chars = normalized.chars();
    let preview: String = chars.by_ref().take(MAX_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}
