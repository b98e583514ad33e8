//! Engine configuration.
//!
//! A single immutable [`EngineConfig`] is handed to
//! [`DelegationEngine::new`](crate::engine::DelegationEngine::new) at
//! construction. Users build it manually — no TOML, YAML, or other
//! config-file parsing dependencies are introduced.
//!
//! # Example
//!
//! ```rust
//! use swarmllm::config::{EndpointConfig, EngineConfig};
//! use swarmllm::trace::TraceLevel;
//!
//! let config = EngineConfig {
//!     planner_model_id: Some("qwen2.5:14b".to_string()),
//!     fallback_model_id: Some("qwen2.5:32b".to_string()),
//!     endpoints: vec![EndpointConfig::new("http://localhost:11434", "qwen2.5:7b")],
//!     trace_level: TraceLevel::Basic,
//!     ..EngineConfig::default()
//! };
//! assert_eq!(config.max_parallel_tasks, 4);
//! assert!(config.escalation_enabled());
//! ```

use crate::swarmllm::trace::TraceLevel;
use std::path::PathBuf;
use std::time::Duration;

/// One model endpoint the pool can hand out slots for.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Base URL of the serving endpoint.
    pub url: String,
    /// Model identifier served at this endpoint.
    pub model: String,
    /// Maximum simultaneous in-flight calls to this endpoint.
    pub max_concurrent: usize,
}

impl EndpointConfig {
    /// Endpoint with the default per-endpoint concurrency cap of 2.
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            max_concurrent: 2,
        }
    }

    /// Override the per-endpoint concurrency cap (builder pattern).
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }
}

/// Immutable engine configuration.
///
/// Every knob has the documented default; construct with struct-update
/// syntax over [`EngineConfig::default`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model used for planning. Falls back to the first endpoint's model
    /// when `None`.
    pub planner_model_id: Option<String>,
    /// Stronger model for the single escalation attempt after an
    /// escalatable terminal failure. `None` disables escalation.
    pub fallback_model_id: Option<String>,
    /// Upper bound on simultaneously running tasks (default 4). The pool's
    /// total slot count also bounds the worker group. `1` gives strictly
    /// sequential execution.
    pub max_parallel_tasks: usize,
    /// Model endpoints the pool manages.
    pub endpoints: Vec<EndpointConfig>,
    /// Timeout for a single model call (default 180s).
    pub model_call_timeout: Duration,
    /// Timeout for acquiring a pool slot (default 300s).
    pub pool_acquire_timeout: Duration,
    /// Aggregate per-task timeout (default 600s).
    pub task_timeout: Duration,
    /// Grace period the engine waits for in-flight work after external
    /// cancellation (default 5s).
    pub cancel_grace: Duration,
    /// Trace verbosity.
    pub trace_level: TraceLevel,
    /// Directory for `trace_<ts>.jsonl` files (default `.trace`).
    pub trace_dir: PathBuf,
    /// Character budget for string payload fields at [`TraceLevel::Basic`]
    /// (default 500).
    pub trace_truncate_chars: usize,
    /// Few-shot examples appended to the planning prompt, `0..=3`
    /// (default 2).
    pub planner_max_examples: usize,
    /// Per-dependency cap on injected dependency results, in characters
    /// (default 2000).
    pub dep_result_max_chars: usize,
    /// Global cap on the injected dependency-context block (default 8000).
    pub context_max_chars: usize,
    /// Whether the aggregator runs a final LLM pass over the composed
    /// outcome text (default false).
    pub aggregator_use_llm: bool,
    /// Input budget for the aggregator's LLM pass; individual task results
    /// are truncated longest-first to fit (default 12000).
    pub aggregator_max_input_chars: usize,
    /// Escalation switch. `None` means "enabled iff `fallback_model_id` is
    /// set"; `Some(_)` overrides.
    pub escalation_enabled: Option<bool>,
}

impl EngineConfig {
    /// Effective escalation switch: the explicit override when present,
    /// otherwise enabled exactly when a fallback model is configured.
    pub fn escalation_enabled(&self) -> bool {
        self.escalation_enabled
            .unwrap_or(self.fallback_model_id.is_some())
    }

    /// The model the planner should use: the configured planner model or
    /// the first endpoint's model.
    pub fn planner_model(&self) -> Option<&str> {
        self.planner_model_id
            .as_deref()
            .or_else(|| self.endpoints.first().map(|e| e.model.as_str()))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            planner_model_id: None,
            fallback_model_id: None,
            max_parallel_tasks: 4,
            endpoints: Vec::new(),
            model_call_timeout: Duration::from_secs(180),
            pool_acquire_timeout: Duration::from_secs(300),
            task_timeout: Duration::from_secs(600),
            cancel_grace: Duration::from_secs(5),
            trace_level: TraceLevel::Off,
            trace_dir: PathBuf::from(".trace"),
            trace_truncate_chars: 500,
            planner_max_examples: 2,
            dep_result_max_chars: 2000,
            context_max_chars: 8000,
            aggregator_use_llm: false,
            aggregator_max_input_chars: 12_000,
            escalation_enabled: None,
        }
    }
}
