//! Wave-parallel DAG execution.
//!
//! The [`Scheduler`] owns all runtime task state for one run. Workers (one
//! spawned tokio task per running plan task) receive immutable task
//! descriptions and return outcomes; every state transition happens in the
//! scheduler's single coordination loop, so no task state is ever shared
//! mutably.
//!
//! Mechanics:
//!
//! - Each task carries a `remaining_deps` counter; a task is **ready** when
//!   it reaches zero. Ready tasks launch while the worker group has room —
//!   the bound is `min(max_parallel_tasks, pool slots)`.
//! - On success, dependents' counters decrement; newly-zero tasks join the
//!   ready queue. Within a wave there is no ordering guarantee; across a
//!   dependency edge the happens-before is strict.
//! - On failure, every transitive dependent is cancelled with
//!   `upstream_failed` (carrying the failing ancestor's id) and never runs.
//!   Unrelated branches continue.
//! - External cancellation trips the per-task child tokens; the scheduler
//!   waits out a grace period, then aborts whatever is still in flight and
//!   marks every non-terminal task `cancelled`.
//!
//! The run ends when every task is terminal; partial success is a normal
//! outcome, not an error.

use crate::swarmllm::cancel::CancelToken;
use crate::swarmllm::clock::Clock;
use crate::swarmllm::config::EngineConfig;
use crate::swarmllm::errors::{TaskError, TaskErrorKind};
use crate::swarmllm::executor::{AgentExecutor, DependencyResult};
use crate::swarmllm::model_pool::ModelPool;
use crate::swarmllm::plan::{Plan, TaskStatus};
use crate::swarmllm::registry::AgentRegistry;
use crate::swarmllm::tool_backend::ToolDescriptor;
use crate::swarmllm::trace::{TraceEvent, TraceEventType, TraceLogger};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

/// Terminal record of one task, as returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    /// Task id from the plan.
    pub id: String,
    /// Role that was (or would have been) assigned.
    pub role: String,
    /// Terminal status.
    pub status: TaskStatus,
    /// Result text when completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error classification when failed or cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<TaskErrorKind>,
    /// Error detail when failed or cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Wall-clock runtime; zero for tasks that never ran.
    pub duration_ms: u64,
}

/// Per-task runtime state, owned by the coordinator.
struct ExecutionRecord {
    status: TaskStatus,
    remaining_deps: usize,
    result: Option<String>,
    error: Option<TaskError>,
    started_at: Option<Instant>,
    duration_ms: u64,
}

/// Coordinates one plan execution over the shared worker group.
pub struct Scheduler {
    executor: Arc<AgentExecutor>,
    registry: Arc<AgentRegistry>,
    pool: ModelPool,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    /// Scheduler over the shared engine collaborators.
    pub fn new(
        executor: Arc<AgentExecutor>,
        registry: Arc<AgentRegistry>,
        pool: ModelPool,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            registry,
            pool,
            config,
            clock,
        }
    }

    /// Execute `plan` to completion and return one outcome per task, in
    /// plan order.
    pub async fn run(
        &self,
        plan: &Plan,
        snapshot: Arc<Vec<ToolDescriptor>>,
        cancel: &CancelToken,
        trace: &Arc<TraceLogger>,
    ) -> Vec<TaskOutcome> {
        let worker_cap = self
            .config
            .max_parallel_tasks
            .max(1)
            .min(self.pool.total_slots().max(1));

        let mut records: HashMap<String, ExecutionRecord> = plan
            .tasks()
            .iter()
            .map(|task| {
                (
                    task.id.clone(),
                    ExecutionRecord {
                        status: TaskStatus::Pending,
                        remaining_deps: task.dependencies.len(),
                        result: None,
                        error: None,
                        started_at: None,
                        duration_ms: 0,
                    },
                )
            })
            .collect();

        let mut ready: VecDeque<String> = VecDeque::new();
        for task in plan.tasks() {
            if task.dependencies.is_empty() {
                self.mark_ready(&task.id, &mut records, &mut ready, trace).await;
            }
        }

        let mut workers: JoinSet<(String, Result<String, TaskError>)> = JoinSet::new();
        let mut cancelling = false;

        loop {
            if !cancelling {
                while workers.len() < worker_cap {
                    let id = match ready.pop_front() {
                        Some(id) => id,
                        None => break,
                    };
                    if records[&id].status != TaskStatus::Ready {
                        continue;
                    }
                    self.launch(&id, plan, &snapshot, &mut records, &mut workers, cancel, trace)
                        .await;
                }
            }

            if workers.is_empty() {
                break;
            }

            if cancelling {
                // Grace period: give in-flight workers a chance to observe
                // their tripped tokens, then abort whatever is left.
                let drained = tokio::time::timeout(self.config.cancel_grace, async {
                    while let Some(joined) = workers.join_next().await {
                        if let Ok((id, result)) = joined {
                            self.settle(id, result, plan, &mut records, &mut ready, trace)
                                .await;
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    log::warn!("cancellation grace period elapsed; aborting workers");
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                }
                break;
            }

            tokio::select! {
                joined = workers.join_next() => {
                    match joined {
                        Some(Ok((id, result))) => {
                            self.settle(id, result, plan, &mut records, &mut ready, trace).await;
                        }
                        Some(Err(join_error)) => {
                            log::error!("worker join error: {}", join_error);
                        }
                        None => {}
                    }
                }
                _ = cancel.cancelled() => {
                    cancelling = true;
                }
            }
        }

        // Everything not terminal at this point (external cancellation or a
        // worker that vanished) is cancelled.
        for task in plan.tasks() {
            let record = records.get_mut(&task.id).expect("record exists");
            if !record.status.is_terminal() {
                record.status = TaskStatus::Cancelled;
                record.error = Some(TaskError::new(
                    TaskErrorKind::Cancelled,
                    "run cancelled before the task finished",
                ));
                self.trace_task_end(&task.id, record, trace).await;
            }
        }

        plan.tasks()
            .iter()
            .map(|task| {
                let record = &records[&task.id];
                TaskOutcome {
                    id: task.id.clone(),
                    role: task.role.clone(),
                    status: record.status,
                    result: record.result.clone(),
                    error_kind: record.error.as_ref().map(|e| e.kind),
                    error_message: record.error.as_ref().map(|e| e.message.clone()),
                    duration_ms: record.duration_ms,
                }
            })
            .collect()
    }

    /// Transition a task to ready and queue it.
    async fn mark_ready(
        &self,
        id: &str,
        records: &mut HashMap<String, ExecutionRecord>,
        ready: &mut VecDeque<String>,
        trace: &Arc<TraceLogger>,
    ) {
        let record = records.get_mut(id).expect("record exists");
        record.status = TaskStatus::Ready;
        ready.push_back(id.to_string());
        trace
            .emit(TraceEvent::new(TraceEventType::TaskReady).with_task(id))
            .await;
    }

    /// Spawn one worker for a ready task.
    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        id: &str,
        plan: &Plan,
        snapshot: &Arc<Vec<ToolDescriptor>>,
        records: &mut HashMap<String, ExecutionRecord>,
        workers: &mut JoinSet<(String, Result<String, TaskError>)>,
        cancel: &CancelToken,
        trace: &Arc<TraceLogger>,
    ) {
        let task = plan.get(id).expect("task in plan").clone();

        let role = match self.registry.get(&task.role) {
            Ok(role) => role.clone(),
            Err(err) => {
                // Unreachable after validation; settle defensively.
                let record = records.get_mut(id).expect("record exists");
                record.status = TaskStatus::Failed;
                record.error = Some(TaskError::new(TaskErrorKind::UnknownRole, err.to_string()));
                self.trace_task_end(id, record, trace).await;
                return;
            }
        };

        let effective = self
            .registry
            .effective_tools(&role.name, snapshot)
            .unwrap_or_default();
        let dependencies: Vec<DependencyResult> = task
            .dependencies
            .iter()
            .filter_map(|dep| {
                records[dep].result.as_ref().map(|result| DependencyResult {
                    id: dep.clone(),
                    result: result.clone(),
                })
            })
            .collect();

        {
            let record = records.get_mut(id).expect("record exists");
            record.status = TaskStatus::Running;
            record.started_at = Some(self.clock.now());
        }
        log::info!("task {} started ({})", id, role.name);
        trace
            .emit(
                TraceEvent::new(TraceEventType::TaskStart)
                    .with_task(id)
                    .with_role(&role.name)
                    .with_data(serde_json::json!({
                        "description": task.description,
                        "dependencies": task.dependencies,
                    })),
            )
            .await;

        let executor = self.executor.clone();
        let snapshot = snapshot.clone();
        let trace = trace.clone();
        let token = cancel.child();
        let task_timeout = self.config.task_timeout;
        let task_id = task.id.clone();

        workers.spawn(async move {
            let work = executor.execute(
                &task,
                &role,
                &snapshot,
                &effective,
                &dependencies,
                &token,
                &trace,
            );
            let result = match tokio::time::timeout(task_timeout, work).await {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    Err(TaskError::new(
                        TaskErrorKind::TaskTimeout,
                        format!("task exceeded {:?}", task_timeout),
                    ))
                }
            };
            (task_id, result)
        });
    }

    /// Apply a worker's terminal result and propagate readiness or
    /// cancellation.
    async fn settle(
        &self,
        id: String,
        result: Result<String, TaskError>,
        plan: &Plan,
        records: &mut HashMap<String, ExecutionRecord>,
        ready: &mut VecDeque<String>,
        trace: &Arc<TraceLogger>,
    ) {
        let now = self.clock.now();
        {
            let record = records.get_mut(&id).expect("record exists");
            record.duration_ms = record
                .started_at
                .map(|started| now.duration_since(started).as_millis() as u64)
                .unwrap_or(0);
            match &result {
                Ok(text) => {
                    record.status = TaskStatus::Completed;
                    record.result = Some(text.clone());
                }
                Err(error) => {
                    // Cancelled is only produced by an external cancel; those
                    // tasks end cancelled, everything else ends failed.
                    record.status = if error.kind == TaskErrorKind::Cancelled {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Failed
                    };
                    record.error = Some(error.clone());
                }
            }
        }
        let record = &records[&id];
        log::info!("task {} ended: {}", id, record.status);
        self.trace_task_end(&id, record, trace).await;

        match result {
            Ok(_) => {
                for dependent in plan.dependents(&id) {
                    let record = records.get_mut(dependent).expect("record exists");
                    record.remaining_deps -= 1;
                    if record.remaining_deps == 0 && record.status == TaskStatus::Pending {
                        self.mark_ready(dependent, records, ready, trace).await;
                    }
                }
            }
            Err(error) => {
                // Under external cancellation the final sweep marks the
                // dependents; upstream cancellation here would mislabel them.
                if error.kind != TaskErrorKind::Cancelled {
                    self.cancel_dependents(&id, plan, records, trace).await;
                }
            }
        }
    }

    /// Mark every transitive dependent of `failed_id` cancelled.
    async fn cancel_dependents(
        &self,
        failed_id: &str,
        plan: &Plan,
        records: &mut HashMap<String, ExecutionRecord>,
        trace: &Arc<TraceLogger>,
    ) {
        let mut queue: VecDeque<String> =
            plan.dependents(failed_id).iter().map(|s| s.to_string()).collect();

        while let Some(id) = queue.pop_front() {
            {
                let record = records.get_mut(&id).expect("record exists");
                if record.status.is_terminal() {
                    continue;
                }
                record.status = TaskStatus::Cancelled;
                record.error = Some(TaskError::new(
                    TaskErrorKind::UpstreamFailed,
                    format!("dependency '{}' failed", failed_id),
                ));
            }
            self.trace_task_end(&id, &records[&id], trace).await;
            for dependent in plan.dependents(&id) {
                queue.push_back(dependent.to_string());
            }
        }
    }

    async fn trace_task_end(
        &self,
        id: &str,
        record: &ExecutionRecord,
        trace: &Arc<TraceLogger>,
    ) {
        trace
            .emit(
                TraceEvent::new(TraceEventType::TaskEnd)
                    .with_task(id)
                    .with_data(serde_json::json!({
                        "status": record.status,
                        "duration_ms": record.duration_ms,
                        "error_kind": record.error.as_ref().map(|e| e.kind.as_str()),
                        "error_message": record.error.as_ref().map(|e| e.message.clone()),
                    })),
            )
            .await;
    }
}
