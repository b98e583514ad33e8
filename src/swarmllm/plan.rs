//! Plans, tasks, and plan validation.
//!
//! A [`Plan`] is the validated DAG the planner produces for one user query:
//! an ordered list of immutable [`Task`] descriptions plus a derived
//! reverse-dependency index. Runtime state (status transitions, results,
//! timestamps) is deliberately *not* stored here — it is owned exclusively
//! by the scheduler's execution record, so workers only ever see immutable
//! task descriptions.
//!
//! # Wire format
//!
//! The planner model must emit exactly this JSON shape, which also drives
//! the golden tests:
//!
//! ```json
//! {"tasks":[{"id":"task_1","description":"…","agent_type":"READER",
//!            "dependencies":[],"expected_output":"…"}]}
//! ```
//!
//! # Example
//!
//! ```rust
//! use swarmllm::plan::{Plan, PlanSpec};
//! use swarmllm::registry::AgentRegistry;
//!
//! let registry = AgentRegistry::builtin();
//! let spec: PlanSpec = serde_json::from_str(
//!     r#"{"tasks":[
//!         {"id":"task_1","description":"read README.md","agent_type":"READER","dependencies":[]},
//!         {"id":"task_2","description":"summarize it","agent_type":"EXECUTOR","dependencies":["task_1"]}
//!     ]}"#,
//! ).unwrap();
//!
//! let plan = Plan::from_spec(spec, &registry).unwrap();
//! assert_eq!(plan.len(), 2);
//! assert_eq!(plan.dependents("task_1"), vec!["task_2"]);
//! ```

use crate::swarmllm::registry::AgentRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Upper bound on tasks per plan.
pub const MAX_PLAN_TASKS: usize = 12;

/// Lifecycle of one task.
///
/// Legal transitions: `Pending → Ready → Running → {Completed, Failed,
/// Cancelled}`, plus `Pending → Cancelled` when an upstream task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on unsatisfied dependencies.
    Pending,
    /// All dependencies satisfied; queued for a worker.
    Ready,
    /// Handed to an executor.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with a terminal error.
    Failed,
    /// Never ran: upstream failure or external cancellation.
    Cancelled,
}

impl TaskStatus {
    /// Whether this is one of the three terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Immutable description of one subtask.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique id within the plan.
    pub id: String,
    /// What the agent should do.
    pub description: String,
    /// Registered role that executes this task.
    pub role: String,
    /// Ids of tasks that must complete first.
    pub dependencies: Vec<String>,
    /// Optional hint about the expected shape of the result.
    pub expected_output: Option<String>,
}

/// One task as emitted by the planner model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique id within the plan.
    pub id: String,
    /// What the agent should do.
    pub description: String,
    /// Role name; must exist in the registry.
    pub agent_type: String,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Optional hint about the expected shape of the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
}

/// The planner's raw output: the literal wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    /// Ordered task list.
    pub tasks: Vec<TaskSpec>,
}

/// Why a [`PlanSpec`] failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// No tasks at all.
    Empty,
    /// More than [`MAX_PLAN_TASKS`] tasks.
    TooLarge(usize),
    /// A task has an empty `id` or `description`.
    MissingField { index: usize, field: &'static str },
    /// Two tasks share an id.
    DuplicateId(String),
    /// A task references a role that is not registered.
    UnknownRole { task: String, role: String },
    /// A dependency id does not name a task in this plan.
    UnknownDependency { task: String, dependency: String },
    /// The dependency graph contains a cycle through the named task.
    Cycle(String),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::Empty => write!(f, "plan has no tasks"),
            PlanError::TooLarge(count) => {
                write!(f, "plan has {} tasks; at most {} allowed", count, MAX_PLAN_TASKS)
            }
            PlanError::MissingField { index, field } => {
                write!(f, "task at index {} has an empty '{}'", index, field)
            }
            PlanError::DuplicateId(id) => write!(f, "duplicate task id '{}'", id),
            PlanError::UnknownRole { task, role } => {
                write!(f, "task '{}' references unknown agent_type '{}'", task, role)
            }
            PlanError::UnknownDependency { task, dependency } => write!(
                f,
                "task '{}' depends on '{}', which is not in the plan",
                task, dependency
            ),
            PlanError::Cycle(task) => {
                write!(f, "dependency cycle detected through task '{}'", task)
            }
        }
    }
}

impl Error for PlanError {}

/// A validated task DAG.
#[derive(Debug)]
pub struct Plan {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
}

impl Plan {
    /// Validate a raw [`PlanSpec`] against the registry and build the plan.
    ///
    /// Checks, in order: task count bounds, non-empty ids/descriptions,
    /// id uniqueness, known roles, in-plan dependencies, and acyclicity
    /// (iterative DFS with gray/black marking).
    pub fn from_spec(spec: PlanSpec, registry: &AgentRegistry) -> Result<Self, PlanError> {
        if spec.tasks.is_empty() {
            return Err(PlanError::Empty);
        }
        if spec.tasks.len() > MAX_PLAN_TASKS {
            return Err(PlanError::TooLarge(spec.tasks.len()));
        }

        let mut index = HashMap::new();
        for (position, task) in spec.tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                return Err(PlanError::MissingField {
                    index: position,
                    field: "id",
                });
            }
            if task.description.trim().is_empty() {
                return Err(PlanError::MissingField {
                    index: position,
                    field: "description",
                });
            }
            if index.insert(task.id.clone(), position).is_some() {
                return Err(PlanError::DuplicateId(task.id.clone()));
            }
        }

        for task in &spec.tasks {
            if !registry.contains(&task.agent_type) {
                return Err(PlanError::UnknownRole {
                    task: task.id.clone(),
                    role: task.agent_type.clone(),
                });
            }
            for dependency in &task.dependencies {
                if !index.contains_key(dependency) {
                    return Err(PlanError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        detect_cycle(&spec.tasks, &index)?;

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in &spec.tasks {
            for dependency in &task.dependencies {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(task.id.clone());
            }
        }

        let tasks = spec
            .tasks
            .into_iter()
            .map(|task| Task {
                id: task.id,
                description: task.description,
                role: task.agent_type,
                dependencies: task.dependencies,
                expected_output: task.expected_output,
            })
            .collect();

        Ok(Self {
            tasks,
            index,
            dependents,
        })
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the plan is empty (never true for a validated plan).
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in planner order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Look up a task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&position| &self.tasks[position])
    }

    /// Ids of tasks that list `id` as a direct dependency.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.dependents
            .get(id)
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// One valid topological order (dependencies before dependents).
    ///
    /// Always exists for a validated plan; used by the scheduler's
    /// sequential mode and by the ordering property tests.
    pub fn topological_order(&self) -> Vec<&str> {
        let mut remaining: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|task| (task.id.as_str(), task.dependencies.len()))
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        let mut queue: Vec<&str> = self
            .tasks
            .iter()
            .filter(|task| task.dependencies.is_empty())
            .map(|task| task.id.as_str())
            .collect();

        while let Some(id) = queue.pop() {
            order.push(id);
            for dependent in self.dependents(id) {
                let count = remaining.get_mut(dependent).expect("dependent indexed");
                *count -= 1;
                if *count == 0 {
                    queue.push(dependent);
                }
            }
        }
        order
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Iterative DFS with gray/black marking; gray-on-gray means a cycle.
fn detect_cycle(tasks: &[TaskSpec], index: &HashMap<String, usize>) -> Result<(), PlanError> {
    let mut marks = vec![Mark::White; tasks.len()];

    for start in 0..tasks.len() {
        if marks[start] != Mark::White {
            continue;
        }
        // Stack entries: (node, next-dependency cursor).
        let mut stack = vec![(start, 0usize)];
        marks[start] = Mark::Gray;

        while let Some((node, cursor)) = stack.pop() {
            let deps = &tasks[node].dependencies;
            if cursor < deps.len() {
                stack.push((node, cursor + 1));
                let next = index[&deps[cursor]];
                match marks[next] {
                    Mark::Gray => return Err(PlanError::Cycle(tasks[next].id.clone())),
                    Mark::White => {
                        marks[next] = Mark::Gray;
                        stack.push((next, 0));
                    }
                    Mark::Black => {}
                }
            } else {
                marks[node] = Mark::Black;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarmllm::registry::AgentRegistry;

    fn spec(json: &str) -> PlanSpec {
        serde_json::from_str(json).unwrap()
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::builtin()
    }

    #[test]
    fn accepts_the_wire_format() {
        let plan = Plan::from_spec(
            spec(
                r#"{"tasks":[{"id":"task_1","description":"list files","agent_type":"EXECUTOR",
                    "dependencies":[],"expected_output":"a file listing"}]}"#,
            ),
            &registry(),
        )
        .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.get("task_1").unwrap().role, "EXECUTOR");
    }

    #[test]
    fn rejects_empty_and_oversized_plans() {
        assert_eq!(
            Plan::from_spec(spec(r#"{"tasks":[]}"#), &registry()).unwrap_err(),
            PlanError::Empty
        );

        let tasks: Vec<String> = (0..13)
            .map(|i| {
                format!(
                    r#"{{"id":"t{}","description":"d","agent_type":"EXECUTOR","dependencies":[]}}"#,
                    i
                )
            })
            .collect();
        let oversized = format!(r#"{{"tasks":[{}]}}"#, tasks.join(","));
        assert_eq!(
            Plan::from_spec(spec(&oversized), &registry()).unwrap_err(),
            PlanError::TooLarge(13)
        );
    }

    #[test]
    fn rejects_duplicates_unknown_roles_and_unknown_deps() {
        assert_eq!(
            Plan::from_spec(
                spec(
                    r#"{"tasks":[
                        {"id":"a","description":"d","agent_type":"EXECUTOR"},
                        {"id":"a","description":"d","agent_type":"EXECUTOR"}]}"#,
                ),
                &registry(),
            )
            .unwrap_err(),
            PlanError::DuplicateId("a".to_string())
        );

        assert!(matches!(
            Plan::from_spec(
                spec(r#"{"tasks":[{"id":"a","description":"d","agent_type":"WIZARD"}]}"#),
                &registry(),
            )
            .unwrap_err(),
            PlanError::UnknownRole { .. }
        ));

        assert!(matches!(
            Plan::from_spec(
                spec(
                    r#"{"tasks":[{"id":"a","description":"d","agent_type":"EXECUTOR",
                        "dependencies":["ghost"]}]}"#,
                ),
                &registry(),
            )
            .unwrap_err(),
            PlanError::UnknownDependency { .. }
        ));
    }

    #[test]
    fn rejects_cycles() {
        let err = Plan::from_spec(
            spec(
                r#"{"tasks":[
                    {"id":"task_1","description":"d","agent_type":"EXECUTOR","dependencies":["task_2"]},
                    {"id":"task_2","description":"d","agent_type":"EXECUTOR","dependencies":["task_1"]}]}"#,
            ),
            &registry(),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::Cycle(_)));

        // Self-dependency is the degenerate cycle.
        assert!(matches!(
            Plan::from_spec(
                spec(
                    r#"{"tasks":[{"id":"a","description":"d","agent_type":"EXECUTOR",
                        "dependencies":["a"]}]}"#,
                ),
                &registry(),
            )
            .unwrap_err(),
            PlanError::Cycle(_)
        ));
    }

    #[test]
    fn every_valid_plan_has_a_topological_order() {
        let plan = Plan::from_spec(
            spec(
                r#"{"tasks":[
                    {"id":"a","description":"d","agent_type":"EXECUTOR"},
                    {"id":"b","description":"d","agent_type":"EXECUTOR","dependencies":["a"]},
                    {"id":"c","description":"d","agent_type":"EXECUTOR","dependencies":["a"]},
                    {"id":"d","description":"d","agent_type":"EXECUTOR","dependencies":["b","c"]}]}"#,
            ),
            &registry(),
        )
        .unwrap();

        let order = plan.topological_order();
        assert_eq!(order.len(), plan.len());
        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for task in plan.tasks() {
            for dependency in &task.dependencies {
                assert!(
                    position[dependency.as_str()] < position[task.id.as_str()],
                    "{} must come before {}",
                    dependency,
                    task.id
                );
            }
        }
    }

    #[test]
    fn diamond_dependents_index() {
        let plan = Plan::from_spec(
            spec(
                r#"{"tasks":[
                    {"id":"a","description":"d","agent_type":"EXECUTOR"},
                    {"id":"b","description":"d","agent_type":"EXECUTOR","dependencies":["a"]},
                    {"id":"c","description":"d","agent_type":"EXECUTOR","dependencies":["a"]}]}"#,
            ),
            &registry(),
        )
        .unwrap();
        let mut dependents = plan.dependents("a");
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c"]);
    }
}
