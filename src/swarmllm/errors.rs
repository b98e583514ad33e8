//! Task-level error taxonomy.
//!
//! Every failure that can surface in a [`TaskOutcome`](crate::scheduler::TaskOutcome)
//! or a trace event is classified by a [`TaskErrorKind`]. The kinds split into
//! three dispositions:
//!
//! - **Recovered locally** — tool-level failures (`ForbiddenTool`,
//!   `UnknownTool`, `ToolFailed`, and the file-tool kinds) are fed back to the
//!   model as tool-result text and the loop continues.
//! - **Task-terminal, escalatable** — `EmptyResponse`, `CorruptOutput`, and
//!   `LoopLimit` end the task but may trigger one retry on a stronger model.
//! - **Task-terminal, final** — timeouts, cancellation, and upstream failures
//!   end the task with no escalation.
//!
//! # Example
//!
//! ```rust
//! use swarmllm::errors::{TaskError, TaskErrorKind};
//!
//! let err = TaskError::new(TaskErrorKind::LoopLimit, "10 iterations exhausted");
//! assert_eq!(err.kind, TaskErrorKind::LoopLimit);
//! assert!(err.kind.escalatable());
//! assert_eq!(err.to_string(), "loop_limit: 10 iterations exhausted");
//! ```

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Classification of a task or tool failure.
///
/// Serialized in snake_case so trace payloads and task outcomes carry stable
/// machine-readable kind strings (e.g. `"upstream_failed"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The planner referenced a role that is not in the registry.
    UnknownRole,
    /// The plan failed validation (empty, too large, missing field, unknown
    /// dependency, or cycle).
    InvalidPlan,
    /// The task was cancelled because a dependency (direct or transitive)
    /// failed.
    UpstreamFailed,
    /// The role attempted to call a tool outside its effective set.
    ForbiddenTool,
    /// The tool name does not exist in the backend snapshot.
    UnknownTool,
    /// The backend executed the tool and reported an application failure.
    ToolFailed,
    /// The model returned whitespace-only output on two consecutive
    /// iterations.
    EmptyResponse,
    /// The model output is garbage (leading non-ASCII with no recognizable
    /// ASCII words).
    CorruptOutput,
    /// The tool-call loop hit the role's iteration budget.
    LoopLimit,
    /// A single model call exceeded the configured timeout.
    ModelTimeout,
    /// No model pool slot became available within the acquire timeout.
    PoolTimeout,
    /// The task as a whole exceeded its aggregate timeout.
    TaskTimeout,
    /// The run's external cancellation token was tripped.
    Cancelled,
    /// A file-tool path resolved outside the working-directory root.
    PathEscape,
    /// A file-tool target does not exist.
    FileMissing,
    /// A `patch_file` search string was not found.
    SearchNotFound,
    /// A `patch_file` search string matched more than once without an
    /// `occurrence` selector.
    AmbiguousMatch,
    /// A `patch_file` `occurrence` index is out of range.
    InvalidOccurrence,
}

impl TaskErrorKind {
    /// Whether a terminal failure of this kind may trigger one escalation
    /// attempt on the fallback model.
    pub fn escalatable(&self) -> bool {
        matches!(
            self,
            TaskErrorKind::EmptyResponse | TaskErrorKind::CorruptOutput | TaskErrorKind::LoopLimit
        )
    }

    /// Whether this kind is recovered inside the tool-call loop (the model
    /// sees the error text and the loop continues) rather than ending the
    /// task.
    pub fn recoverable_in_loop(&self) -> bool {
        matches!(
            self,
            TaskErrorKind::ForbiddenTool
                | TaskErrorKind::UnknownTool
                | TaskErrorKind::ToolFailed
                | TaskErrorKind::PathEscape
                | TaskErrorKind::FileMissing
                | TaskErrorKind::SearchNotFound
                | TaskErrorKind::AmbiguousMatch
                | TaskErrorKind::InvalidOccurrence
        )
    }

    /// Stable snake_case name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::UnknownRole => "unknown_role",
            TaskErrorKind::InvalidPlan => "invalid_plan",
            TaskErrorKind::UpstreamFailed => "upstream_failed",
            TaskErrorKind::ForbiddenTool => "forbidden_tool",
            TaskErrorKind::UnknownTool => "unknown_tool",
            TaskErrorKind::ToolFailed => "tool_failed",
            TaskErrorKind::EmptyResponse => "empty_response",
            TaskErrorKind::CorruptOutput => "corrupt_output",
            TaskErrorKind::LoopLimit => "loop_limit",
            TaskErrorKind::ModelTimeout => "model_timeout",
            TaskErrorKind::PoolTimeout => "pool_timeout",
            TaskErrorKind::TaskTimeout => "task_timeout",
            TaskErrorKind::Cancelled => "cancelled",
            TaskErrorKind::PathEscape => "path_escape",
            TaskErrorKind::FileMissing => "file_missing",
            TaskErrorKind::SearchNotFound => "search_not_found",
            TaskErrorKind::AmbiguousMatch => "ambiguous_match",
            TaskErrorKind::InvalidOccurrence => "invalid_occurrence",
        }
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure with a human-readable message.
///
/// This is what the scheduler stores on a failed/cancelled task and what the
/// aggregator renders into the final response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Machine-readable classification.
    pub kind: TaskErrorKind,
    /// Human-readable detail, shown to the user and to the model (for
    /// loop-recoverable kinds).
    pub message: String,
}

impl TaskError {
    /// Create an error with the given kind and message.
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for TaskError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&TaskErrorKind::UpstreamFailed).unwrap();
        assert_eq!(json, "\"upstream_failed\"");
        let back: TaskErrorKind = serde_json::from_str("\"pool_timeout\"").unwrap();
        assert_eq!(back, TaskErrorKind::PoolTimeout);
    }

    #[test]
    fn dispositions() {
        assert!(TaskErrorKind::LoopLimit.escalatable());
        assert!(!TaskErrorKind::ModelTimeout.escalatable());
        assert!(TaskErrorKind::AmbiguousMatch.recoverable_in_loop());
        assert!(!TaskErrorKind::Cancelled.recoverable_in_loop());
    }

    #[test]
    fn as_str_matches_serde() {
        for kind in [
            TaskErrorKind::UnknownRole,
            TaskErrorKind::InvalidPlan,
            TaskErrorKind::SearchNotFound,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
