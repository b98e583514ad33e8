//! Structured JSONL tracing.
//!
//! Every stage of a run emits typed [`TraceEvent`]s to a [`TraceLogger`].
//! Events are persisted as newline-delimited JSON — one event per line,
//! append-only — in a per-run file `trace_<YYYYMMDD_HHMMSS>.jsonl` under the
//! configured directory. A final `run_summary` event closes the file with
//! per-type counts and the total run duration.
//!
//! The logger's public surface is [`TraceLogger::emit`], not a `Printf`-style
//! API: events are typed records, which keeps trace files machine-checkable.
//!
//! # Disk format
//!
//! ```text
//! {"ts":"2025-07-01T12:00:00Z","type":"plan_request","data":{"query":"..."}}
//! {"ts":"2025-07-01T12:00:03Z","type":"task_start","task_id":"task_1","role":"READER","data":{}}
//! {"ts":"2025-07-01T12:00:09Z","type":"run_summary","data":{"counts":{"task_start":1,...},"duration_ms":9123}}
//! ```
//!
//! # Concurrency
//!
//! Writes are serialized through a single writer task fed by a bounded
//! channel. [`TraceLogger::emit`] awaits channel capacity, so a slow disk
//! applies backpressure to callers instead of dropping events. Line
//! atomicity follows from the single writer.
//!
//! # Example
//!
//! ```rust,no_run
//! use swarmllm::trace::{TraceEvent, TraceEventType, TraceLevel, TraceLogger};
//!
//! # #[tokio::main]
//! # async fn main() -> std::io::Result<()> {
//! let logger = TraceLogger::create(TraceLevel::Basic, ".trace".as_ref(), 500)?;
//!
//! logger
//!     .emit(TraceEvent::new(TraceEventType::PlanRequest).with_data(serde_json::json!({
//!         "query": "List files in 'src'",
//!     })))
//!     .await;
//!
//! logger.finish().await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Trace verbosity, from nothing to everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    /// No trace file is created.
    Off,
    /// Only the closing `run_summary` event is recorded.
    Summary,
    /// All event types, with string payload fields truncated to the
    /// configured character budget.
    Basic,
    /// All event types with full prompt/response payloads.
    Full,
    /// Like `Full`, and tool-call events additionally carry their full
    /// arguments and result text.
    Debug,
}

impl TraceLevel {
    /// Whether events of `kind` are recorded at this level.
    pub fn records(&self, kind: TraceEventType) -> bool {
        match self {
            TraceLevel::Off => false,
            TraceLevel::Summary => kind == TraceEventType::RunSummary,
            TraceLevel::Basic | TraceLevel::Full | TraceLevel::Debug => true,
        }
    }
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceLevel::Off => "off",
            TraceLevel::Summary => "summary",
            TraceLevel::Basic => "basic",
            TraceLevel::Full => "full",
            TraceLevel::Debug => "debug",
        };
        f.write_str(name)
    }
}

impl FromStr for TraceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(TraceLevel::Off),
            "summary" => Ok(TraceLevel::Summary),
            "basic" => Ok(TraceLevel::Basic),
            "full" => Ok(TraceLevel::Full),
            "debug" => Ok(TraceLevel::Debug),
            other => Err(format!("unknown trace level: {}", other)),
        }
    }
}

/// The thirteen event types a run can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    /// The planning prompt is about to be sent.
    PlanRequest,
    /// A plan was accepted by the validator.
    PlanResult,
    /// A planner attempt failed validation.
    PlanValidationFailed,
    /// A task's dependencies are all satisfied.
    TaskReady,
    /// A task transitioned to running.
    TaskStart,
    /// A task reached a terminal status.
    TaskEnd,
    /// One model round-trip (per task, per iteration).
    ModelCall,
    /// One tool dispatch.
    ToolCall,
    /// One pass through the tool-call loop.
    LoopIteration,
    /// The loop ended on a terminal model response.
    EarlyExit,
    /// A terminal failure triggered the fallback-model attempt.
    Escalation,
    /// The aggregator composed the final response.
    Aggregation,
    /// Closing event: per-type counts and total duration.
    RunSummary,
}

impl TraceEventType {
    /// Stable snake_case name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceEventType::PlanRequest => "plan_request",
            TraceEventType::PlanResult => "plan_result",
            TraceEventType::PlanValidationFailed => "plan_validation_failed",
            TraceEventType::TaskReady => "task_ready",
            TraceEventType::TaskStart => "task_start",
            TraceEventType::TaskEnd => "task_end",
            TraceEventType::ModelCall => "model_call",
            TraceEventType::ToolCall => "tool_call",
            TraceEventType::LoopIteration => "loop_iteration",
            TraceEventType::EarlyExit => "early_exit",
            TraceEventType::Escalation => "escalation",
            TraceEventType::Aggregation => "aggregation",
            TraceEventType::RunSummary => "run_summary",
        }
    }
}

/// One structured trace record.
///
/// Serialized as a single JSON object per line with fields
/// `{ts, type, task_id?, role?, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Wall-clock timestamp assigned at construction.
    pub ts: DateTime<Utc>,
    /// Event classification.
    #[serde(rename = "type")]
    pub kind: TraceEventType,
    /// Task this event belongs to, when task-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Agent role involved, when role-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Type-specific payload.
    pub data: serde_json::Value,
}

impl TraceEvent {
    /// Create an event of the given type with an empty payload.
    pub fn new(kind: TraceEventType) -> Self {
        Self {
            ts: Utc::now(),
            kind,
            task_id: None,
            role: None,
            data: serde_json::json!({}),
        }
    }

    /// Attach a task id (builder pattern).
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attach a role name (builder pattern).
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Attach the payload (builder pattern).
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

enum WriterMsg {
    Event(TraceEvent),
    Finish(oneshot::Sender<io::Result<()>>),
}

/// Leveled structured logger writing one JSONL file per run.
///
/// Construct one per [`run`](crate::engine::DelegationEngine::run); a
/// process-wide singleton would be wrong here because concurrent runs must
/// write to different files.
pub struct TraceLogger {
    level: TraceLevel,
    truncate_chars: usize,
    sender: Option<mpsc::Sender<WriterMsg>>,
    handle: Option<JoinHandle<()>>,
    path: Option<PathBuf>,
}

impl TraceLogger {
    /// Queue depth of the writer channel. Full queue ⇒ emitters wait.
    const QUEUE_DEPTH: usize = 256;

    /// Open a trace file under `dir` and spawn the writer task.
    ///
    /// At [`TraceLevel::Off`] no file is created and every emit is a no-op.
    /// The filename is `trace_<YYYYMMDD_HHMMSS>.jsonl` derived from the
    /// current UTC time.
    pub fn create(level: TraceLevel, dir: &Path, truncate_chars: usize) -> io::Result<Self> {
        if level == TraceLevel::Off {
            return Ok(Self {
                level,
                truncate_chars,
                sender: None,
                handle: None,
                path: None,
            });
        }

        fs::create_dir_all(dir)?;
        let filename = format!("trace_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(filename);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let (sender, receiver) = mpsc::channel(Self::QUEUE_DEPTH);
        let handle = tokio::spawn(writer_loop(file, receiver));

        Ok(Self {
            level,
            truncate_chars,
            sender: Some(sender),
            handle: Some(handle),
            path: Some(path),
        })
    }

    /// A logger that records nothing; useful for tests and embedding.
    pub fn disabled() -> Self {
        Self {
            level: TraceLevel::Off,
            truncate_chars: 0,
            sender: None,
            handle: None,
            path: None,
        }
    }

    /// The configured verbosity.
    pub fn level(&self) -> TraceLevel {
        self.level
    }

    /// Path of the trace file, when one was opened.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one event, subject to level filtering and payload shaping.
    ///
    /// Awaits writer-queue capacity — events are never dropped.
    pub async fn emit(&self, mut event: TraceEvent) {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return,
        };
        if !self.level.records(event.kind) {
            return;
        }
        event.data = self.shape_payload(event.kind, event.data);
        // Send fails only when the writer task is gone (after finish()).
        let _ = sender.send(WriterMsg::Event(event)).await;
    }

    /// Write the `run_summary` event, flush, and close the file.
    pub async fn finish(mut self) -> io::Result<()> {
        let sender = match self.sender.take() {
            Some(sender) => sender,
            None => return Ok(()),
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if sender.send(WriterMsg::Finish(ack_tx)).await.is_err() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "trace writer gone"));
        }
        let result = ack_rx
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "trace writer gone")));
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        result
    }

    /// Apply level-dependent payload shaping.
    ///
    /// `Basic` truncates every string field to the character budget.
    /// Below `Debug`, tool-call payloads lose their `arguments` field and
    /// keep only a truncated `result`.
    fn shape_payload(
        &self,
        kind: TraceEventType,
        mut data: serde_json::Value,
    ) -> serde_json::Value {
        if kind == TraceEventType::ToolCall && self.level < TraceLevel::Debug {
            if let Some(map) = data.as_object_mut() {
                map.remove("arguments");
                if let Some(serde_json::Value::String(result)) = map.get_mut("result") {
                    truncate_in_place(result, self.truncate_chars);
                }
            }
        }
        if self.level == TraceLevel::Basic {
            truncate_strings(&mut data, self.truncate_chars);
        }
        data
    }
}

/// Truncate every string leaf in `value` to `max` characters.
fn truncate_strings(value: &mut serde_json::Value, max: usize) {
    match value {
        serde_json::Value::String(s) => truncate_in_place(s, max),
        serde_json::Value::Array(items) => {
            for item in items {
                truncate_strings(item, max);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                truncate_strings(item, max);
            }
        }
        _ => {}
    }
}

fn truncate_in_place(s: &mut String, max: usize) {
    if s.chars().count() > max {
        let truncated: String = s.chars().take(max).collect();
        *s = format!("{}…[truncated]", truncated);
    }
}

/// The single writer: serializes events to disk and answers the finish
/// handshake with the `run_summary` line.
async fn writer_loop(file: fs::File, mut receiver: mpsc::Receiver<WriterMsg>) {
    let started = Instant::now();
    let mut writer = BufWriter::new(file);
    let mut counts: BTreeMap<&'static str, u64> = BTreeMap::new();

    while let Some(msg) = receiver.recv().await {
        match msg {
            WriterMsg::Event(event) => {
                *counts.entry(event.kind.as_str()).or_insert(0) += 1;
                if let Err(err) = write_line(&mut writer, &event) {
                    log::error!("trace write failed: {}", err);
                }
            }
            WriterMsg::Finish(ack) => {
                let summary = TraceEvent::new(TraceEventType::RunSummary).with_data(
                    serde_json::json!({
                        "counts": counts,
                        "duration_ms": started.elapsed().as_millis() as u64,
                    }),
                );
                let result = write_line(&mut writer, &summary).and_then(|_| writer.flush());
                let _ = ack.send(result);
                return;
            }
        }
    }
}

fn write_line(writer: &mut BufWriter<fs::File>, event: &TraceEvent) -> io::Result<()> {
    let json = serde_json::to_string(event)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(writer, "{}", json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        let file = fs::File::open(path).unwrap();
        io::BufReader::new(file)
            .lines()
            .map(|line| serde_json::from_str(&line.unwrap()).expect("each line is valid JSON"))
            .collect()
    }

    #[tokio::test]
    async fn file_ends_with_matching_summary() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TraceLogger::create(TraceLevel::Full, dir.path(), 500).unwrap();
        let path = logger.path().unwrap().to_path_buf();

        for _ in 0..3 {
            logger
                .emit(TraceEvent::new(TraceEventType::ModelCall).with_task("task_1"))
                .await;
        }
        logger
            .emit(TraceEvent::new(TraceEventType::TaskEnd).with_task("task_1"))
            .await;
        logger.finish().await.unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 5);
        let summary = lines.last().unwrap();
        assert_eq!(summary["type"], "run_summary");
        assert_eq!(summary["data"]["counts"]["model_call"], 3);
        assert_eq!(summary["data"]["counts"]["task_end"], 1);
        // Exactly one run_summary line.
        let summaries = lines
            .iter()
            .filter(|l| l["type"] == "run_summary")
            .count();
        assert_eq!(summaries, 1);
    }

    #[tokio::test]
    async fn summary_level_records_only_run_summary() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TraceLogger::create(TraceLevel::Summary, dir.path(), 500).unwrap();
        let path = logger.path().unwrap().to_path_buf();

        logger.emit(TraceEvent::new(TraceEventType::TaskStart)).await;
        logger.emit(TraceEvent::new(TraceEventType::ToolCall)).await;
        logger.finish().await.unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "run_summary");
    }

    #[tokio::test]
    async fn basic_level_truncates_string_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TraceLogger::create(TraceLevel::Basic, dir.path(), 10).unwrap();
        let path = logger.path().unwrap().to_path_buf();

        logger
            .emit(
                TraceEvent::new(TraceEventType::ModelCall)
                    .with_data(serde_json::json!({"response": "a".repeat(100)})),
            )
            .await;
        logger.finish().await.unwrap();

        let lines = read_lines(&path);
        let response = lines[0]["data"]["response"].as_str().unwrap();
        assert!(response.starts_with("aaaaaaaaaa"));
        assert!(response.ends_with("[truncated]"));
        assert!(response.len() < 100);
    }

    #[tokio::test]
    async fn tool_call_arguments_hidden_below_debug() {
        let dir = tempfile::tempdir().unwrap();

        let full = TraceLogger::create(TraceLevel::Full, dir.path(), 500).unwrap();
        let full_path = full.path().unwrap().to_path_buf();
        full.emit(
            TraceEvent::new(TraceEventType::ToolCall).with_data(serde_json::json!({
                "tool": "builtin.read_file",
                "arguments": {"path": "a.txt"},
                "result": "contents",
            })),
        )
        .await;
        full.finish().await.unwrap();
        let lines = read_lines(&full_path);
        assert!(lines[0]["data"].get("arguments").is_none());
        assert_eq!(lines[0]["data"]["tool"], "builtin.read_file");
    }

    #[test]
    fn level_parsing_round_trips() {
        for level in [
            TraceLevel::Off,
            TraceLevel::Summary,
            TraceLevel::Basic,
            TraceLevel::Full,
            TraceLevel::Debug,
        ] {
            assert_eq!(level.to_string().parse::<TraceLevel>().unwrap(), level);
        }
        assert!("verbose".parse::<TraceLevel>().is_err());
    }
}
