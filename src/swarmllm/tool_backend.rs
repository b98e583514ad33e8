//! Tool dispatch abstraction and the built-in backend.
//!
//! Agents call tools through the [`ToolBackend`] trait — the engine's view
//! of the MCP backplane. Remote tool failures are **data**, not errors: a
//! backend returns [`ToolOutput`] with `is_error = true` and a
//! human-readable message the model can react to. The only error a backend
//! raises is the local programmer error of dispatching to a tool name that
//! does not exist ([`BackendError::UnknownTool`]).
//!
//! [`BuiltinToolBackend`] provides the ten `builtin.*` tools the engine
//! guarantees: the root-jailed file operations, shell and Python execution,
//! and the system-prompt accessor pair. MCP transports implement the same
//! trait elsewhere and are composed by the embedding application.
//!
//! # Example
//!
//! ```rust,no_run
//! use swarmllm::tool_backend::{BuiltinToolBackend, ToolBackend};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = BuiltinToolBackend::new("workspace".into())?;
//!
//! let tools = backend.list_tools().await;
//! assert!(tools.iter().any(|t| t.name == "builtin.patch_file"));
//!
//! let output = backend
//!     .call(
//!         "builtin.file_exists",
//!         &serde_json::json!({"path": "README.md"}),
//!     )
//!     .await?;
//! println!("exists: {}", output.text);
//! # Ok(())
//! # }
//! ```

use crate::swarmllm::tools::bash::{ShellResult, ShellTool};
use crate::swarmllm::tools::filesystem::{FileStore, FileStoreError, PatchChange};
use crate::swarmllm::tools::python::PythonTool;
use async_trait::async_trait;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Identity and schema of one callable tool.
///
/// Names are fully qualified: `<server>.<tool>` for MCP tools,
/// `builtin.<tool>` for the engine's own handlers. Descriptors are
/// snapshotted when the engine starts and passed by value into prompts.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    /// Fully-qualified tool name.
    pub name: String,
    /// Human description surfaced to planners and agents.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub schema: serde_json::Value,
}

impl ToolDescriptor {
    /// Create a descriptor.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }

    /// Whether this is one of the engine's own `builtin.*` handlers.
    pub fn is_builtin(&self) -> bool {
        self.server() == "builtin"
    }

    /// The server prefix before the first dot (empty for malformed names).
    pub fn server(&self) -> &str {
        self.name.split('.').next().unwrap_or("")
    }
}

/// Free-text result of one tool call, suitable to feed back to a model.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// The result (or error) text.
    pub text: String,
    /// Whether the tool reported an application-level failure.
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful output.
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    /// Failed output; the message is shown to the model.
    pub fn err(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Local programmer errors a backend may raise.
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Dispatch to a tool name absent from this backend's snapshot.
    UnknownTool(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::UnknownTool(name) => write!(f, "Unknown tool: {}", name),
        }
    }
}

impl Error for BackendError {}

/// The engine's view of the tool backplane.
///
/// Implementations must be thread-safe; per-connection state is serialized
/// internally. Remote failures come back as `is_error = true` outputs, never
/// as `Err`.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Snapshot the currently available tools.
    async fn list_tools(&self) -> Vec<ToolDescriptor>;

    /// Execute `name` with JSON-shaped `args`.
    async fn call(&self, name: &str, args: &serde_json::Value)
        -> Result<ToolOutput, BackendError>;
}

/// Backend serving the ten `builtin.*` tools.
pub struct BuiltinToolBackend {
    files: FileStore,
    shell: ShellTool,
    python: PythonTool,
    system_prompt: RwLock<String>,
}

impl BuiltinToolBackend {
    /// Build a backend jailed to `workdir` (created if missing). Shell and
    /// Python snippets also run from `workdir`.
    pub fn new(workdir: PathBuf) -> Result<Self, FileStoreError> {
        let files = FileStore::new(workdir)?;
        let root = files.root().to_path_buf();
        Ok(Self {
            files,
            shell: ShellTool::new().with_workdir(root.clone()),
            python: PythonTool::new().with_workdir(root),
            system_prompt: RwLock::new(String::new()),
        })
    }

    /// Backend over pre-configured tool instances (tests, custom limits).
    pub fn with_tools(files: FileStore, shell: ShellTool, python: PythonTool) -> Self {
        Self {
            files,
            shell,
            python,
            system_prompt: RwLock::new(String::new()),
        }
    }

    fn require_str<'a>(
        args: &'a serde_json::Value,
        field: &str,
    ) -> Result<&'a str, ToolOutput> {
        args.get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolOutput::err(format!("Missing required string argument '{}'", field)))
    }

    fn shell_output(result: Result<ShellResult, crate::swarmllm::tools::bash::ShellError>) -> ToolOutput {
        match result {
            Ok(run) => {
                let mut text = String::new();
                if !run.stdout.is_empty() {
                    text.push_str(&run.stdout);
                }
                if !run.stderr.is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str("[stderr]\n");
                    text.push_str(&run.stderr);
                }
                if text.is_empty() {
                    text.push_str("(no output)");
                }
                if run.success {
                    ToolOutput::ok(text)
                } else {
                    ToolOutput::err(format!("exit code {}\n{}", run.exit_code, text))
                }
            }
            Err(err) => ToolOutput::err(err.to_string()),
        }
    }
}

#[async_trait]
impl ToolBackend for BuiltinToolBackend {
    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        builtin_descriptors()
    }

    async fn call(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<ToolOutput, BackendError> {
        let tool = name
            .strip_prefix("builtin.")
            .ok_or_else(|| BackendError::UnknownTool(name.to_string()))?;

        let output = match tool {
            "read_file" => match Self::require_str(args, "path") {
                Err(err) => err,
                Ok(path) => match self.files.read_file(path) {
                    Ok(content) => ToolOutput::ok(content),
                    Err(err) => ToolOutput::err(err.to_string()),
                },
            },
            "write_file" => match (Self::require_str(args, "path"), Self::require_str(args, "content")) {
                (Err(err), _) | (_, Err(err)) => err,
                (Ok(path), Ok(content)) => match self.files.write_file(path, content) {
                    Ok(()) => ToolOutput::ok(format!("Wrote {} bytes to {}", content.len(), path)),
                    Err(err) => ToolOutput::err(err.to_string()),
                },
            },
            "patch_file" => match Self::require_str(args, "path") {
                Err(err) => err,
                Ok(path) => {
                    let changes: Result<Vec<PatchChange>, _> = args
                        .get("changes")
                        .cloned()
                        .map(serde_json::from_value)
                        .unwrap_or_else(|| Ok(Vec::new()));
                    match changes {
                        Err(err) => ToolOutput::err(format!("Invalid 'changes' array: {}", err)),
                        Ok(changes) if changes.is_empty() => {
                            ToolOutput::err("'changes' must contain at least one change".to_string())
                        }
                        Ok(changes) => match self.files.patch_file(path, &changes) {
                            Ok(applied) => {
                                ToolOutput::ok(format!("Applied {} change(s) to {}", applied, path))
                            }
                            Err(err) => ToolOutput::err(err.to_string()),
                        },
                    }
                }
            },
            "list_files" => match Self::require_str(args, "path") {
                Err(err) => err,
                Ok(path) => match self.files.list_files(path) {
                    Ok(entries) => {
                        let mut lines = Vec::with_capacity(entries.len());
                        for entry in entries {
                            if entry.is_directory {
                                lines.push(format!("{}/", entry.name));
                            } else {
                                lines.push(format!("{} ({} bytes)", entry.name, entry.size));
                            }
                        }
                        if lines.is_empty() {
                            ToolOutput::ok("(empty directory)")
                        } else {
                            ToolOutput::ok(lines.join("\n"))
                        }
                    }
                    Err(err) => ToolOutput::err(err.to_string()),
                },
            },
            "file_exists" => match Self::require_str(args, "path") {
                Err(err) => err,
                Ok(path) => match self.files.file_exists(path) {
                    Ok(exists) => ToolOutput::ok(if exists { "true" } else { "false" }),
                    Err(err) => ToolOutput::err(err.to_string()),
                },
            },
            "execute_bash_command" => match Self::require_str(args, "command") {
                Err(err) => err,
                Ok(command) => Self::shell_output(self.shell.execute(command).await),
            },
            "execute_python_code" => match Self::require_str(args, "code") {
                Err(err) => err,
                Ok(code) => Self::shell_output(self.python.execute(code).await),
            },
            "get_system_prompt" => ToolOutput::ok(self.system_prompt.read().await.clone()),
            "set_system_prompt" => match Self::require_str(args, "prompt") {
                Err(err) => err,
                Ok(prompt) => {
                    *self.system_prompt.write().await = prompt.to_string();
                    ToolOutput::ok("System prompt updated")
                }
            },
            "read_image" => match Self::require_str(args, "path") {
                Err(err) => err,
                Ok(path) => match self.files.read_image(path) {
                    Ok(payload) => ToolOutput::ok(format!(
                        "media_type: {}\nsize: {} bytes\nbase64: {}",
                        payload.media_type.as_deref().unwrap_or("unknown"),
                        payload.size,
                        payload.base64
                    )),
                    Err(err) => ToolOutput::err(err.to_string()),
                },
            },
            _ => return Err(BackendError::UnknownTool(name.to_string())),
        };

        Ok(output)
    }
}

fn string_arg_schema(fields: &[(&str, &str)], required: &[&str]) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    for (name, description) in fields {
        properties.insert(
            name.to_string(),
            serde_json::json!({"type": "string", "description": description}),
        );
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Descriptors for the ten built-in tools.
fn builtin_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            "builtin.read_file",
            "Read a UTF-8 file from the working directory.",
            string_arg_schema(&[("path", "File path relative to the working directory")], &["path"]),
        ),
        ToolDescriptor::new(
            "builtin.write_file",
            "Create or overwrite a file in the working directory.",
            string_arg_schema(
                &[
                    ("path", "File path relative to the working directory"),
                    ("content", "Full new file content"),
                ],
                &["path", "content"],
            ),
        ),
        ToolDescriptor::new(
            "builtin.patch_file",
            "Apply targeted search-and-replace changes to a file. Atomic: all changes succeed or the file is unchanged. Each search must match exactly once unless a 1-indexed 'occurrence' is given.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path relative to the working directory"},
                    "changes": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "search": {"type": "string"},
                                "replace": {"type": "string"},
                                "occurrence": {"type": "integer", "minimum": 1}
                            },
                            "required": ["search", "replace"]
                        }
                    }
                },
                "required": ["path", "changes"]
            }),
        ),
        ToolDescriptor::new(
            "builtin.list_files",
            "List the entries of a directory in the working directory.",
            string_arg_schema(&[("path", "Directory path relative to the working directory")], &["path"]),
        ),
        ToolDescriptor::new(
            "builtin.file_exists",
            "Check whether a path exists in the working directory.",
            string_arg_schema(&[("path", "Path relative to the working directory")], &["path"]),
        ),
        ToolDescriptor::new(
            "builtin.execute_bash_command",
            "Run one shell command with a timeout and bounded output.",
            string_arg_schema(&[("command", "The shell command to run")], &["command"]),
        ),
        ToolDescriptor::new(
            "builtin.execute_python_code",
            "Run a Python snippet out of process with a timeout and bounded output.",
            string_arg_schema(&[("code", "Python source to execute")], &["code"]),
        ),
        ToolDescriptor::new(
            "builtin.get_system_prompt",
            "Read the shared system prompt slot.",
            serde_json::json!({"type": "object", "properties": {}}),
        ),
        ToolDescriptor::new(
            "builtin.set_system_prompt",
            "Replace the shared system prompt slot.",
            string_arg_schema(&[("prompt", "New system prompt text")], &["prompt"]),
        ),
        ToolDescriptor::new(
            "builtin.read_image",
            "Read an image file and return its base64 payload with a sniffed media type.",
            string_arg_schema(&[("path", "Image path relative to the working directory")], &["path"]),
        ),
    ]
}
