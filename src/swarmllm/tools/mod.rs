//! Built-in tool implementations.
//!
//! These back the `builtin.*` tool names the engine guarantees to agents:
//!
//! - **File store** — root-jailed read, write, atomic patch, list, exists,
//!   and image reading. Path traversal out of the working directory is
//!   rejected.
//! - **Shell** — bounded `execute_bash_command` with timeout and output caps.
//! - **Python** — bounded out-of-process `execute_python_code`.
//!
//! The [`BuiltinToolBackend`](crate::tool_backend::BuiltinToolBackend) wires
//! them into the tool dispatch surface agents actually call.

pub mod bash;
pub mod filesystem;
pub mod python;

pub use bash::{ShellError, ShellResult, ShellTool};
pub use filesystem::{DirectoryEntry, FileStore, FileStoreError, ImagePayload, PatchChange};
pub use python::PythonTool;
