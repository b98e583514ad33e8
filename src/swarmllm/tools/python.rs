//! Python snippet execution built-in.
//!
//! Backs `builtin.execute_python_code`, including the synthetic calls the
//! parser emits for fenced ```python blocks. The snippet runs out of
//! process via `python3 -c` with the same timeout and output-cap posture as
//! the shell tool; further sandboxing is an operator concern.

use crate::swarmllm::tools::bash::{read_limited, ShellError, ShellResult};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Bounded out-of-process Python runner.
#[derive(Clone)]
pub struct PythonTool {
    interpreter: &'static str,
    timeout: Duration,
    max_output_bytes: usize,
    workdir: Option<PathBuf>,
}

impl PythonTool {
    /// Runner with a 60s timeout and a 256 KiB per-stream output cap.
    pub fn new() -> Self {
        Self {
            interpreter: "python3",
            timeout: Duration::from_secs(60),
            max_output_bytes: 256 * 1024,
            workdir: None,
        }
    }

    /// Override the timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run snippets from `dir` instead of the process working directory.
    pub fn with_workdir(mut self, dir: PathBuf) -> Self {
        self.workdir = Some(dir);
        self
    }

    /// Execute `code` with `python3 -c`, enforcing timeout and output caps.
    pub async fn execute(&self, code: &str) -> Result<ShellResult, ShellError> {
        let started = Instant::now();
        let cap = self.max_output_bytes;
        let timeout_secs = self.timeout.as_secs();

        let mut command = Command::new(self.interpreter);
        command
            .arg("-c")
            .arg(code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let run = async move {
            let mut child = command.spawn().map_err(ShellError::Io)?;
            let stdout_pipe = child.stdout.take().expect("stdout was piped");
            let stderr_pipe = child.stderr.take().expect("stderr was piped");

            let (stdout, stderr) = tokio::join!(
                read_limited(stdout_pipe, cap, "stdout"),
                read_limited(stderr_pipe, cap, "stderr"),
            );
            let (stdout, stderr) = match (stdout, stderr) {
                (Err(e), _) | (_, Err(e)) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return Err(e);
                }
                (Ok(out), Ok(err)) => (out, err),
            };

            let status = child.wait().await.map_err(ShellError::Io)?;
            Ok(ShellResult {
                success: status.success(),
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
                exit_code: status.code().unwrap_or(-1),
                duration_ms: started.elapsed().as_millis() as u64,
            })
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(ShellError::Timeout(timeout_secs)),
        }
    }
}

impl Default for PythonTool {
    fn default() -> Self {
        Self::new()
    }
}
