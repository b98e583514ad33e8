//! Shell command execution built-in.
//!
//! Runs one shell command per call with a hard timeout and bounded output
//! capture. Output is read incrementally from both pipes concurrently so a
//! chatty command can neither deadlock on a full pipe buffer nor exhaust
//! memory.
//!
//! Sandboxing beyond the working-directory and timeout is not this module's
//! job — operators who need isolation run the engine inside a container.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Errors from shell execution.
#[derive(Debug)]
pub enum ShellError {
    /// The command exceeded the configured timeout.
    Timeout(u64),
    /// A pipe exceeded the output budget.
    OutputOverflow(&'static str, usize),
    /// Spawn or wait failed.
    Io(std::io::Error),
}

impl fmt::Display for ShellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellError::Timeout(secs) => write!(f, "Command exceeded {} second timeout", secs),
            ShellError::OutputOverflow(stream, cap) => {
                write!(f, "Command {} exceeded {} byte limit", stream, cap)
            }
            ShellError::Io(err) => write!(f, "Command IO error: {}", err),
        }
    }
}

impl Error for ShellError {}

/// Captured outcome of one command.
#[derive(Debug, Clone)]
pub struct ShellResult {
    /// Exit code 0.
    pub success: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code (-1 when terminated by signal).
    pub exit_code: i32,
    /// Wall-clock execution time.
    pub duration_ms: u64,
}

/// Bounded shell executor for the `execute_bash_command` built-in.
#[derive(Clone)]
pub struct ShellTool {
    shell: &'static str,
    timeout: Duration,
    max_output_bytes: usize,
    workdir: Option<PathBuf>,
}

impl ShellTool {
    /// Executor with a 60s timeout and a 256 KiB per-stream output cap.
    pub fn new() -> Self {
        Self {
            shell: "/bin/bash",
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

    /// Override the per-stream output cap (builder pattern).
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Run commands from `dir` instead of the process working directory.
    pub fn with_workdir(mut self, dir: PathBuf) -> Self {
        self.workdir = Some(dir);
        self
    }

    /// Execute `cmd` through the shell, enforcing timeout and output caps.
    pub async fn execute(&self, cmd: &str) -> Result<ShellResult, ShellError> {
        let started = Instant::now();
        let cap = self.max_output_bytes;
        let timeout_secs = self.timeout.as_secs();

        let mut command = Command::new(self.shell);
        command
            .arg("-c")
            .arg(cmd)
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

            // Drain both pipes concurrently to avoid buffer deadlocks.
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

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a pipe to completion, failing once `cap` bytes are exceeded.
pub(crate) async fn read_limited<R>(
    mut pipe: R,
    cap: usize,
    stream: &'static str,
) -> Result<Vec<u8>, ShellError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await.map_err(ShellError::Io)?;
        if n == 0 {
            return Ok(buffer);
        }
        if buffer.len() + n > cap {
            return Err(ShellError::OutputOverflow(stream, cap));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let shell = ShellTool::new();
        let result = shell.execute("printf 'hi'; exit 3").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.stdout, "hi");
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_long_commands() {
        let shell = ShellTool::new().with_timeout(Duration::from_millis(100));
        let err = shell.execute("sleep 5").await.unwrap_err();
        assert!(matches!(err, ShellError::Timeout(_)));
    }

    #[tokio::test]
    async fn output_cap_enforced() {
        let shell = ShellTool::new().with_max_output_bytes(64);
        let err = shell.execute("yes | head -c 1024").await.unwrap_err();
        assert!(matches!(err, ShellError::OutputOverflow("stdout", 64)));
    }

    #[tokio::test]
    async fn workdir_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellTool::new().with_workdir(dir.path().to_path_buf());
        let result = shell.execute("pwd").await.unwrap();
        let pwd = PathBuf::from(result.stdout.trim());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
