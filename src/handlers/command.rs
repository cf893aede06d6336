//! Base command execution abstraction
//!
//! Every external process (ssh, scp, the local converters) is launched through
//! [`CommandExecutor`], enabling dependency injection for testing.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Command line for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

#[derive(Debug, Error, Clone)]
pub enum CommandError {
    #[error("Command execution failed: {message}")]
    ExecutionFailed { message: String },
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("IO error: {message}")]
    Io { message: String },
}

/// Trait for executing external commands
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Real implementation using tokio::process::Command
pub struct ProcessCommandExecutor;

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        command.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let program = spec.program.clone();
        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CommandError::CommandNotFound { command: program }
            } else {
                CommandError::Io { message: e.to_string() }
            }
        })?;

        if let (Some(input), Some(mut pipe)) = (&spec.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| CommandError::Io { message: e.to_string() })?;
            // closing stdin lets the child see EOF
            drop(pipe);
        }

        let waited = child.wait_with_output();
        let output = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, waited).await.map_err(|_| {
                CommandError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
            None => waited.await,
        }
        .map_err(|e| CommandError::ExecutionFailed { message: e.to_string() })?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_process_command_executor_success() {
        let executor = ProcessCommandExecutor;
        let result = executor.execute(&CommandSpec::new("echo").arg("hello")).await;

        let output = result.unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_process_command_executor_command_not_found() {
        let executor = ProcessCommandExecutor;
        let result = executor.execute(&CommandSpec::new("nonexistent_command_xyz")).await;

        assert!(matches!(result.unwrap_err(), CommandError::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_slow_command() {
        let executor = ProcessCommandExecutor;
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));

        let result = executor.execute(&spec).await;
        assert!(matches!(result.unwrap_err(), CommandError::Timeout { timeout_ms: 100 }));
    }

    #[tokio::test]
    async fn test_stdin_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessCommandExecutor;

        let spec = CommandSpec::new("sh")
            .args(["-c", "cat > piped.txt && pwd"])
            .cwd(dir.path())
            .stdin("payload");
        let output = executor.execute(&spec).await.unwrap();

        assert!(output.success());
        assert_eq!(std::fs::read_to_string(dir.path().join("piped.txt")).unwrap(), "payload");
        assert_eq!(spec.display(), "sh -c cat > piped.txt && pwd");
    }
}
