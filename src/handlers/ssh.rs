//! Remote transport over the system OpenSSH client
//!
//! `open` starts a ControlMaster session; every later `ssh`/`scp` call
//! multiplexes over its control socket, so one authenticated session serves the
//! whole handler.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::HpcConfig;
use crate::error::{MqiError, Result};
use crate::handlers::command::{CommandError, CommandExecutor, CommandOutput, CommandSpec};
use crate::models::ExecutionResult;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// ssh exits with 255 when the connection itself failed
const SSH_TRANSPORT_FAILURE: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub mode: u32,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// File transfer and command execution on the cluster login node.
///
/// Transport failures are reported as [`MqiError::Connection`] so callers can
/// retry them. A command that runs but exits non-zero is a normal result.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn exec(&self, command: &str) -> Result<ExecutionResult>;
    async fn mkdir_all(&self, remote_dir: &str) -> Result<()>;
    async fn put_file(&self, local: &Path, remote_path: &str) -> Result<()>;
    async fn get_file(&self, remote_path: &str, local: &Path) -> Result<()>;
    async fn write_file(&self, remote_path: &str, contents: &str) -> Result<()>;
    async fn list_dir(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>>;
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parse `stat -c '%f %n'` lines (hex mode, space, path).
pub fn parse_stat_listing(output: &str) -> Vec<RemoteEntry> {
    output
        .lines()
        .filter_map(|line| {
            let (mode, path) = line.trim_end().split_once(' ')?;
            let mode = u32::from_str_radix(mode.trim(), 16).ok()?;
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            if name.is_empty() {
                return None;
            }
            Some(RemoteEntry { name, mode })
        })
        .collect()
}

pub struct OpenSshTransport {
    executor: Arc<dyn CommandExecutor>,
    config: HpcConfig,
    control_path: String,
}

impl OpenSshTransport {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: HpcConfig) -> Self {
        let session = uuid::Uuid::new_v4().simple().to_string();
        let control_path = format!(
            "{}/mqi-ssh-{}.sock",
            config.control_dir.trim_end_matches('/'),
            &session[..12]
        );
        Self {
            executor,
            config,
            control_path,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host)
    }

    fn ssh_base(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.ssh_binary)
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_seconds))
            .arg("-p")
            .arg(self.config.port.to_string());
        if let Some(key) = &self.config.key_file {
            spec = spec.arg("-i").arg(key);
        }
        spec.arg("-S").arg(&self.control_path)
    }

    fn scp_base(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.scp_binary)
            .args(["-q", "-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path))
            .arg("-P")
            .arg(self.config.port.to_string());
        if let Some(key) = &self.config.key_file {
            spec = spec.arg("-i").arg(key);
        }
        spec.timeout(self.config.command_timeout())
    }

    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), "Running transport command");
        self.executor.execute(&spec).await.map_err(|e| match e {
            CommandError::CommandNotFound { command } => {
                MqiError::Processing(format!("Transport binary not found: {}", command))
            }
            other => MqiError::Connection(other.to_string()),
        })
    }

    fn check_transport(output: &CommandOutput, action: &str) -> Result<()> {
        if output.status_code == SSH_TRANSPORT_FAILURE {
            return Err(MqiError::Connection(format!(
                "{} failed: {}",
                action,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn remote_shell(&self, command: &str, stdin: Option<&str>) -> Result<CommandOutput> {
        let mut spec = self
            .ssh_base()
            .arg(self.destination())
            .arg("--")
            .arg(command)
            .timeout(self.config.command_timeout());
        if let Some(input) = stdin {
            spec = spec.stdin(input);
        }
        let output = self.run(spec).await?;
        Self::check_transport(&output, "Remote command")?;
        Ok(output)
    }

    async fn copy(&self, from: String, to: String, what: &str) -> Result<()> {
        let output = self.run(self.scp_base().arg(from).arg(to)).await?;
        if !output.success() {
            return Err(MqiError::Connection(format!(
                "{} failed: {}",
                what,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTransport for OpenSshTransport {
    async fn open(&self) -> Result<()> {
        let spec = self
            .ssh_base()
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes"])
            .arg(self.destination())
            .arg("true")
            .timeout(self.config.connect_timeout() + self.config.command_timeout());
        let output = self.run(spec).await?;
        if !output.success() {
            return Err(MqiError::Connection(format!(
                "ssh to {} exited with {}: {}",
                self.destination(),
                output.status_code,
                output.stderr.trim()
            )));
        }
        info!(host = %self.config.host, control_path = %self.control_path, "SSH master session established");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let spec = self
            .ssh_base()
            .args(["-O", "exit"])
            .arg(self.destination())
            .timeout(self.config.connect_timeout());
        let output = self.run(spec).await?;
        if !output.success() {
            warn!(stderr = %output.stderr.trim(), "SSH master did not exit cleanly");
        }
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ExecutionResult> {
        let output = self.remote_shell(command, None).await?;
        Ok(ExecutionResult {
            success: output.success(),
            output: output.stdout,
            error: output.stderr,
            return_code: output.status_code,
        })
    }

    async fn mkdir_all(&self, remote_dir: &str) -> Result<()> {
        let output = self
            .remote_shell(&format!("mkdir -p {}", shell_quote(remote_dir)), None)
            .await?;
        if !output.success() {
            return Err(MqiError::Processing(format!(
                "Failed to create remote directory {}: {}",
                remote_dir,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn put_file(&self, local: &Path, remote_path: &str) -> Result<()> {
        if !local.is_file() {
            return Err(MqiError::Validation(format!(
                "Local file does not exist: {}",
                local.display()
            )));
        }
        let target = format!("{}:{}", self.destination(), remote_path);
        self.copy(local.to_string_lossy().to_string(), target, "Upload")
            .await
    }

    async fn get_file(&self, remote_path: &str, local: &Path) -> Result<()> {
        let source = format!("{}:{}", self.destination(), remote_path);
        self.copy(source, local.to_string_lossy().to_string(), "Download")
            .await
    }

    async fn write_file(&self, remote_path: &str, contents: &str) -> Result<()> {
        let output = self
            .remote_shell(&format!("cat > {}", shell_quote(remote_path)), Some(contents))
            .await?;
        if !output.success() {
            return Err(MqiError::Processing(format!(
                "Failed to write remote file {}: {}",
                remote_path,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn list_dir(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>> {
        let command = format!(
            "find {} -mindepth 1 -maxdepth 1 -exec stat -c '%f %n' {{}} +",
            shell_quote(remote_dir)
        );
        let output = self.remote_shell(&command, None).await?;
        if !output.success() {
            return Err(MqiError::Processing(format!(
                "Failed to list remote directory {}: {}",
                remote_dir,
                output.stderr.trim()
            )));
        }
        Ok(parse_stat_listing(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::ScriptedExecutor;

    fn transport(executor: Arc<ScriptedExecutor>) -> OpenSshTransport {
        let mut config = HpcConfig::default();
        config.host = "hpc.local".to_string();
        config.user = "sim".to_string();
        config.key_file = Some("/keys/id_ed25519".to_string());
        OpenSshTransport::new(executor, config)
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/data/case 1"), "'/data/case 1'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_stat_listing_classifies_directories() {
        let listing = "41ed /remote/case/dcm\n81a4 /remote/case/output.raw\n\ngarbage\n";
        let entries = parse_stat_listing(listing);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "dcm");
        assert!(entries[0].is_dir());
        assert_eq!(entries[1].name, "output.raw");
        assert!(!entries[1].is_dir());
    }

    #[tokio::test]
    async fn test_exec_uses_control_socket_and_reports_exit_code() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("squeue", 0, "RUNNING\n", "");
        let ssh = transport(executor.clone());

        let result = ssh.exec("squeue -j 7 --noheader -o %T").await.unwrap();
        assert!(result.success);
        assert_eq!(result.output.trim(), "RUNNING");

        let calls = executor.calls();
        let args = &calls[0].args;
        assert_eq!(calls[0].program, "ssh");
        assert!(args.windows(2).any(|w| w[0] == "-S" && w[1] == ssh.control_path));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id_ed25519"));
        assert!(args.contains(&"sim@hpc.local".to_string()));
    }

    #[tokio::test]
    async fn test_exit_255_is_a_connection_error() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("mkdir", 255, "", "Connection reset by peer");
        let ssh = transport(executor);

        let err = ssh.mkdir_all("/remote/x").await.unwrap_err();
        assert!(matches!(err, MqiError::Connection(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_put_file_rejects_missing_local_file() {
        let executor = Arc::new(ScriptedExecutor::new());
        let ssh = transport(executor.clone());

        let err = ssh
            .put_file(Path::new("/definitely/not/here.csv"), "/remote/here.csv")
            .await
            .unwrap_err();
        assert!(matches!(err, MqiError::Validation(_)));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_write_file_streams_contents_over_stdin() {
        let executor = Arc::new(ScriptedExecutor::new());
        let ssh = transport(executor.clone());

        ssh.write_file("/remote/job/submit_job.sh", "#!/bin/bash\n").await.unwrap();

        let calls = executor.calls();
        assert_eq!(calls[0].stdin.as_deref(), Some("#!/bin/bash\n"));
        assert_eq!(calls[0].args.last().unwrap(), "cat > '/remote/job/submit_job.sh'");
    }
}
