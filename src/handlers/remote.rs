//! Remote execution on the GPU cluster: transfers and Slurm job lifecycle
//!
//! Every transport call goes through the circuit breaker and then the retry
//! policy. A remote command that exits non-zero is a result, not an error.

use regex::Regex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::HpcConfig;
use crate::error::{MqiError, Result};
use crate::handlers::ssh::{shell_quote, RemoteTransport};
use crate::models::{ExecutionResult, JobStatus, JobSubmission};
use crate::observability::{timed, OperationTimer};
use crate::resilience::{CircuitBreaker, RetryPolicy};

pub const SUBMIT_SCRIPT_NAME: &str = "submit_job.sh";

static JOB_ID_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").ok());

/// Extract the job id from sbatch output.
pub fn parse_job_id(output: &str) -> Option<String> {
    let pattern = JOB_ID_PATTERN.as_ref()?;
    pattern
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub struct RemoteHandler {
    transport: Arc<dyn RemoteTransport>,
    config: HpcConfig,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    connected: AtomicBool,
}

impl RemoteHandler {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        config: HpcConfig,
        retry: RetryPolicy,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            transport,
            config,
            retry,
            breaker,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &HpcConfig {
        &self.config
    }

    async fn guarded<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let operation = &operation;
        self.retry
            .execute(operation_name, move || self.breaker.call(move || operation()))
            .await
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MqiError::NotConnected)
        }
    }

    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        info!(host = %self.config.host, user = %self.config.user, "Connecting to HPC system");
        match self.guarded("hpc_connect", || self.transport.open()).await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(host = %self.config.host, "Connected to HPC system");
                Ok(())
            }
            Err(e) => {
                error!(host = %self.config.host, error = %e, "HPC connection failed");
                Err(MqiError::Processing(format!("Failed to connect to HPC system: {}", e)))
            }
        }
    }

    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error while closing HPC session");
        }
        info!(host = %self.config.host, "Disconnected from HPC system");
    }

    /// Run `command` on the login node, optionally inside `cwd`.
    pub async fn execute_remote_command(
        &self,
        context: &str,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<ExecutionResult> {
        self.ensure_connected()?;
        let full = match cwd {
            Some(dir) => format!("cd {} && {}", shell_quote(dir), command),
            None => command.to_string(),
        };

        debug!(context, command = %full, "Executing remote command");
        let result = self
            .guarded("remote_command", || self.transport.exec(&full))
            .await?;
        if !result.success {
            warn!(
                context,
                command = %full,
                return_code = result.return_code,
                stderr = %result.error.trim(),
                "Remote command exited non-zero"
            );
        }
        Ok(result)
    }

    /// Upload one file into `remote_dir`, retrying this file alone.
    pub async fn upload_file(&self, local: &Path, remote_dir: &str) -> Result<()> {
        self.ensure_connected()?;
        let name = file_name(local);
        let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
        let remote_path = remote_path.as_str();

        self.guarded("upload_file", || async move {
            self.transport.mkdir_all(remote_dir).await?;
            self.transport.put_file(local, remote_path).await
        })
        .await
        .map_err(|e| MqiError::Transfer {
            path: name.clone(),
            source: Box::new(e),
        })?;

        debug!(file = %name, remote_dir, "File uploaded");
        Ok(())
    }

    /// Mirror `local_dir` into `remote_dir`. The whole tree is retried as one unit.
    pub async fn upload_case(&self, case_id: &str, local_dir: &Path, remote_dir: &str) -> Result<usize> {
        self.ensure_connected()?;
        let timer = OperationTimer::new("upload_case");
        let result = self
            .guarded("upload_case", || self.upload_tree(local_dir, remote_dir))
            .await;
        let uploaded = timed(timer, result)?;
        info!(case_id, files = uploaded, remote_dir, "Case uploaded");
        Ok(uploaded)
    }

    async fn upload_tree(&self, local_root: &Path, remote_root: &str) -> Result<usize> {
        let mut pending = vec![(local_root.to_path_buf(), remote_root.trim_end_matches('/').to_string())];
        let mut uploaded = 0;

        while let Some((local_dir, remote_dir)) = pending.pop() {
            self.transport.mkdir_all(&remote_dir).await?;

            let mut entries: Vec<PathBuf> = std::fs::read_dir(&local_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .collect();
            entries.sort();

            for path in entries {
                let name = file_name(&path);
                let remote_path = format!("{}/{}", remote_dir, name);
                if path.is_dir() {
                    pending.push((path, remote_path));
                    continue;
                }
                self.transport
                    .put_file(&path, &remote_path)
                    .await
                    .map_err(|e| MqiError::Transfer {
                        path: relative_display(local_root, &path),
                        source: Box::new(e),
                    })?;
                uploaded += 1;
            }
        }
        Ok(uploaded)
    }

    /// Recursively copy `remote_dir` into `local_dir`.
    pub async fn download_results(&self, case_id: &str, remote_dir: &str, local_dir: &Path) -> Result<usize> {
        self.ensure_connected()?;
        let timer = OperationTimer::new("download_results");
        let result = self
            .guarded("download_results", || self.download_tree(remote_dir, local_dir))
            .await;
        let downloaded = timed(timer, result)?;
        info!(case_id, files = downloaded, local_dir = %local_dir.display(), "Results downloaded");
        Ok(downloaded)
    }

    async fn download_tree(&self, remote_root: &str, local_root: &Path) -> Result<usize> {
        let mut pending = vec![(remote_root.trim_end_matches('/').to_string(), local_root.to_path_buf())];
        let mut downloaded = 0;

        while let Some((remote_dir, local_dir)) = pending.pop() {
            tokio::fs::create_dir_all(&local_dir).await?;
            for entry in self.transport.list_dir(&remote_dir).await? {
                let remote_path = format!("{}/{}", remote_dir, entry.name);
                let local_path = local_dir.join(&entry.name);
                if entry.is_dir() {
                    pending.push((remote_path, local_path));
                    continue;
                }
                self.transport
                    .get_file(&remote_path, &local_path)
                    .await
                    .map_err(|e| MqiError::Transfer {
                        path: remote_path.clone(),
                        source: Box::new(e),
                    })?;
                downloaded += 1;
            }
        }
        Ok(downloaded)
    }

    fn render_submit_script(&self, beam_id: &str, remote_dir: &str, gpu_uuid: &str) -> String {
        format!(
            r#"#!/bin/bash
#SBATCH --job-name=mqi_{beam_id}
#SBATCH --partition={partition}
#SBATCH --gres=gpu:1
#SBATCH --time={time_limit}
#SBATCH --chdir={remote_dir}
#SBATCH --output={remote_dir}/slurm-%j.out
#SBATCH --error={remote_dir}/slurm-%j.err

export CUDA_VISIBLE_DEVICES={gpu_uuid}
cd {remote_dir}
{binary} moqui_tps.in
"#,
            beam_id = beam_id,
            partition = self.config.partition,
            time_limit = self.config.time_limit,
            remote_dir = remote_dir,
            gpu_uuid = gpu_uuid,
            binary = self.config.moqui_binary,
        )
    }

    /// Write the batch script for one beam and submit it pinned to `gpu_uuid`.
    pub async fn submit_simulation_job(
        &self,
        beam_id: &str,
        remote_dir: &str,
        gpu_uuid: &str,
    ) -> Result<JobSubmission> {
        self.ensure_connected()?;
        let remote_dir = remote_dir.trim_end_matches('/');
        let script_path = format!("{}/{}", remote_dir, SUBMIT_SCRIPT_NAME);
        let script = self.render_submit_script(beam_id, remote_dir, gpu_uuid);

        self.guarded("write_submit_script", || self.transport.write_file(&script_path, &script))
            .await?;

        let result = self
            .execute_remote_command(beam_id, &format!("sbatch {}", script_path), None)
            .await?;

        if !result.success {
            let reason = result.failure_reason();
            error!(beam_id, error = %reason, "sbatch rejected the job");
            return Ok(JobSubmission {
                success: false,
                job_id: None,
                error: Some(format!("sbatch failed: {}", reason)),
            });
        }

        match parse_job_id(&result.output) {
            Some(job_id) => {
                info!(beam_id, job_id = %job_id, gpu = %gpu_uuid, "Simulation job submitted");
                Ok(JobSubmission {
                    success: true,
                    job_id: Some(job_id),
                    error: None,
                })
            }
            None => {
                error!(beam_id, output = %result.output.trim(), "Could not parse sbatch output");
                Ok(JobSubmission {
                    success: false,
                    job_id: None,
                    error: Some(format!(
                        "Unexpected sbatch output: {}",
                        result.output.trim()
                    )),
                })
            }
        }
    }

    /// Live-queue state, or `None` once the job has left the queue.
    async fn query_live_queue(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let result = self
            .execute_remote_command(job_id, &format!("squeue -j {} --noheader -o %T", job_id), None)
            .await?;
        // squeue exits non-zero for ids it no longer knows
        let state = result.output.lines().map(str::trim).find(|l| !l.is_empty());
        match (result.success, state) {
            (true, Some(state)) => Ok(Some(JobStatus::from_slurm_state(job_id, state))),
            _ => Ok(None),
        }
    }

    async fn query_accounting(&self, job_id: &str) -> Result<JobStatus> {
        let result = self
            .execute_remote_command(
                job_id,
                &format!("sacct -j {} --noheader --parsable2 -o State", job_id),
                None,
            )
            .await?;
        let state = result.output.lines().map(str::trim).find(|l| !l.is_empty());
        match (result.success, state) {
            (true, Some(state)) => Ok(JobStatus::from_slurm_state(job_id, state)),
            _ => {
                warn!(job_id, "No accounting record for finished job; assuming completion");
                Ok(JobStatus::from_slurm_state(job_id, "COMPLETED"))
            }
        }
    }

    /// One-shot status lookup: the live queue first, then accounting history.
    pub async fn check_job_status(&self, job_id: &str) -> Result<JobStatus> {
        match self.query_live_queue(job_id).await? {
            Some(status) => Ok(status),
            None => self.query_accounting(job_id).await,
        }
    }

    /// Poll until the job reaches a terminal state or `timeout` elapses.
    ///
    /// A timeout is reported as a status with `timed_out` set, never as an error.
    pub async fn wait_for_job_completion(&self, job_id: &str, timeout: Duration) -> Result<JobStatus> {
        let started = Instant::now();
        let poll_interval = self.config.poll_interval();
        let timer = OperationTimer::new("wait_for_job_completion");
        let mut last_state = String::from("PENDING");

        loop {
            match self.query_live_queue(job_id).await? {
                Some(status) if status.is_active() => {
                    if status.state != last_state {
                        info!(job_id, state = %status.state, "Job state changed");
                        last_state = status.state.clone();
                    }
                }
                Some(status) => {
                    timer.finish();
                    return Ok(status);
                }
                None => {
                    let status = self.query_accounting(job_id).await?;
                    info!(job_id, state = %status.state, "Job left the queue");
                    timer.finish();
                    return Ok(status);
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(job_id, waited_secs = elapsed.as_secs(), state = %last_state, "Gave up waiting for job");
                timer.finish();
                return Ok(JobStatus::timed_out(job_id, &last_state, timeout.as_secs()));
            }
            tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Best-effort `rm -rf` of a remote directory. Never fails the caller.
    pub async fn cleanup_remote_directory(&self, remote_dir: &str) -> bool {
        let target = remote_dir.trim().trim_end_matches('/');
        if target.is_empty() {
            warn!(remote_dir, "Refusing to clean up an empty or root path");
            return false;
        }

        match self
            .execute_remote_command("cleanup", &format!("rm -rf {}", shell_quote(target)), None)
            .await
        {
            Ok(result) if result.success => {
                info!(remote_dir = target, "Remote directory removed");
                true
            }
            Ok(result) => {
                warn!(remote_dir = target, error = %result.failure_reason(), "Remote cleanup failed");
                false
            }
            Err(e) => {
                warn!(remote_dir = target, error = %e, "Remote cleanup failed");
                false
            }
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
