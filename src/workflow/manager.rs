use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::MqiConfig;
use crate::error::{MqiError, Result};
use crate::handlers::{LocalHandler, RemoteHandler};
use crate::models::{BeamStatus, WorkflowStep};
use crate::repositories::{CaseRepository, GpuRepository};
use crate::workflow::context::BeamContext;
use crate::workflow::states::{BeamState, StepOutcome};
use crate::workflow::tps::{TpsGenerator, TPS_FILE_NAME};

pub const RAW_OUTPUT_FILE: &str = "output.raw";
pub const DICOM_OUTPUT_DIR: &str = "dcm_output";

/// Shared handles every beam workflow needs.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub case_repo: Arc<dyn CaseRepository>,
    pub gpu_repo: GpuRepository,
    pub local: Arc<LocalHandler>,
    pub remote: Arc<RemoteHandler>,
    pub tps: Arc<dyn TpsGenerator>,
    pub config: Arc<MqiConfig>,
}

/// Drives one beam from validation to DICOM output.
///
/// Step errors never escape [`WorkflowManager::run`]: they are logged with the
/// state and progress they happened at, stored on the beam, and the machine
/// moves to [`BeamState::Failed`].
pub struct WorkflowManager {
    beam_id: String,
    deps: WorkflowDeps,
    span: Span,
}

fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// The underlying cause of a transfer failure, without the wrapper text.
fn transfer_cause(e: MqiError) -> MqiError {
    match e {
        MqiError::Transfer { source, .. } => *source,
        other => other,
    }
}

impl WorkflowManager {
    pub fn new(beam_id: &str, deps: WorkflowDeps, span: Span) -> Self {
        Self {
            beam_id: beam_id.to_string(),
            deps,
            span,
        }
    }

    /// Run the beam to a terminal state and return it.
    pub async fn run(self) -> BeamState {
        let span = self.span.clone();
        async move { self.drive().await }.instrument(span).await
    }

    async fn drive(&self) -> BeamState {
        let beam = match self.deps.case_repo.get_beam(&self.beam_id).await {
            Ok(Some(beam)) => beam,
            Ok(None) => {
                error!(beam_id = %self.beam_id, "Beam not found; nothing to run");
                return BeamState::Failed;
            }
            Err(e) => {
                error!(beam_id = %self.beam_id, error = %e, "Could not load beam");
                let message = format!("Failed to load beam '{}': {}", self.beam_id, e);
                if let Err(e) = self
                    .deps
                    .case_repo
                    .update_beam_status(&self.beam_id, BeamStatus::Failed, Some(message.as_str()), None)
                    .await
                {
                    error!(beam_id = %self.beam_id, error = %e, "Could not mark beam failed");
                }
                return BeamState::Failed;
            }
        };

        let mut ctx = BeamContext::new(beam);
        let mut state = BeamState::Initial;
        info!(case_id = %ctx.case_id(), "Beam workflow started");

        loop {
            if state == BeamState::Failed {
                self.enter_failed(&ctx).await;
                return state;
            }

            let outcome = match self.execute_state(state, &mut ctx).await {
                Ok(()) => StepOutcome::Succeeded,
                Err(e) => {
                    let message = format!(
                        "Error in state '{}' for beam '{}': {}",
                        state.name(),
                        ctx.beam_id(),
                        e
                    );
                    error!(state = state.name(), progress = ctx.progress, error = %e, "Workflow step failed");
                    ctx.last_error = Some(message);
                    StepOutcome::Failed
                }
            };

            match state.next(outcome) {
                Some(next) => {
                    debug!(from = state.name(), to = next.name(), "State transition");
                    state = next;
                }
                None => return state,
            }
        }
    }

    async fn execute_state(&self, state: BeamState, ctx: &mut BeamContext) -> Result<()> {
        match state {
            BeamState::Initial => self.initial_validation(ctx).await,
            BeamState::FileUpload => self.file_upload(ctx).await,
            BeamState::HpcExecution => self.hpc_execution(ctx).await,
            BeamState::Download => self.download_results(ctx).await,
            BeamState::Postprocessing => self.postprocessing(ctx).await,
            BeamState::Completed => self.completed(ctx).await,
            BeamState::Failed => Ok(()),
        }
    }

    async fn enter(&self, state: BeamState, ctx: &mut BeamContext) -> Result<()> {
        let (status, progress) = state.entry_status();
        self.deps
            .case_repo
            .update_beam_status(ctx.beam_id(), status, None, Some(progress))
            .await?;
        ctx.progress = progress;
        info!(state = state.name(), status = %status, progress, "Entered state");
        Ok(())
    }

    /// Audit rows are best effort; losing one never fails the beam.
    async fn record_step(
        &self,
        ctx: &BeamContext,
        step: WorkflowStep,
        status: &str,
        metadata: serde_json::Value,
        error_message: Option<&str>,
    ) {
        let mut metadata = metadata;
        if let Some(map) = metadata.as_object_mut() {
            map.insert("beam_id".to_string(), json!(ctx.beam_id()));
        }
        if let Err(e) = self
            .deps
            .case_repo
            .record_workflow_step(ctx.case_id(), step, status, Some(metadata), error_message)
            .await
        {
            warn!(step = %step, error = %e, "Could not record workflow step");
        }
    }

    async fn ensure_remote(&self) -> Result<()> {
        if !self.deps.remote.is_connected() {
            self.deps.remote.connect().await?;
        }
        Ok(())
    }

    async fn initial_validation(&self, ctx: &mut BeamContext) -> Result<()> {
        self.deps.case_repo.clear_beam_error(ctx.beam_id()).await?;
        self.enter(BeamState::Initial, ctx).await?;
        let beam_path = ctx.beam.beam_path.clone();

        if !beam_path.is_dir() {
            return Err(MqiError::Validation(format!(
                "Beam path does not exist or is not a directory: {}",
                beam_path.display()
            )));
        }
        if !self.deps.local.validate_case_structure(&beam_path) {
            return Err(MqiError::Validation(format!(
                "Beam directory failed structure validation: {}",
                beam_path.display()
            )));
        }

        let generated = self.deps.tps.generate_tps_file(&ctx.beam).await?;
        if !generated || !beam_path.join(TPS_FILE_NAME).is_file() {
            return Err(MqiError::workflow(
                WorkflowStep::TpsGeneration.as_str(),
                ctx.case_id(),
                format!("Failed to generate {}", TPS_FILE_NAME),
            ));
        }
        self.record_step(ctx, WorkflowStep::TpsGeneration, "completed", json!({}), None)
            .await;

        if self.deps.local.has_interpreter() {
            let result = self.deps.local.run_mqi_interpreter(&beam_path, &beam_path).await?;
            if !result.success {
                return Err(MqiError::Processing(format!(
                    "mqi_interpreter failed: {}",
                    result.failure_reason()
                )));
            }
            let csv_files = files_with_extension(&beam_path, "csv")?;
            if csv_files.is_empty() {
                return Err(MqiError::Processing(
                    "No CSV files generated after preprocessing".to_string(),
                ));
            }
            self.record_step(
                ctx,
                WorkflowStep::Preprocessing,
                "completed",
                json!({ "csv_files": csv_files.len() }),
                None,
            )
            .await;
        }
        Ok(())
    }

    async fn file_upload(&self, ctx: &mut BeamContext) -> Result<()> {
        self.enter(BeamState::FileUpload, ctx).await?;
        let beam_path = ctx.beam.beam_path.clone();

        let tps_file = beam_path.join(TPS_FILE_NAME);
        if !tps_file.is_file() {
            return Err(MqiError::Validation(format!(
                "Input file {} not found in {}",
                TPS_FILE_NAME,
                beam_path.display()
            )));
        }
        let mut files = files_with_extension(&beam_path, "csv")?;
        files.push(tps_file);

        let remote_dir = self
            .deps
            .config
            .hpc
            .remote_beam_dir(ctx.case_id(), ctx.beam_id());
        self.ensure_remote().await?;

        for file in &files {
            let name = display_name(file);
            self.deps
                .remote
                .upload_file(file, &remote_dir)
                .await
                .map_err(|e| {
                    MqiError::Processing(format!("Failed to upload file {}: {}", name, transfer_cause(e)))
                })?;
        }

        info!(files = files.len(), remote_dir = %remote_dir, "Beam inputs uploaded");
        self.record_step(
            ctx,
            WorkflowStep::FileUpload,
            "completed",
            json!({ "files": files.len(), "remote_dir": remote_dir }),
            None,
        )
        .await;
        ctx.remote_beam_dir = Some(remote_dir);
        Ok(())
    }

    fn remote_dir<'a>(&self, ctx: &'a BeamContext, step: WorkflowStep) -> Result<&'a str> {
        ctx.remote_beam_dir.as_deref().ok_or_else(|| {
            MqiError::workflow(step.as_str(), ctx.case_id(), "Remote beam directory is unknown")
        })
    }

    async fn hpc_execution(&self, ctx: &mut BeamContext) -> Result<()> {
        let remote_dir = self.remote_dir(ctx, WorkflowStep::HpcSubmission)?.to_string();

        let gpu = self
            .deps
            .gpu_repo
            .find_and_lock_available_gpu(ctx.beam_id(), self.deps.config.gpu.min_memory_mb)
            .await?
            .ok_or_else(|| MqiError::GpuResource("No GPU available".to_string()))?;
        info!(gpu = %gpu, "GPU allocated");

        let outcome = self.run_simulation(ctx, &remote_dir, &gpu).await;

        // The GPU is only held for the queue and run window
        if let Err(e) = self.deps.gpu_repo.release_gpu(&gpu).await {
            warn!(gpu = %gpu, error = %e, "Could not release GPU");
        }
        if let Err(e) = self.deps.case_repo.set_beam_gpu(ctx.beam_id(), None).await {
            warn!(error = %e, "Could not clear GPU assignment on beam");
        }
        outcome
    }

    async fn run_simulation(&self, ctx: &mut BeamContext, remote_dir: &str, gpu: &str) -> Result<()> {
        self.enter(BeamState::HpcExecution, ctx).await?;
        self.deps.case_repo.set_beam_gpu(ctx.beam_id(), Some(gpu)).await?;
        self.ensure_remote().await?;

        let submission = self
            .deps
            .remote
            .submit_simulation_job(ctx.beam_id(), remote_dir, gpu)
            .await?;
        let job_id = match (submission.success, submission.job_id) {
            (true, Some(job_id)) => job_id,
            _ => {
                let reason = submission
                    .error
                    .unwrap_or_else(|| "no job id returned".to_string());
                self.record_step(ctx, WorkflowStep::HpcSubmission, "failed", json!({ "gpu": gpu }), Some(reason.as_str()))
                    .await;
                return Err(MqiError::Processing(format!("Failed to submit HPC job: {}", reason)));
            }
        };

        self.deps
            .case_repo
            .assign_hpc_job_id_to_beam(ctx.beam_id(), &job_id)
            .await?;
        self.record_step(
            ctx,
            WorkflowStep::HpcSubmission,
            "completed",
            json!({ "job_id": job_id, "gpu": gpu }),
            None,
        )
        .await;

        self.deps
            .case_repo
            .update_beam_status(ctx.beam_id(), BeamStatus::HpcRunning, None, Some(50.0))
            .await?;
        ctx.progress = 50.0;
        info!(job_id = %job_id, "Waiting for simulation job");

        let status = self
            .deps
            .remote
            .wait_for_job_completion(&job_id, self.deps.config.hpc.job_timeout())
            .await?;
        if !status.completed {
            let reason = status
                .error
                .unwrap_or_else(|| format!("Job {} ended in state {}", job_id, status.state));
            self.record_step(
                ctx,
                WorkflowStep::SimulationRunning,
                "failed",
                json!({ "job_id": job_id, "state": status.state }),
                Some(reason.as_str()),
            )
            .await;
            return Err(MqiError::Processing(reason));
        }

        self.record_step(
            ctx,
            WorkflowStep::SimulationRunning,
            "completed",
            json!({ "job_id": job_id, "state": status.state }),
            None,
        )
        .await;
        Ok(())
    }

    async fn download_results(&self, ctx: &mut BeamContext) -> Result<()> {
        self.enter(BeamState::Download, ctx).await?;
        let remote_dir = self.remote_dir(ctx, WorkflowStep::Download)?.to_string();
        let local_dir = self
            .deps
            .config
            .paths
            .result_dir(ctx.case_id())
            .join(ctx.beam_id());

        self.ensure_remote().await?;
        let files = self
            .deps
            .remote
            .download_results(ctx.beam_id(), &remote_dir, &local_dir)
            .await?;

        let raw_file = local_dir.join(RAW_OUTPUT_FILE);
        if !raw_file.is_file() {
            return Err(MqiError::Processing(format!(
                "Expected output file {} not found after download",
                RAW_OUTPUT_FILE
            )));
        }

        if !self.deps.remote.cleanup_remote_directory(&remote_dir).await {
            warn!(remote_dir = %remote_dir, "Remote working directory left behind");
        }

        self.record_step(
            ctx,
            WorkflowStep::Download,
            "completed",
            json!({ "files": files, "local_dir": local_dir.display().to_string() }),
            None,
        )
        .await;
        ctx.raw_output_file = Some(raw_file);
        Ok(())
    }

    async fn postprocessing(&self, ctx: &mut BeamContext) -> Result<()> {
        self.enter(BeamState::Postprocessing, ctx).await?;
        let raw_file = match ctx.raw_output_file.clone() {
            Some(path) if path.is_file() => path,
            _ => {
                return Err(MqiError::workflow(
                    WorkflowStep::Postprocessing.as_str(),
                    ctx.case_id(),
                    format!("{} is missing", RAW_OUTPUT_FILE),
                ))
            }
        };

        let result_dir = raw_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let output_dir = result_dir.join(DICOM_OUTPUT_DIR);
        tokio::fs::create_dir_all(&output_dir).await?;

        let result = self
            .deps
            .local
            .run_raw_to_dcm(&raw_file, &output_dir, &ctx.beam.beam_path)
            .await?;
        if !result.success {
            return Err(MqiError::Processing(format!(
                "RawToDCM failed for beam {}: {}",
                ctx.beam_id(),
                result.failure_reason()
            )));
        }

        let dicom_files = files_with_extension(&output_dir, "dcm")?;
        if dicom_files.is_empty() {
            return Err(MqiError::Processing(format!(
                "No DICOM files generated in {}",
                output_dir.display()
            )));
        }

        if let Err(e) = tokio::fs::remove_file(&raw_file).await {
            warn!(file = %raw_file.display(), error = %e, "Could not remove raw output");
        }

        self.record_step(
            ctx,
            WorkflowStep::Postprocessing,
            "completed",
            json!({ "dicom_files": dicom_files.len(), "output_dir": output_dir.display().to_string() }),
            None,
        )
        .await;
        Ok(())
    }

    async fn completed(&self, ctx: &mut BeamContext) -> Result<()> {
        self.enter(BeamState::Completed, ctx).await?;
        self.record_step(ctx, WorkflowStep::Completed, "completed", json!({}), None)
            .await;
        if let Err(e) = self
            .deps
            .case_repo
            .update_case_status_from_beams(ctx.case_id())
            .await
        {
            warn!(error = %e, "Could not refresh case status");
        }
        info!("Beam workflow completed");
        Ok(())
    }

    /// Terminal failure handling. Every step is attempted even if an earlier one fails.
    async fn enter_failed(&self, ctx: &BeamContext) {
        let message = ctx
            .last_error
            .clone()
            .or_else(|| ctx.beam.error_message.clone())
            .unwrap_or_else(|| format!("Beam '{}' failed", ctx.beam_id()));

        if let Err(e) = self
            .deps
            .case_repo
            .update_beam_status(ctx.beam_id(), BeamStatus::Failed, Some(message.as_str()), None)
            .await
        {
            error!(error = %e, "Could not mark beam failed");
        }

        match self.deps.gpu_repo.release_all_for_case(ctx.beam_id()).await {
            Ok(0) => {}
            Ok(released) => info!(released, "Released GPUs held by failed beam"),
            Err(e) => warn!(error = %e, "Could not release GPUs for failed beam"),
        }
        if let Err(e) = self.deps.case_repo.set_beam_gpu(ctx.beam_id(), None).await {
            warn!(error = %e, "Could not clear GPU assignment on beam");
        }

        self.record_step(ctx, WorkflowStep::Failed, "failed", json!({}), Some(message.as_str()))
            .await;
        if let Err(e) = self
            .deps
            .case_repo
            .update_case_status_from_beams(ctx.case_id())
            .await
        {
            warn!(error = %e, "Could not refresh case status");
        }
        error!(progress = ctx.progress, error = %message, "Beam workflow failed");
    }
}
