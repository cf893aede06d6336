use anyhow::{bail, Result};
use tracing::{error, info};

use crate::cli::context::PipelineContext;
use crate::models::{Beam, BeamStatus};
use crate::repositories::CaseRepository;
use crate::telemetry::{create_beam_span, generate_correlation_id};
use crate::workflow::{BeamState, WorkflowDeps, WorkflowManager};

fn manager_for(beam: &Beam, deps: WorkflowDeps) -> WorkflowManager {
    let span = create_beam_span(&beam.beam_id, &beam.parent_case_id, &generate_correlation_id());
    WorkflowManager::new(&beam.beam_id, deps, span)
}

pub struct RunBeamCommand {
    pub beam_id: String,
}

impl RunBeamCommand {
    pub async fn execute(&self, context: PipelineContext) -> Result<()> {
        let Some(beam) = context.cases.get_beam(&self.beam_id).await? else {
            context.close().await;
            bail!("Beam {} is not registered", self.beam_id);
        };
        // Failed beams may be retried; finished ones are left alone
        if matches!(beam.status, BeamStatus::Completed | BeamStatus::Cancelled) {
            context.close().await;
            bail!("Beam {} is already {}", self.beam_id, beam.status);
        }

        let state = manager_for(&beam, context.workflow_deps()).run().await;
        let beam = context.cases.get_beam(&self.beam_id).await?;
        context.close().await;

        match state {
            BeamState::Completed => {
                println!("✅ Beam {} completed", self.beam_id);
                Ok(())
            }
            _ => {
                let reason = beam
                    .and_then(|b| b.error_message)
                    .unwrap_or_else(|| "unknown error".to_string());
                bail!("Beam {} failed: {}", self.beam_id, reason)
            }
        }
    }
}

pub struct RunCaseCommand {
    pub case_id: String,
}

impl RunCaseCommand {
    /// Runs each pending beam on its own task; beams share the GPU ledger and HPC session.
    pub async fn execute(&self, context: PipelineContext) -> Result<()> {
        if context.cases.get_case(&self.case_id).await?.is_none() {
            context.close().await;
            bail!("Case {} is not registered", self.case_id);
        }

        let beams: Vec<Beam> = context
            .cases
            .get_beams_for_case(&self.case_id)
            .await?
            .into_iter()
            .filter(|b| !b.status.is_terminal())
            .collect();
        if beams.is_empty() {
            println!("Nothing to run for case {}", self.case_id);
            context.close().await;
            return Ok(());
        }

        info!(case_id = %self.case_id, beams = beams.len(), "Starting case");
        let mut handles = Vec::with_capacity(beams.len());
        for beam in &beams {
            let manager = manager_for(beam, context.workflow_deps());
            handles.push((beam.beam_id.clone(), tokio::spawn(manager.run())));
        }

        let mut failed = Vec::new();
        for (beam_id, handle) in handles {
            match handle.await {
                Ok(BeamState::Completed) => println!("✅ {}", beam_id),
                Ok(_) => {
                    println!("❌ {}", beam_id);
                    failed.push(beam_id);
                }
                Err(e) => {
                    error!(beam_id = %beam_id, error = %e, "Beam task panicked");
                    failed.push(beam_id);
                }
            }
        }

        if let Err(e) = context.cases.update_case_status_from_beams(&self.case_id).await {
            error!(case_id = %self.case_id, error = %e, "Could not refresh case status");
        }
        let case = context.cases.get_case(&self.case_id).await?;
        context.close().await;

        if let Some(case) = case {
            println!("Case {}: {} ({:.0}%)", case.case_id, case.status, case.progress);
        }
        if !failed.is_empty() {
            bail!("{} of {} beams failed: {}", failed.len(), beams.len(), failed.join(", "));
        }
        Ok(())
    }
}
