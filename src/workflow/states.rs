use crate::models::BeamStatus;

/// Per-beam workflow states.
///
/// Transitions are a pure function of `(state, outcome)`; the side effects of
/// each state live in [`crate::workflow::WorkflowManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeamState {
    Initial,
    FileUpload,
    HpcExecution,
    Download,
    Postprocessing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

impl BeamState {
    pub fn name(&self) -> &'static str {
        match self {
            BeamState::Initial => "Initial Validation",
            BeamState::FileUpload => "File Upload",
            BeamState::HpcExecution => "HPC Execution",
            BeamState::Download => "Download Results",
            BeamState::Postprocessing => "Postprocessing",
            BeamState::Completed => "Completed",
            BeamState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BeamState::Completed | BeamState::Failed)
    }

    pub fn next(self, outcome: StepOutcome) -> Option<BeamState> {
        use BeamState::*;

        match (self, outcome) {
            (Failed, _) | (Completed, StepOutcome::Succeeded) => None,
            (_, StepOutcome::Failed) => Some(Failed),
            (Initial, StepOutcome::Succeeded) => Some(FileUpload),
            (FileUpload, StepOutcome::Succeeded) => Some(HpcExecution),
            (HpcExecution, StepOutcome::Succeeded) => Some(Download),
            (Download, StepOutcome::Succeeded) => Some(Postprocessing),
            (Postprocessing, StepOutcome::Succeeded) => Some(Completed),
        }
    }

    /// Persisted status and progress written when the state is entered.
    pub fn entry_status(&self) -> (BeamStatus, f64) {
        match self {
            BeamState::Initial => (BeamStatus::Preprocessing, 5.0),
            BeamState::FileUpload => (BeamStatus::Uploading, 20.0),
            BeamState::HpcExecution => (BeamStatus::HpcQueued, 40.0),
            BeamState::Download => (BeamStatus::Downloading, 70.0),
            BeamState::Postprocessing => (BeamStatus::Postprocessing, 85.0),
            BeamState::Completed => (BeamStatus::Completed, 100.0),
            BeamState::Failed => (BeamStatus::Failed, 0.0),
        }
    }
}
