use std::path::PathBuf;

use crate::models::Beam;

/// Values handed from one state to the next during a single beam run.
#[derive(Debug, Clone)]
pub struct BeamContext {
    pub beam: Beam,
    pub remote_beam_dir: Option<String>,
    pub raw_output_file: Option<PathBuf>,
    pub last_error: Option<String>,
    pub progress: f64,
}

impl BeamContext {
    pub fn new(beam: Beam) -> Self {
        let progress = beam.progress;
        Self {
            beam,
            remote_beam_dir: None,
            raw_output_file: None,
            last_error: None,
            progress,
        }
    }

    pub fn beam_id(&self) -> &str {
        &self.beam.beam_id
    }

    pub fn case_id(&self) -> &str {
        &self.beam.parent_case_id
    }
}
