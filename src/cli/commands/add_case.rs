use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::repositories::SqliteCaseRepository;

/// Register a whole case: every subdirectory of the case directory becomes a beam.
pub struct AddCaseCommand {
    pub case_id: String,
    pub case_path: PathBuf,
}

impl AddCaseCommand {
    pub async fn execute(&self, cases: &SqliteCaseRepository) -> Result<()> {
        if !self.case_path.is_dir() {
            bail!("Case directory {} does not exist", self.case_path.display());
        }
        let case_path = self.case_path.canonicalize()?;

        let beams = cases.decompose_case(&self.case_id, &case_path).await?;
        if beams.is_empty() {
            bail!("Case {} has no beam subdirectories in {}", self.case_id, case_path.display());
        }

        println!("✅ Registered case {} with {} beams", self.case_id, beams.len());
        for beam in &beams {
            println!("   {} ({})", beam.beam_id, beam.status);
        }
        Ok(())
    }
}
