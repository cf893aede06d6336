use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::repositories::SqliteCaseRepository;

pub struct AddBeamCommand {
    pub case_id: String,
    pub beam_id: String,
    pub beam_path: PathBuf,
    pub case_path: Option<PathBuf>,
}

impl AddBeamCommand {
    pub async fn execute(&self, cases: &SqliteCaseRepository) -> Result<()> {
        if !self.beam_path.is_dir() {
            bail!("Beam directory {} does not exist", self.beam_path.display());
        }
        let beam_path = self.beam_path.canonicalize()?;
        let case_path = match &self.case_path {
            Some(path) => path.clone(),
            None => beam_path.parent().map(PathBuf::from).unwrap_or_else(|| beam_path.clone()),
        };

        cases.create_case(&self.case_id, &case_path).await?;
        cases.create_beam(&self.beam_id, &self.case_id, &beam_path).await?;

        println!(
            "✅ Registered beam {} for case {} ({})",
            self.beam_id,
            self.case_id,
            beam_path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_database;
    use crate::models::BeamStatus;
    use crate::repositories::CaseRepository;

    #[tokio::test]
    async fn test_registers_case_and_beam() {
        let (dir, db) = temp_database().await;
        let beam_dir = dir.path().join("case-9/beam-a");
        std::fs::create_dir_all(&beam_dir).unwrap();
        let cases = SqliteCaseRepository::new(db.pool().clone());

        let command = AddBeamCommand {
            case_id: "case-9".to_string(),
            beam_id: "beam-a".to_string(),
            beam_path: beam_dir.clone(),
            case_path: None,
        };
        command.execute(&cases).await.unwrap();

        let beam = cases.get_beam("beam-a").await.unwrap().unwrap();
        assert_eq!(beam.status, BeamStatus::Pending);
        assert_eq!(beam.parent_case_id, "case-9");
        let case = cases.get_case("case-9").await.unwrap().unwrap();
        assert_eq!(case.case_path, beam_dir.canonicalize().unwrap().parent().unwrap());
    }

    #[tokio::test]
    async fn test_rejects_missing_directory() {
        let (dir, db) = temp_database().await;
        let cases = SqliteCaseRepository::new(db.pool().clone());
        let command = AddBeamCommand {
            case_id: "case-9".to_string(),
            beam_id: "beam-a".to_string(),
            beam_path: dir.path().join("nope"),
            case_path: None,
        };
        assert!(command.execute(&cases).await.is_err());
    }
}
