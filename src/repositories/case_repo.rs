use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{
    parse_db_timestamp, Beam, BeamStatus, Case, CaseStatus, WorkflowStep, WorkflowStepRecord,
};

pub const NO_BEAMS_MESSAGE: &str = "No beam subdirectories found";

/// Persistence used by the beam workflow.
#[async_trait]
pub trait CaseRepository: Send + Sync {
    async fn get_beam(&self, beam_id: &str) -> Result<Option<Beam>>;

    /// Set the beam status. A `None` message or progress keeps the stored value.
    async fn update_beam_status(
        &self,
        beam_id: &str,
        status: BeamStatus,
        error_message: Option<&str>,
        progress: Option<f64>,
    ) -> Result<()>;

    async fn assign_hpc_job_id_to_beam(&self, beam_id: &str, job_id: &str) -> Result<()>;

    /// Append an audit row; rows are never updated afterwards.
    async fn record_workflow_step(
        &self,
        case_id: &str,
        step: WorkflowStep,
        status: &str,
        metadata: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn set_beam_gpu(&self, _beam_id: &str, _gpu_uuid: Option<&str>) -> Result<()> {
        Ok(())
    }

    /// Recompute the parent case status from its beams.
    async fn update_case_status_from_beams(&self, _case_id: &str) -> Result<()> {
        Ok(())
    }

    /// Forget the message left by an earlier failed run.
    async fn clear_beam_error(&self, _beam_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteCaseRepository {
    pool: SqlitePool,
}

impl SqliteCaseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_case(&self, case_id: &str, case_path: &Path) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cases (case_id, case_path, status, progress)
            VALUES (?1, ?2, 'pending', 0.0)
            ON CONFLICT(case_id) DO NOTHING
            "#,
        )
        .bind(case_id)
        .bind(case_path.to_string_lossy().as_ref())
        .execute(&self.pool)
        .await?;

        info!(case_id, "Case registered");
        Ok(())
    }

    pub async fn create_beam(&self, beam_id: &str, case_id: &str, beam_path: &Path) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO beams (beam_id, parent_case_id, beam_path, status, progress)
            VALUES (?1, ?2, ?3, 'pending', 0.0)
            "#,
        )
        .bind(beam_id)
        .bind(case_id)
        .bind(beam_path.to_string_lossy().as_ref())
        .execute(&self.pool)
        .await?;

        info!(beam_id, case_id, "Beam registered");
        Ok(())
    }

    /// Register one beam per subdirectory of `case_path`, named `<case_id>_<dir name>`.
    ///
    /// The case moves to Processing while its beams are registered. A case with no
    /// subdirectories is marked Failed and yields no beams. Beams that already exist
    /// are left untouched, so decomposing twice is harmless. Any other error marks
    /// the case Failed with the error text and is returned.
    pub async fn decompose_case(&self, case_id: &str, case_path: &Path) -> Result<Vec<Beam>> {
        self.create_case(case_id, case_path).await?;

        match self.register_beam_dirs(case_id, case_path).await {
            Ok(beams) => Ok(beams),
            Err(e) => {
                let message = e.to_string();
                if let Err(db_err) = self
                    .update_case_status(case_id, CaseStatus::Failed, 0.0, Some(message.as_str()))
                    .await
                {
                    warn!(case_id, error = %db_err, "Could not mark case failed after decomposition error");
                }
                Err(e)
            }
        }
    }

    async fn register_beam_dirs(&self, case_id: &str, case_path: &Path) -> Result<Vec<Beam>> {
        self.update_case_status(case_id, CaseStatus::Processing, 0.0, None)
            .await?;

        let mut beam_dirs = Vec::new();
        for entry in std::fs::read_dir(case_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                beam_dirs.push(entry.path());
            }
        }
        beam_dirs.sort();

        if beam_dirs.is_empty() {
            warn!(case_id, case_path = %case_path.display(), "No beam subdirectories found");
            self.update_case_status(case_id, CaseStatus::Failed, 0.0, Some(NO_BEAMS_MESSAGE))
                .await?;
            return Ok(Vec::new());
        }

        let mut beams = Vec::with_capacity(beam_dirs.len());
        for dir in &beam_dirs {
            let dir_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let beam_id = format!("{}_{}", case_id, dir_name);

            sqlx::query(
                r#"
                INSERT INTO beams (beam_id, parent_case_id, beam_path, status, progress)
                VALUES (?1, ?2, ?3, 'pending', 0.0)
                ON CONFLICT(beam_id) DO NOTHING
                "#,
            )
            .bind(&beam_id)
            .bind(case_id)
            .bind(dir.to_string_lossy().as_ref())
            .execute(&self.pool)
            .await?;
            debug!(beam_id = %beam_id, case_id, "Beam record ready");

            if let Some(beam) = self.get_beam(&beam_id).await? {
                beams.push(beam);
            }
        }

        info!(case_id, beams = beams.len(), "Case decomposed into beams");
        Ok(beams)
    }

    pub async fn get_case(&self, case_id: &str) -> Result<Option<Case>> {
        let row = sqlx::query("SELECT * FROM cases WHERE case_id = ?1")
            .bind(case_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(case_from_row).transpose()
    }

    pub async fn get_beams_for_case(&self, case_id: &str) -> Result<Vec<Beam>> {
        let rows = sqlx::query("SELECT * FROM beams WHERE parent_case_id = ?1 ORDER BY beam_id")
            .bind(case_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(beam_from_row).collect()
    }

    pub async fn get_workflow_steps(&self, case_id: &str) -> Result<Vec<WorkflowStepRecord>> {
        let rows = sqlx::query("SELECT * FROM workflow_steps WHERE case_id = ?1 ORDER BY id")
            .bind(case_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(step_from_row).collect()
    }

    pub async fn update_case_status(
        &self,
        case_id: &str,
        status: CaseStatus,
        progress: f64,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cases
            SET status = ?1, progress = ?2, error_message = COALESCE(?3, error_message),
                updated_at = datetime('now')
            WHERE case_id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(progress)
        .bind(error_message)
        .bind(case_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CaseRepository for SqliteCaseRepository {
    async fn get_beam(&self, beam_id: &str) -> Result<Option<Beam>> {
        let row = sqlx::query("SELECT * FROM beams WHERE beam_id = ?1")
            .bind(beam_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(beam_from_row).transpose()
    }

    async fn update_beam_status(
        &self,
        beam_id: &str,
        status: BeamStatus,
        error_message: Option<&str>,
        progress: Option<f64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE beams
            SET status = ?1,
                error_message = COALESCE(?2, error_message),
                progress = COALESCE(?3, progress),
                updated_at = datetime('now')
            WHERE beam_id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(progress)
        .bind(beam_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(beam_id, status = %status, "Status update for unknown beam");
        } else {
            debug!(beam_id, status = %status, "Beam status updated");
        }
        Ok(())
    }

    async fn assign_hpc_job_id_to_beam(&self, beam_id: &str, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE beams SET hpc_job_id = ?1, updated_at = datetime('now') WHERE beam_id = ?2")
            .bind(job_id)
            .bind(beam_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_workflow_step(
        &self,
        case_id: &str,
        step: WorkflowStep,
        status: &str,
        metadata: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let finished = matches!(status, "completed" | "failed");
        sqlx::query(
            r#"
            INSERT INTO workflow_steps (case_id, step, status, completed_at, metadata, error_message)
            VALUES (?1, ?2, ?3, CASE WHEN ?4 THEN datetime('now') ELSE NULL END, ?5, ?6)
            "#,
        )
        .bind(case_id)
        .bind(step.as_str())
        .bind(status)
        .bind(finished)
        .bind(metadata.map(|m| m.to_string()))
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_beam_gpu(&self, beam_id: &str, gpu_uuid: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE beams SET assigned_gpu = ?1, updated_at = datetime('now') WHERE beam_id = ?2")
            .bind(gpu_uuid)
            .bind(beam_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_beam_error(&self, beam_id: &str) -> Result<()> {
        sqlx::query("UPDATE beams SET error_message = NULL, updated_at = datetime('now') WHERE beam_id = ?1")
            .bind(beam_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_case_status_from_beams(&self, case_id: &str) -> Result<()> {
        let beams = self.get_beams_for_case(case_id).await?;
        let statuses: Vec<BeamStatus> = beams.iter().map(|b| b.status).collect();
        let status = CaseStatus::aggregate(&statuses);
        let progress = if beams.is_empty() {
            0.0
        } else {
            beams.iter().map(|b| b.progress).sum::<f64>() / beams.len() as f64
        };

        let failed = statuses.iter().filter(|s| **s == BeamStatus::Failed).count();
        let message = (failed > 0).then(|| format!("{} of {} beams failed", failed, beams.len()));

        self.update_case_status(case_id, status, progress, message.as_deref())
            .await?;
        info!(case_id, status = %status, progress, "Case status aggregated");
        Ok(())
    }
}

fn beam_from_row(row: &SqliteRow) -> Result<Beam> {
    let status: String = row.get("status");
    let beam_path: String = row.get("beam_path");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(Beam {
        beam_id: row.get("beam_id"),
        parent_case_id: row.get("parent_case_id"),
        beam_path: PathBuf::from(beam_path),
        status: status.parse()?,
        assigned_gpu: row.get("assigned_gpu"),
        hpc_job_id: row.get("hpc_job_id"),
        error_message: row.get("error_message"),
        progress: row.get("progress"),
        created_at: parse_db_timestamp(&created_at),
        updated_at: parse_db_timestamp(&updated_at),
    })
}

fn case_from_row(row: &SqliteRow) -> Result<Case> {
    let status: String = row.get("status");
    let case_path: String = row.get("case_path");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(Case {
        case_id: row.get("case_id"),
        case_path: PathBuf::from(case_path),
        status: status.parse()?,
        progress: row.get("progress"),
        error_message: row.get("error_message"),
        created_at: parse_db_timestamp(&created_at),
        updated_at: parse_db_timestamp(&updated_at),
    })
}

fn step_from_row(row: &SqliteRow) -> Result<WorkflowStepRecord> {
    let step: String = row.get("step");
    let started_at: String = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");
    let metadata: Option<String> = row.get("metadata");
    Ok(WorkflowStepRecord {
        id: row.get("id"),
        case_id: row.get("case_id"),
        step: step.parse()?,
        status: row.get("status"),
        started_at: parse_db_timestamp(&started_at),
        completed_at: completed_at.as_deref().map(parse_db_timestamp),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        error_message: row.get("error_message"),
    })
}
