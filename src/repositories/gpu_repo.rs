//! GPU ledger persistence
//!
//! Allocation correctness rests on SQLite's write lock: the select and the
//! conditional update of [`GpuRepository::find_and_lock_available_gpu`] run in one
//! `BEGIN IMMEDIATE` transaction, so two callers can never claim the same GPU.

use crate::error::{MqiError, Result};
use crate::models::{parse_db_timestamp, GpuResource, GpuStatus, GpuTelemetry};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

fn gpu_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> MqiError {
    move |e| MqiError::GpuResource(format!("{}: {}", context, e))
}

#[derive(Debug, Clone)]
pub struct GpuRepository {
    pool: SqlitePool,
}

impl GpuRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a telemetry batch in one transaction.
    ///
    /// Only telemetry columns are refreshed; allocation state of existing rows is
    /// left alone and new rows start idle.
    pub async fn update_resources(&self, batch: &[GpuTelemetry]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(gpu_err("begin telemetry update"))?;

        for gpu in batch {
            sqlx::query(
                r#"
                INSERT INTO gpu_resources
                    (uuid, name, memory_total, memory_used, memory_free, temperature, utilization, status, last_updated)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'idle', datetime('now'))
                ON CONFLICT(uuid) DO UPDATE SET
                    name = excluded.name,
                    memory_total = excluded.memory_total,
                    memory_used = excluded.memory_used,
                    memory_free = excluded.memory_free,
                    temperature = excluded.temperature,
                    utilization = excluded.utilization,
                    last_updated = datetime('now')
                "#,
            )
            .bind(&gpu.uuid)
            .bind(&gpu.name)
            .bind(gpu.memory_total)
            .bind(gpu.memory_used)
            .bind(gpu.memory_free)
            .bind(gpu.temperature)
            .bind(gpu.utilization)
            .execute(&mut *tx)
            .await
            .map_err(gpu_err("upsert GPU telemetry"))?;
        }

        tx.commit().await.map_err(gpu_err("commit telemetry update"))?;
        debug!(count = batch.len(), "GPU telemetry stored");
        Ok(batch.len())
    }

    /// Claim the idle GPU with the most free memory (at least `min_memory_mb`).
    ///
    /// Returns `None` both when nothing qualifies and when the candidate was taken
    /// between select and update. Callers decide whether to try again.
    pub async fn find_and_lock_available_gpu(
        &self,
        case_id: &str,
        min_memory_mb: i64,
    ) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await.map_err(gpu_err("acquire connection"))?;

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(gpu_err("begin allocation"))?;

        match Self::claim_in_transaction(&mut *conn, case_id, min_memory_mb).await {
            Ok(claimed) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(gpu_err("commit allocation"))?;
                match &claimed {
                    Some(uuid) => info!(gpu = %uuid, case_id, "GPU allocated"),
                    None => debug!(case_id, min_memory_mb, "No GPU available"),
                }
                Ok(claimed)
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!(error = %rollback, "Rollback of GPU allocation failed");
                }
                Err(e)
            }
        }
    }

    async fn claim_in_transaction(
        conn: &mut SqliteConnection,
        case_id: &str,
        min_memory_mb: i64,
    ) -> Result<Option<String>> {
        let candidate: Option<String> = sqlx::query_scalar(
            r#"
            SELECT uuid FROM gpu_resources
            WHERE status = 'idle' AND memory_free >= ?1
            ORDER BY memory_free DESC
            LIMIT 1
            "#,
        )
        .bind(min_memory_mb)
        .fetch_optional(&mut *conn)
        .await
        .map_err(gpu_err("select idle GPU"))?;

        let Some(uuid) = candidate else {
            return Ok(None);
        };

        let updated = sqlx::query(
            r#"
            UPDATE gpu_resources
            SET status = 'assigned', assigned_case = ?1, last_updated = datetime('now')
            WHERE uuid = ?2 AND status = 'idle'
            "#,
        )
        .bind(case_id)
        .bind(&uuid)
        .execute(&mut *conn)
        .await
        .map_err(gpu_err("assign GPU"))?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(uuid))
    }

    pub async fn release_gpu(&self, uuid: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE gpu_resources
            SET status = 'idle', assigned_case = NULL, last_updated = datetime('now')
            WHERE uuid = ?1
            "#,
        )
        .bind(uuid)
        .execute(&self.pool)
        .await
        .map_err(gpu_err("release GPU"))?;

        if result.rows_affected() == 0 {
            warn!(gpu = %uuid, "Release requested for unknown GPU");
        } else {
            info!(gpu = %uuid, "GPU released");
        }
        Ok(())
    }

    /// Release every GPU held by `case_id`; returns how many were freed.
    pub async fn release_all_for_case(&self, case_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE gpu_resources
            SET status = 'idle', assigned_case = NULL, last_updated = datetime('now')
            WHERE assigned_case = ?1
            "#,
        )
        .bind(case_id)
        .execute(&self.pool)
        .await
        .map_err(gpu_err("release GPUs for case"))?;

        let released = result.rows_affected();
        if released > 0 {
            info!(case_id, released, "Released GPUs held by case");
        }
        Ok(released)
    }

    pub async fn get_all_gpu_resources(&self) -> Result<Vec<GpuResource>> {
        let rows = sqlx::query("SELECT * FROM gpu_resources ORDER BY uuid")
            .fetch_all(&self.pool)
            .await
            .map_err(gpu_err("list GPUs"))?;
        rows.iter().map(gpu_from_row).collect()
    }

    pub async fn get_gpu_by_uuid(&self, uuid: &str) -> Result<Option<GpuResource>> {
        let row = sqlx::query("SELECT * FROM gpu_resources WHERE uuid = ?1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(gpu_err("get GPU"))?;
        row.as_ref().map(gpu_from_row).transpose()
    }

    pub async fn get_gpus_for_case(&self, case_id: &str) -> Result<Vec<GpuResource>> {
        let rows = sqlx::query("SELECT * FROM gpu_resources WHERE assigned_case = ?1 ORDER BY uuid")
            .bind(case_id)
            .fetch_all(&self.pool)
            .await
            .map_err(gpu_err("list GPUs for case"))?;
        rows.iter().map(gpu_from_row).collect()
    }

    pub async fn get_available_gpu_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM gpu_resources WHERE status = 'idle'")
            .fetch_one(&self.pool)
            .await
            .map_err(gpu_err("count idle GPUs"))
    }
}

fn gpu_from_row(row: &SqliteRow) -> Result<GpuResource> {
    let status: String = row.get("status");
    let last_updated: String = row.get("last_updated");
    Ok(GpuResource {
        uuid: row.get("uuid"),
        name: row.get("name"),
        memory_total: row.get("memory_total"),
        memory_used: row.get("memory_used"),
        memory_free: row.get("memory_free"),
        temperature: row.get("temperature"),
        utilization: row.get("utilization"),
        status: status.parse::<GpuStatus>()?,
        assigned_case: row.get("assigned_case"),
        last_updated: parse_db_timestamp(&last_updated),
    })
}
