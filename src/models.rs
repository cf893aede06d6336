//! Domain records shared by the repositories, handlers and workflow

use crate::error::MqiError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Implements `as_str`, `Display` and `FromStr` for a snake_case status enum.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = MqiError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(MqiError::Validation(format!(
                        "unknown {} value '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeamStatus {
    Pending,
    Preprocessing,
    Uploading,
    HpcQueued,
    HpcRunning,
    Downloading,
    Postprocessing,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(BeamStatus {
    Pending => "pending",
    Preprocessing => "preprocessing",
    Uploading => "uploading",
    HpcQueued => "hpc_queued",
    HpcRunning => "hpc_running",
    Downloading => "downloading",
    Postprocessing => "postprocessing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl BeamStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BeamStatus::Completed | BeamStatus::Failed | BeamStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pending,
    Preprocessing,
    Processing,
    Postprocessing,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(CaseStatus {
    Pending => "pending",
    Preprocessing => "preprocessing",
    Processing => "processing",
    Postprocessing => "postprocessing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl CaseStatus {
    /// Case status implied by the statuses of its beams.
    pub fn aggregate(beams: &[BeamStatus]) -> CaseStatus {
        if beams.is_empty() {
            return CaseStatus::Pending;
        }
        if beams.iter().all(|s| *s == BeamStatus::Completed) {
            return CaseStatus::Completed;
        }
        if beams.iter().all(BeamStatus::is_terminal) {
            if beams.iter().any(|s| *s == BeamStatus::Failed) {
                return CaseStatus::Failed;
            }
            return CaseStatus::Cancelled;
        }
        CaseStatus::Processing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuStatus {
    Idle,
    Busy,
    Assigned,
    Unavailable,
}

text_enum!(GpuStatus {
    Idle => "idle",
    Busy => "busy",
    Assigned => "assigned",
    Unavailable => "unavailable",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Pending,
    Preprocessing,
    TpsGeneration,
    FileUpload,
    HpcSubmission,
    SimulationRunning,
    Download,
    Postprocessing,
    Completed,
    Failed,
}

text_enum!(WorkflowStep {
    Pending => "pending",
    Preprocessing => "preprocessing",
    TpsGeneration => "tps_generation",
    FileUpload => "file_upload",
    HpcSubmission => "hpc_submission",
    SimulationRunning => "simulation_running",
    Download => "download",
    Postprocessing => "postprocessing",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    pub case_path: PathBuf,
    pub status: CaseStatus,
    pub progress: f64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One treatment beam; the unit of simulation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beam {
    pub beam_id: String,
    pub parent_case_id: String,
    pub beam_path: PathBuf,
    pub status: BeamStatus,
    pub assigned_gpu: Option<String>,
    pub hpc_job_id: Option<String>,
    pub error_message: Option<String>,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// GPU ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuResource {
    pub uuid: String,
    pub name: String,
    pub memory_total: i64,
    pub memory_used: i64,
    pub memory_free: i64,
    pub temperature: i64,
    pub utilization: i64,
    pub status: GpuStatus,
    pub assigned_case: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// One parsed telemetry sample, before it is written to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuTelemetry {
    pub uuid: String,
    pub name: String,
    pub memory_total: i64,
    pub memory_used: i64,
    pub memory_free: i64,
    pub temperature: i64,
    pub utilization: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepRecord {
    pub id: i64,
    pub case_id: String,
    pub step: WorkflowStep,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub return_code: i32,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>, return_code: i32) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
            return_code,
        }
    }

    /// Best available description of why the command failed.
    pub fn failure_reason(&self) -> String {
        if !self.error.trim().is_empty() {
            self.error.trim().to_string()
        } else if !self.output.trim().is_empty() {
            self.output.trim().to_string()
        } else {
            format!("exit code {}", self.return_code)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    pub success: bool,
    pub job_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub job_id: String,
    pub state: String,
    pub queued: bool,
    pub running: bool,
    pub completed: bool,
    pub failed: bool,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl JobStatus {
    /// Classify a Slurm state string such as `RUNNING` or `COMPLETED`.
    pub fn from_slurm_state(job_id: &str, raw_state: &str) -> Self {
        // sacct can report "CANCELLED by 1234"
        let state = raw_state
            .split_whitespace()
            .next()
            .unwrap_or("UNKNOWN")
            .trim_end_matches('+')
            .to_uppercase();

        let queued = matches!(state.as_str(), "PENDING" | "CONFIGURING" | "REQUEUED" | "SUSPENDED");
        let running = matches!(state.as_str(), "RUNNING" | "COMPLETING");
        let completed = state == "COMPLETED";
        let failed = matches!(
            state.as_str(),
            "FAILED"
                | "CANCELLED"
                | "TIMEOUT"
                | "NODE_FAIL"
                | "OUT_OF_MEMORY"
                | "PREEMPTED"
                | "BOOT_FAIL"
                | "DEADLINE"
        );

        let error = if failed {
            Some(format!("Job {} finished with state {}", job_id, state))
        } else {
            None
        };

        Self {
            job_id: job_id.to_string(),
            state,
            queued,
            running,
            completed,
            failed,
            timed_out: false,
            error,
        }
    }

    pub fn timed_out(job_id: &str, last_state: &str, waited_secs: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: last_state.to_string(),
            queued: false,
            running: false,
            completed: false,
            failed: false,
            timed_out: true,
            error: Some(format!("Job {} did not finish within {}s", job_id, waited_secs)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.queued || self.running
    }
}

/// Parse a sqlite `datetime('now')` value.
pub(crate) fn parse_db_timestamp(raw: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trip() {
        assert_eq!(BeamStatus::HpcQueued.as_str(), "hpc_queued");
        assert_eq!("hpc_running".parse::<BeamStatus>().unwrap(), BeamStatus::HpcRunning);
        assert_eq!("assigned".parse::<GpuStatus>().unwrap(), GpuStatus::Assigned);
        assert!("exploded".parse::<BeamStatus>().is_err());
    }

    #[test]
    fn test_case_status_aggregation() {
        use BeamStatus::*;
        assert_eq!(CaseStatus::aggregate(&[Completed, Completed]), CaseStatus::Completed);
        assert_eq!(CaseStatus::aggregate(&[Completed, Failed]), CaseStatus::Failed);
        assert_eq!(CaseStatus::aggregate(&[Completed, HpcRunning]), CaseStatus::Processing);
        assert_eq!(CaseStatus::aggregate(&[]), CaseStatus::Pending);
    }

    #[test]
    fn test_slurm_state_classification() {
        let running = JobStatus::from_slurm_state("42", "RUNNING");
        assert!(running.running && running.is_active());

        let done = JobStatus::from_slurm_state("42", "COMPLETED");
        assert!(done.completed && !done.failed && done.error.is_none());

        let cancelled = JobStatus::from_slurm_state("42", "CANCELLED by 1001");
        assert!(cancelled.failed);
        assert_eq!(cancelled.state, "CANCELLED");
        assert!(cancelled.error.unwrap().contains("CANCELLED"));
    }

    #[test]
    fn test_db_timestamp_parsing() {
        let ts = parse_db_timestamp("2024-03-01 12:30:45");
        assert_eq!(ts.to_rfc3339(), "2024-03-01T12:30:45+00:00");
    }
}
