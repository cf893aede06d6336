//! End-to-end beam runs against a cluster simulated on the local filesystem

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use mqi_pipeline::config::MqiConfig;
use mqi_pipeline::handlers::{ProcessCommandExecutor, RemoteEntry, RemoteTransport};
use mqi_pipeline::models::{ExecutionResult, GpuTelemetry};
use mqi_pipeline::resilience::{BackoffStrategy, CircuitBreakerConfig, RetryConfig};
use mqi_pipeline::workflow::ParameterTpsGenerator;
use mqi_pipeline::{
    BeamState, BeamStatus, CaseRepository, CaseStatus, CircuitBreaker, DatabaseManager, GpuRepository,
    GpuStatus, LocalHandler, MqiError, RemoteHandler, RetryPolicy, SqliteCaseRepository, WorkflowDeps,
    WorkflowManager,
};

/// Cluster stand-in: remote paths live under `root`, and `sbatch` "runs" the
/// simulation instantly by dropping `output.raw` next to the batch script.
struct SimulatedCluster {
    root: PathBuf,
    next_job: AtomicU32,
}

impl SimulatedCluster {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            next_job: AtomicU32::new(1000),
        }
    }

    fn local(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }
}

fn io_err(e: std::io::Error) -> MqiError {
    MqiError::Connection(e.to_string())
}

#[async_trait]
impl RemoteTransport for SimulatedCluster {
    async fn open(&self) -> mqi_pipeline::Result<()> {
        Ok(())
    }

    async fn close(&self) -> mqi_pipeline::Result<()> {
        Ok(())
    }

    async fn exec(&self, command: &str) -> mqi_pipeline::Result<ExecutionResult> {
        let mut result = ExecutionResult {
            success: true,
            ..Default::default()
        };
        if let Some(script) = command.strip_prefix("sbatch ") {
            let script = self.local(script.trim());
            let dir = script.parent().unwrap_or(&self.root);
            std::fs::write(dir.join("output.raw"), b"dose").map_err(io_err)?;
            let job = self.next_job.fetch_add(1, Ordering::SeqCst);
            result.output = format!("Submitted batch job {}\n", job);
        }
        Ok(result)
    }

    async fn mkdir_all(&self, remote_dir: &str) -> mqi_pipeline::Result<()> {
        std::fs::create_dir_all(self.local(remote_dir)).map_err(io_err)
    }

    async fn put_file(&self, local: &Path, remote_path: &str) -> mqi_pipeline::Result<()> {
        std::fs::copy(local, self.local(remote_path)).map_err(io_err)?;
        Ok(())
    }

    async fn get_file(&self, remote_path: &str, local: &Path) -> mqi_pipeline::Result<()> {
        std::fs::copy(self.local(remote_path), local).map_err(io_err)?;
        Ok(())
    }

    async fn write_file(&self, remote_path: &str, contents: &str) -> mqi_pipeline::Result<()> {
        std::fs::write(self.local(remote_path), contents).map_err(io_err)
    }

    async fn list_dir(&self, remote_dir: &str) -> mqi_pipeline::Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(self.local(remote_dir)).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let is_dir = entry.file_type().map_err(io_err)?.is_dir();
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                mode: if is_dir { 0o040755 } else { 0o100644 },
            });
        }
        Ok(entries)
    }
}

fn gpu(uuid: &str) -> GpuTelemetry {
    GpuTelemetry {
        uuid: uuid.to_string(),
        name: "NVIDIA A100".to_string(),
        memory_total: 40960,
        memory_used: 512,
        memory_free: 40448,
        temperature: 30,
        utilization: 0,
    }
}

struct Site {
    dir: TempDir,
    database: DatabaseManager,
    deps: WorkflowDeps,
    cases: SqliteCaseRepository,
    gpus: GpuRepository,
}

async fn site(beams: &[&str], gpu_ids: &[&str]) -> Site {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("mqi.db").display());
    let database = DatabaseManager::new(&url, 5, true).await.unwrap();

    std::fs::write(
        dir.path().join("convert.sh"),
        "mkdir -p \"$4\" && touch \"$4/RD.dose.dcm\"\n",
    )
    .unwrap();

    let mut config = MqiConfig::default();
    config.hpc.remote_case_path_template = "/scratch/{case_id}".to_string();
    config.paths.final_dicom_directory = dir.path().join("results/{case_id}").display().to_string();
    config.executables.python_interpreter = "sh".to_string();
    config.executables.raw_to_dcm = Some(dir.path().join("convert.sh").display().to_string());
    let config = Arc::new(config);

    let cases = SqliteCaseRepository::new(database.pool().clone());
    let case_dir = dir.path().join("cases/case-1");
    cases.create_case("case-1", &case_dir).await.unwrap();
    for beam in beams {
        let beam_dir = case_dir.join(beam);
        std::fs::create_dir_all(&beam_dir).unwrap();
        std::fs::write(beam_dir.join("RP.dcm"), b"plan").unwrap();
        std::fs::write(beam_dir.join("spots.csv"), b"1,2,3\n").unwrap();
        cases.create_beam(beam, "case-1", &beam_dir).await.unwrap();
    }

    let gpus = GpuRepository::new(database.pool().clone());
    let telemetry: Vec<GpuTelemetry> = gpu_ids.iter().map(|id| gpu(id)).collect();
    gpus.update_resources(&telemetry).await.unwrap();

    let retry = RetryPolicy::new(RetryConfig {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        strategy: BackoffStrategy::Fixed,
    });
    let cluster = Arc::new(SimulatedCluster::new(&dir.path().join("cluster")));
    let remote = RemoteHandler::new(
        cluster,
        config.hpc.clone(),
        retry.clone(),
        CircuitBreaker::new("hpc", CircuitBreakerConfig::default()),
    );
    let local = LocalHandler::new(
        Arc::new(ProcessCommandExecutor),
        config.executables.clone(),
        &config.processing,
        retry,
    );

    let deps = WorkflowDeps {
        case_repo: Arc::new(cases.clone()),
        gpu_repo: gpus.clone(),
        local: Arc::new(local),
        remote: Arc::new(remote),
        tps: Arc::new(ParameterTpsGenerator::new(&config.tps, config.hpc.clone())),
        config,
    };

    Site {
        dir,
        database,
        deps,
        cases,
        gpus,
    }
}

#[tokio::test]
async fn test_case_with_two_beams_completes_concurrently() {
    let site = site(
        &["beam-1", "beam-2"],
        &[
            "GPU-11111111-2222-3333-4444-555555555555",
            "GPU-66666666-7777-8888-9999-000000000000",
        ],
    )
    .await;

    let handles: Vec<_> = ["beam-1", "beam-2"]
        .into_iter()
        .map(|beam| {
            let manager = WorkflowManager::new(beam, site.deps.clone(), tracing::Span::none());
            tokio::spawn(manager.run())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), BeamState::Completed);
    }

    for beam in ["beam-1", "beam-2"] {
        let record = site.cases.get_beam(beam).await.unwrap().unwrap();
        assert_eq!(record.status, BeamStatus::Completed);
        assert!(record.hpc_job_id.is_some());
        let dcm = site
            .dir
            .path()
            .join("results/case-1")
            .join(beam)
            .join("dcm_output/RD.dose.dcm");
        assert!(dcm.is_file(), "missing {}", dcm.display());
    }

    let case = site.cases.get_case("case-1").await.unwrap().unwrap();
    assert_eq!(case.status, CaseStatus::Completed);
    for resource in site.gpus.get_all_gpu_resources().await.unwrap() {
        assert_eq!(resource.status, GpuStatus::Idle);
        assert_eq!(resource.assigned_case, None);
    }

    site.database.shutdown().await;
}

#[tokio::test]
async fn test_beam_without_gpu_fails_and_case_reflects_it() {
    let site = site(&["beam-1"], &[]).await;

    let state = WorkflowManager::new("beam-1", site.deps.clone(), tracing::Span::none())
        .run()
        .await;
    assert_eq!(state, BeamState::Failed);

    let beam = site.cases.get_beam("beam-1").await.unwrap().unwrap();
    assert_eq!(
        beam.error_message.as_deref(),
        Some("Error in state 'HPC Execution' for beam 'beam-1': GPU resource error: No GPU available")
    );
    let case = site.cases.get_case("case-1").await.unwrap().unwrap();
    assert_eq!(case.status, CaseStatus::Failed);

    site.database.shutdown().await;
}
