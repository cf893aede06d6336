use anyhow::Result;
use std::sync::Arc;

use crate::config::MqiConfig;
use crate::database::DatabaseManager;
use crate::handlers::{LocalHandler, OpenSshTransport, ProcessCommandExecutor, RemoteHandler};
use crate::repositories::{GpuRepository, SqliteCaseRepository};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::workflow::{ParameterTpsGenerator, WorkflowDeps};

/// Everything a command needs, wired from configuration
pub struct PipelineContext {
    pub config: Arc<MqiConfig>,
    pub database: DatabaseManager,
    pub cases: SqliteCaseRepository,
    pub gpus: GpuRepository,
    pub remote: Arc<RemoteHandler>,
    pub local: Arc<LocalHandler>,
}

impl PipelineContext {
    pub async fn open(config: MqiConfig) -> Result<Self> {
        let database = DatabaseManager::from_config(&config.database).await?;
        let executor = Arc::new(ProcessCommandExecutor);

        let transport = Arc::new(OpenSshTransport::new(executor.clone(), config.hpc.clone()));
        let remote = RemoteHandler::new(
            transport,
            config.hpc.clone(),
            RetryPolicy::new((&config.retry).into()),
            CircuitBreaker::new("hpc", (&config.circuit_breaker).into()),
        );
        let local = LocalHandler::new(
            executor,
            config.executables.clone(),
            &config.processing,
            RetryPolicy::new((&config.retry).into()),
        );

        Ok(Self {
            cases: SqliteCaseRepository::new(database.pool().clone()),
            gpus: GpuRepository::new(database.pool().clone()),
            remote: Arc::new(remote),
            local: Arc::new(local),
            config: Arc::new(config),
            database,
        })
    }

    pub fn workflow_deps(&self) -> WorkflowDeps {
        let tps = ParameterTpsGenerator::new(&self.config.tps, self.config.hpc.clone());
        WorkflowDeps {
            case_repo: Arc::new(self.cases.clone()),
            gpu_repo: self.gpus.clone(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            tps: Arc::new(tps),
            config: self.config.clone(),
        }
    }

    pub async fn close(self) {
        self.remote.disconnect().await;
        self.database.shutdown().await;
    }
}
