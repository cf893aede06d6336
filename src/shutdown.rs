use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::database::DatabaseManager;
use crate::gpu::GpuMonitor;
use crate::handlers::RemoteHandler;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DATABASE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Graceful shutdown coordinator for the pipeline's long-lived services
#[derive(Default)]
pub struct ShutdownCoordinator {
    monitor: Option<Arc<GpuMonitor>>,
    remote: Option<Arc<RemoteHandler>>,
    database: Option<DatabaseManager>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_monitor(mut self, monitor: Arc<GpuMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_remote(mut self, remote: Arc<RemoteHandler>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_database(mut self, database: DatabaseManager) -> Self {
        self.database = Some(database);
        self
    }

    /// Wait for SIGINT, then shut everything down.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        info!("Shutdown coordinator ready - will shut down gracefully on Ctrl-C");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        self.shutdown_all_services().await
    }

    /// Stop the monitor, close the HPC session, then close the database.
    ///
    /// Each step is bounded; a step that overruns is logged and skipped.
    pub async fn shutdown_all_services(self) -> Result<()> {
        info!("Initiating graceful shutdown of all services...");

        if let Some(monitor) = &self.monitor {
            if !monitor.stop().await {
                warn!("GPU monitor had to be aborted");
            }
        }

        if let Some(remote) = &self.remote {
            if timeout(DISCONNECT_TIMEOUT, remote.disconnect()).await.is_err() {
                warn!("Timeout waiting for HPC session to close");
            }
        }

        if let Some(database) = &self.database {
            if timeout(DATABASE_CLOSE_TIMEOUT, database.shutdown()).await.is_err() {
                warn!("Timeout waiting for database pool to close");
            }
        }

        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}
