// MQI pipeline library - beam workflow, GPU ledger and HPC execution
// Exposes the core components for the CLI and integration tests

pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod gpu;
pub mod handlers;
pub mod models;
pub mod observability;
pub mod repositories;
pub mod resilience;
pub mod shutdown;
pub mod telemetry;
pub mod workflow;

#[cfg(test)]
pub(crate) mod mocks;

// Re-export key types for easy access
pub use config::MqiConfig;
pub use database::DatabaseManager;
pub use error::{MqiError, Result};
pub use gpu::{GpuMonitor, GpuSampler};
pub use handlers::{LocalHandler, RemoteHandler};
pub use models::{Beam, BeamStatus, Case, CaseStatus, GpuResource, GpuStatus, JobStatus};
pub use repositories::{CaseRepository, GpuRepository, SqliteCaseRepository};
pub use resilience::{CircuitBreaker, RetryPolicy};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_beam_span, create_monitor_span, generate_correlation_id, init_telemetry};
pub use workflow::{BeamState, WorkflowDeps, WorkflowManager};
