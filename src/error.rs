//! Error taxonomy for the simulation pipeline
//!
//! Handlers translate process and transport failures into these variants so the
//! workflow only ever sees typed errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqiError>;

#[derive(Debug, Error)]
pub enum MqiError {
    /// Transport level failure talking to the cluster. Retryable.
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Not connected to HPC system")]
    NotConnected,
    /// Transient failure that is worth another attempt.
    #[error("{0}")]
    Retryable(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("GPU resource error: {0}")]
    GpuResource(String),
    #[error("Workflow error in step '{step}' for case '{case_id}': {message}")]
    Workflow {
        step: String,
        case_id: String,
        message: String,
    },
    #[error("{0}")]
    Processing(String),
    #[error("Transfer of '{path}' failed: {source}")]
    Transfer {
        path: String,
        #[source]
        source: Box<MqiError>,
    },
    #[error("Circuit breaker is open; refusing call")]
    CircuitOpen,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MqiError {
    /// Whether a retry policy may re-invoke the failed operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            MqiError::Connection(_) | MqiError::Retryable(_) | MqiError::Io(_) => true,
            MqiError::Transfer { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn workflow(step: impl Into<String>, case_id: impl Into<String>, message: impl Into<String>) -> Self {
        MqiError::Workflow {
            step: step.into(),
            case_id: case_id.into(),
            message: message.into(),
        }
    }
}
