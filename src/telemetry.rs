use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()?;
    }

    tracing::info!(level = %config.log_level, json = config.json, "MQI telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span carrying a beam's identity; every log line of one workflow run sits under it
pub fn create_beam_span(beam_id: &str, case_id: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "beam_workflow",
        beam.id = beam_id,
        case.id = case_id,
        correlation.id = correlation_id,
    )
}

/// Span for the background GPU sampler
pub fn create_monitor_span(host: &str) -> tracing::Span {
    tracing::info_span!("gpu_monitor", hpc.host = host)
}
