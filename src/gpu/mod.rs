pub mod monitor;
pub mod telemetry;

pub use monitor::{GpuMonitor, GpuSampler};
pub use telemetry::parse_telemetry;
