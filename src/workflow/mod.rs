//! Per-beam workflow: state machine, hand-off context and the driver

pub mod context;
pub mod manager;
pub mod states;
pub mod tps;

pub use context::BeamContext;
pub use manager::{WorkflowDeps, WorkflowManager};
pub use states::{BeamState, StepOutcome};
pub use tps::{ParameterTpsGenerator, TpsGenerator};
