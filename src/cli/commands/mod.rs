pub mod add_beam;
pub mod add_case;
pub mod gpus;
pub mod init_db;
pub mod monitor;
pub mod run;

pub use add_beam::AddBeamCommand;
pub use add_case::AddCaseCommand;
pub use gpus::GpusCommand;
pub use init_db::InitDbCommand;
pub use monitor::MonitorCommand;
pub use run::{RunBeamCommand, RunCaseCommand};
