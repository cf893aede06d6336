//! Local and remote execution handlers

pub mod command;
pub mod local;
pub mod remote;
pub mod ssh;

pub use command::{CommandExecutor, CommandOutput, CommandSpec, ProcessCommandExecutor};
pub use local::LocalHandler;
pub use remote::RemoteHandler;
pub use ssh::{OpenSshTransport, RemoteEntry, RemoteTransport};
