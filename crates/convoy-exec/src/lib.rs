//! convoy-exec: Remote execution layer
//!
//! Connections to targets (SSH, local processes, containers, WinRM), the
//! shells that build command lines for them, sudo escalation, and the
//! transports that tie a connection and a shell into one operation.

pub mod command;
pub mod connection;
pub mod error;
pub mod output;
pub mod process;
pub mod shell;
pub mod transport;

pub use command::Command;
pub use connection::{Connection, SpawnOptions};
pub use error::ExecError;
pub use output::{CommandOutput, Output};
pub use process::{ProcessEvent, RemoteProcess, StdinMsg};
pub use shell::Shell;
pub use transport::{ConnectionTransport, Operation, OrchTransport, RunOptions, Transport, failure_result};
