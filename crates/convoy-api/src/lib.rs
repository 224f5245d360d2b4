//! convoy-api: Shared data model
//!
//! Contains the target, transport option, task, result and event types
//! used by the execution layer, the executor and the CLI.

pub mod error;
pub mod events;
pub mod inventory;
pub mod options;
pub mod result;
pub mod target;
pub mod task;

pub use error::{TaskError, ValidationError};
pub use events::{EventSink, ProgressEvent};
pub use inventory::Inventory;
pub use options::{Interpreter, LoginShell, PrivateKey, TransportOptions};
pub use result::{Action, ErrorKind, Outcome, ResultError, ResultSet, TargetResult};
pub use target::{Target, TransportKind};
pub use task::{
    Implementation, InputMethod, SelectedImplementation, Task, TaskFile, TaskMetadata, envify_params,
};
