//! Transports: per-backend entry points for the five operations
//!
//! A [`Transport`] turns an [`Operation`] against a target into a
//! [`TargetResult`]. Connection-based backends share
//! [`ConnectionTransport`]; the orchestrator backend submits jobs over
//! HTTP and batches targets per server.

pub mod connection;
pub mod orch;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use convoy_api::{Action, EventSink, ProgressEvent, Target, TargetResult, Task};
use serde_json::{Map, Value};
use tracing::info;

use crate::command::Command;
use crate::error::ExecError;

pub use connection::ConnectionTransport;
pub use orch::OrchTransport;

/// One logical operation, applied to every target of a fan-out
#[derive(Debug, Clone)]
pub enum Operation {
    Command {
        command: Command,
    },
    Script {
        script: PathBuf,
        arguments: Vec<String>,
    },
    Task {
        task: Task,
        arguments: Map<String, Value>,
    },
    Upload {
        source: PathBuf,
        destination: String,
    },
    /// Fetch `source` into `destination/<file name>`
    Download {
        source: String,
        destination: PathBuf,
    },
}

impl Operation {
    #[must_use]
    pub fn action(&self) -> Action {
        match self {
            Operation::Command { .. } => Action::Command,
            Operation::Script { .. } => Action::Script,
            Operation::Task { .. } => Action::Task,
            Operation::Upload { .. } => Action::Upload,
            Operation::Download { .. } => Action::Download,
        }
    }

    /// What the operation acts on, as shown in results and logs
    #[must_use]
    pub fn object(&self) -> String {
        match self {
            Operation::Command { command } => command.to_string(),
            Operation::Script { script, .. } => script.display().to_string(),
            Operation::Task { task, .. } => task.name.clone(),
            Operation::Upload { source, .. } => source.display().to_string(),
            Operation::Download { source, .. } => source.clone(),
        }
    }
}

/// Per-call options layered over the target's own
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the target's `run-as`
    pub run_as: Option<String>,
    /// Exported before commands and scripts
    pub env_vars: BTreeMap<String, String>,
    /// Description attached to orchestrator jobs
    pub description: Option<String>,
}

impl RunOptions {
    #[must_use]
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

pub(crate) fn emit(events: Option<&EventSink>, event: ProgressEvent) {
    if let Some(sink) = events {
        sink(&event);
    }
}

/// Failure result for an error that escaped an operation
#[must_use]
pub fn failure_result(target: &Target, operation: &Operation, error: &ExecError) -> TargetResult {
    TargetResult::failure(
        target.safe_name(),
        operation.action(),
        Some(operation.object()),
        error.to_result_error(),
    )
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name as used in target URIs
    fn name(&self) -> &'static str;

    /// Features this transport adds for task implementation selection
    fn provided_features(&self, _target: &Target) -> Vec<&'static str> {
        Vec::new()
    }

    async fn run_command(
        &self,
        target: &Target,
        command: &Command,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError>;

    async fn run_script(
        &self,
        target: &Target,
        script: &std::path::Path,
        arguments: &[String],
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError>;

    async fn run_task(
        &self,
        target: &Target,
        task: &Task,
        arguments: &Map<String, Value>,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError>;

    async fn upload(
        &self,
        target: &Target,
        source: &std::path::Path,
        destination: &str,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError>;

    async fn download(
        &self,
        _target: &Target,
        _source: &str,
        _destination: &std::path::Path,
        _options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        Err(ExecError::Unsupported {
            transport: self.name(),
            operation: "download",
        })
    }

    /// Whether the target can be reached right now
    async fn connected(&self, target: &Target) -> bool;

    /// Dispatch one operation against one target
    async fn execute(
        &self,
        target: &Target,
        operation: &Operation,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        match operation {
            Operation::Command { command } => self.run_command(target, command, options).await,
            Operation::Script { script, arguments } => {
                self.run_script(target, script, arguments, options).await
            }
            Operation::Task { task, arguments } => {
                self.run_task(target, task, arguments, options).await
            }
            Operation::Upload {
                source,
                destination,
            } => self.upload(target, source, destination, options).await,
            Operation::Download {
                source,
                destination,
            } => self.download(target, source, destination, options).await,
        }
    }

    /// Group targets that can share one submission
    ///
    /// The default puts every target in its own batch.
    fn batches(&self, targets: Vec<Target>) -> Vec<Vec<Target>> {
        targets.into_iter().map(|t| vec![t]).collect()
    }

    /// Run an operation on a batch, producing one result per target
    ///
    /// Errors never escape: each is turned into that target's failure
    /// result. Progress events are sent for every target.
    async fn batch_execute(
        &self,
        targets: &[Target],
        operation: &Operation,
        options: &RunOptions,
        events: Option<&EventSink>,
    ) -> Vec<TargetResult> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            emit(
                events,
                ProgressEvent::node_start(target.safe_name(), operation.action()),
            );
            let result = match self.execute(target, operation, options).await {
                Ok(result) => result,
                Err(e) => {
                    info!(target = %target.safe_name(), error = %e, "operation failed");
                    failure_result(target, operation, &e)
                }
            };
            emit(events, ProgressEvent::node_result(result.clone()));
            results.push(result);
        }
        results
    }
}
