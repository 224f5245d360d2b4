//! Fan-out of one operation across many targets
//!
//! Targets are grouped by transport, each transport splits its group into
//! batches, and every batch becomes one unit of work on a pool bounded by
//! the context's concurrency. Units that fail in any way still yield one
//! failure result per target, and the final [`ResultSet`] is in the order
//! the targets were given.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use convoy_api::{
    ErrorKind, ProgressEvent, ResultError, ResultSet, Target, TargetResult, Task, TransportKind,
};
use convoy_exec::{Command, Operation, RunOptions, Transport};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span};

use crate::context::Context;
use crate::registry::TransportRegistry;

/// One unit of work: a batch of targets and where their results go
struct Unit {
    indices: Vec<usize>,
    targets: Vec<Target>,
    operation: Operation,
    transport: Arc<dyn Transport>,
}

pub struct Executor {
    registry: TransportRegistry,
    context: Context,
}

impl Executor {
    #[must_use]
    pub fn new(registry: TransportRegistry, context: Context) -> Self {
        Self { registry, context }
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub async fn run_command(
        &self,
        targets: &[Target],
        command: impl Into<Command>,
        options: &RunOptions,
    ) -> ResultSet {
        let operation = Operation::Command {
            command: command.into(),
        };
        self.execute(targets, operation, options).await
    }

    pub async fn run_script(
        &self,
        targets: &[Target],
        script: &Path,
        arguments: &[String],
        options: &RunOptions,
    ) -> ResultSet {
        let operation = Operation::Script {
            script: script.to_path_buf(),
            arguments: arguments.to_vec(),
        };
        self.execute(targets, operation, options).await
    }

    pub async fn run_task(
        &self,
        targets: &[Target],
        task: &Task,
        arguments: &Map<String, Value>,
        options: &RunOptions,
    ) -> ResultSet {
        debug!(task = %task.name, arguments = ?arguments, "task arguments");
        let operation = Operation::Task {
            task: task.clone(),
            arguments: arguments.clone(),
        };
        self.execute(targets, operation, options).await
    }

    pub async fn upload(
        &self,
        targets: &[Target],
        source: &Path,
        destination: &str,
        options: &RunOptions,
    ) -> ResultSet {
        let operation = Operation::Upload {
            source: source.to_path_buf(),
            destination: destination.to_string(),
        };
        self.execute(targets, operation, options).await
    }

    /// Fetch `source` from every target into `destination/<target>/`
    pub async fn download(
        &self,
        targets: &[Target],
        source: &str,
        destination: &Path,
        options: &RunOptions,
    ) -> ResultSet {
        let operation = Operation::Download {
            source: source.to_string(),
            destination: destination.to_path_buf(),
        };
        self.execute(targets, operation, options).await
    }

    /// Run `operation` on every target, one result per target in order
    pub async fn execute(
        &self,
        targets: &[Target],
        operation: Operation,
        options: &RunOptions,
    ) -> ResultSet {
        let action = operation.action();
        let object = operation.object();
        let names: Vec<String> = targets.iter().map(Target::safe_name).collect();
        info!(
            action = %action,
            targets = targets.len(),
            "Starting {action} '{object}' on {names:?}"
        );
        let mut slots: Vec<Option<TargetResult>> = vec![None; targets.len()];

        let units = self.plan(targets, &operation, &mut slots);
        let semaphore = Arc::new(Semaphore::new(self.context.concurrency()));
        let mut running = JoinSet::new();

        for unit in units {
            let semaphore = Arc::clone(&semaphore);
            let options = options.clone();
            let context = self.context.clone();
            let span = info_span!(
                parent: self.context.span(),
                "unit",
                transport = unit.transport.name(),
                targets = unit.targets.len()
            );

            running.spawn(
                async move {
                    let results = match semaphore.acquire_owned().await {
                        Ok(_permit) => run_unit(&unit, &options, &context).await,
                        Err(e) => failures(&unit, &format!("worker pool closed: {e}"), &context),
                    };
                    (unit.indices, results)
                }
                .instrument(span),
            );
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((indices, results)) => {
                    for (index, result) in indices.into_iter().zip(results) {
                        slots[index] = Some(result);
                    }
                }
                Err(e) => error!(error = %e, "worker unit aborted"),
            }
        }

        // slots left empty belong to units that panicked
        let results: Vec<TargetResult> = slots
            .into_iter()
            .zip(targets)
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| {
                    let result = TargetResult::failure(
                        target.safe_name(),
                        action,
                        Some(object.clone()),
                        exception("operation aborted before producing a result"),
                    );
                    self.context.emit(ProgressEvent::node_result(result.clone()));
                    result
                })
            })
            .collect();

        let set = ResultSet::new(results);
        let failed = set.error_set().len();
        info!(
            action = %action,
            targets = set.len(),
            failed,
            "Ran {action} '{object}' on {} targets with {failed} failures",
            set.len()
        );
        set
    }

    /// Split targets into units; targets with no transport fail right away
    fn plan(
        &self,
        targets: &[Target],
        operation: &Operation,
        slots: &mut [Option<TargetResult>],
    ) -> Vec<Unit> {
        let mut by_kind: Vec<(TransportKind, Vec<(usize, Target)>)> = Vec::new();
        for (index, target) in targets.iter().enumerate() {
            match by_kind.iter_mut().find(|(kind, _)| *kind == target.transport) {
                Some((_, group)) => group.push((index, target.clone())),
                None => by_kind.push((target.transport, vec![(index, target.clone())])),
            }
        }

        let mut units = Vec::new();
        for (kind, group) in by_kind {
            let Some(transport) = self.registry.get(kind) else {
                for (index, target) in group {
                    let error = ResultError::new(
                        ErrorKind::UnsupportedOperation,
                        format!("no transport registered for '{kind}'"),
                    );
                    let result = TargetResult::failure(
                        target.safe_name(),
                        operation.action(),
                        Some(operation.object()),
                        error,
                    );
                    self.context
                        .emit(ProgressEvent::node_start(target.safe_name(), operation.action()));
                    self.context.emit(ProgressEvent::node_result(result.clone()));
                    slots[index] = Some(result);
                }
                continue;
            };

            // Each download lands in its own directory, so targets never share a unit
            if let Operation::Download {
                source,
                destination,
            } = operation
            {
                for (index, target) in group {
                    units.push(Unit {
                        indices: vec![index],
                        operation: Operation::Download {
                            source: source.clone(),
                            destination: download_dir(destination, &target),
                        },
                        targets: vec![target],
                        transport: Arc::clone(&transport),
                    });
                }
                continue;
            }

            let mut positions: HashMap<String, VecDeque<usize>> = HashMap::new();
            let mut batch_targets = Vec::with_capacity(group.len());
            for (index, target) in group {
                positions.entry(target.name.clone()).or_default().push_back(index);
                batch_targets.push(target);
            }
            for batch in transport.batches(batch_targets) {
                let indices = batch
                    .iter()
                    .filter_map(|t| positions.get_mut(&t.name).and_then(VecDeque::pop_front))
                    .collect();
                units.push(Unit {
                    indices,
                    targets: batch,
                    operation: operation.clone(),
                    transport: Arc::clone(&transport),
                });
            }
        }
        units
    }
}

async fn run_unit(unit: &Unit, options: &RunOptions, context: &Context) -> Vec<TargetResult> {
    let mut results = unit
        .transport
        .batch_execute(&unit.targets, &unit.operation, options, context.events())
        .await;

    if results.len() < unit.targets.len() {
        error!(
            transport = unit.transport.name(),
            expected = unit.targets.len(),
            got = results.len(),
            "transport returned too few results"
        );
        for target in &unit.targets[results.len()..] {
            let result = missing(target, &unit.operation);
            context.emit(ProgressEvent::node_result(result.clone()));
            results.push(result);
        }
    }
    results
}

fn failures(unit: &Unit, msg: &str, context: &Context) -> Vec<TargetResult> {
    unit.targets
        .iter()
        .map(|target| {
            let result = TargetResult::failure(
                target.safe_name(),
                unit.operation.action(),
                Some(unit.operation.object()),
                exception(msg),
            );
            context.emit(ProgressEvent::node_result(result.clone()));
            result
        })
        .collect()
}

fn missing(target: &Target, operation: &Operation) -> TargetResult {
    TargetResult::failure(
        target.safe_name(),
        operation.action(),
        Some(operation.object()),
        ResultError::new(
            ErrorKind::MissingResult,
            format!("No result was returned for {}", target.safe_name()),
        ),
    )
}

fn exception(msg: &str) -> ResultError {
    ResultError::new(ErrorKind::ExceptionFailure, msg).with_issue_code("EXCEPTION")
}

/// `<destination>/<target name>` with path separators and colons replaced
fn download_dir(destination: &Path, target: &Target) -> PathBuf {
    let name: String = target
        .safe_name()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    destination.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_dir_sanitized() {
        let target = Target::parse("ssh://admin@web1:2222").unwrap();
        assert_eq!(
            download_dir(Path::new("/downloads"), &target),
            PathBuf::from("/downloads/ssh___admin@web1_2222")
        );

        let target = Target::parse("docker://app").unwrap().with_name("app");
        assert_eq!(
            download_dir(Path::new("/downloads"), &target),
            PathBuf::from("/downloads/app")
        );
    }
}
