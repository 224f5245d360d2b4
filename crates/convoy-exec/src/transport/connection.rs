//! Transport for backends that hold a live connection per operation

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use convoy_api::{Target, TargetResult, Task, TransportKind};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::command::Command;
use crate::connection::{self, Connection};
use crate::error::{ConnectIssue, ExecError};
use crate::shell::Shell;
use crate::transport::{RunOptions, Transport};

/// ssh, local, docker, podman, lxd and winrm
///
/// One instance serves every target of its kind. Each operation opens its
/// own connection, so nothing is shared between concurrent targets.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTransport {
    kind: TransportKind,
}

impl ConnectionTransport {
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self { kind }
    }

    /// Connect, run `f`, and disconnect on every exit path
    ///
    /// Connecting is bounded by the target's `connect-timeout` and
    /// disconnecting by `disconnect-timeout`. A failed disconnect is logged
    /// and does not change the outcome.
    ///
    /// # Errors
    /// Returns connection errors, or whatever `f` returns.
    pub async fn with_connection<T, F>(&self, target: &Target, f: F) -> Result<T, ExecError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut dyn Connection) -> BoxFuture<'c, Result<T, ExecError>> + Send,
    {
        let mut conn = connection::open(target)?;
        let timeout = Duration::from_secs(target.options.connect_timeout);
        match tokio::time::timeout(timeout, conn.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ExecError::connect(
                    ConnectIssue::Timeout,
                    format!(
                        "Timeout after {} seconds connecting to {}",
                        target.options.connect_timeout,
                        target.safe_name()
                    ),
                ));
            }
        }
        debug!(target = %target.safe_name(), kind = conn.connection_type(), "connected");

        let result = f(conn.as_mut()).await;

        let timeout = Duration::from_secs(target.options.disconnect_timeout);
        match tokio::time::timeout(timeout, conn.disconnect()).await {
            Ok(Ok(())) => debug!(target = %target.safe_name(), "disconnected"),
            Ok(Err(e)) => info!(target = %target.safe_name(), error = %e, "failed to disconnect"),
            Err(_) => info!(
                target = %target.safe_name(),
                timeout = ?timeout,
                "timed out disconnecting"
            ),
        }
        result
    }
}

#[async_trait]
impl Transport for ConnectionTransport {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn provided_features(&self, target: &Target) -> Vec<&'static str> {
        Shell::for_target(target).provided_features().to_vec()
    }

    #[instrument(skip_all, fields(target = %target.safe_name()))]
    async fn run_command(
        &self,
        target: &Target,
        command: &Command,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let shell = Shell::for_target(target);
        let command = command.clone();
        let options = options.clone();
        self.with_connection(target, move |conn| {
            Box::pin(async move { shell.run_command(conn, &command, &options).await })
        })
        .await
    }

    #[instrument(skip_all, fields(target = %target.safe_name()))]
    async fn run_script(
        &self,
        target: &Target,
        script: &Path,
        arguments: &[String],
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let shell = Shell::for_target(target);
        let script = script.to_path_buf();
        let arguments = arguments.to_vec();
        let options = options.clone();
        self.with_connection(target, move |conn| {
            Box::pin(async move {
                shell
                    .run_script(conn, &script, &arguments, &options)
                    .await
            })
        })
        .await
    }

    #[instrument(skip_all, fields(target = %target.safe_name(), task = %task.name))]
    async fn run_task(
        &self,
        target: &Target,
        task: &Task,
        arguments: &Map<String, Value>,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let shell = Shell::for_target(target);
        let task = task.clone();
        let arguments = arguments.clone();
        let options = options.clone();
        self.with_connection(target, move |conn| {
            Box::pin(async move { shell.run_task(conn, &task, &arguments, &options).await })
        })
        .await
    }

    #[instrument(skip_all, fields(target = %target.safe_name()))]
    async fn upload(
        &self,
        target: &Target,
        source: &Path,
        destination: &str,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let shell = Shell::for_target(target);
        let source = source.to_path_buf();
        let destination = destination.to_string();
        let options = options.clone();
        self.with_connection(target, move |conn| {
            Box::pin(async move {
                shell
                    .upload(conn, &source, &destination, &options)
                    .await
            })
        })
        .await
    }

    #[instrument(skip_all, fields(target = %target.safe_name()))]
    async fn download(
        &self,
        target: &Target,
        source: &str,
        destination: &Path,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let shell = Shell::for_target(target);
        let source = source.to_string();
        let destination = destination.to_path_buf();
        let options = options.clone();
        self.with_connection(target, move |conn| {
            Box::pin(async move {
                shell
                    .download(conn, &source, &destination, &options)
                    .await
            })
        })
        .await
    }

    async fn connected(&self, target: &Target) -> bool {
        self.with_connection(target, |_conn| Box::pin(async { Ok(()) }))
            .await
            .is_ok()
    }
}
