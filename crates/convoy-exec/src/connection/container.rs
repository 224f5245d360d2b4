//! Docker and Podman containers through their CLIs

use std::path::Path;

use async_trait::async_trait;
use convoy_api::Target;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::connection::subprocess::{run_captured, spawn_child};
use crate::connection::{Connection, SpawnOptions};
use crate::error::{ConnectIssue, ExecError};
use crate::process::RemoteProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    #[must_use]
    pub fn program(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }

    /// Variable pointing the CLI at a non-default daemon
    fn host_env(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "DOCKER_HOST",
            ContainerRuntime::Podman => "CONTAINER_HOST",
        }
    }
}

/// A running container reached with `exec` and `cp`
#[derive(Debug)]
pub struct ContainerConnection {
    target: Target,
    runtime: ContainerRuntime,
    container_id: Option<String>,
}

impl ContainerConnection {
    #[must_use]
    pub fn new(target: Target, runtime: ContainerRuntime) -> Self {
        Self {
            target,
            runtime,
            container_id: None,
        }
    }

    fn cli(&self) -> Command {
        let mut command = Command::new(self.runtime.program());
        if let Some(url) = &self.target.options.service_url {
            command.env(self.runtime.host_env(), url);
        }
        command
    }

    fn container_id(&self) -> Result<&str, ExecError> {
        self.container_id.as_deref().ok_or(ExecError::NotConnected)
    }

    fn shell_argv(&self) -> Vec<String> {
        self.target
            .options
            .shell_command
            .as_deref()
            .and_then(|s| shell_words::split(s).ok())
            .filter(|argv| !argv.is_empty())
            .unwrap_or_else(|| vec!["sh".to_string(), "-c".to_string()])
    }

    /// Arguments for `<runtime> exec`
    fn exec_args(&self, container_id: &str, command: &str, tty: bool) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "--interactive".to_string()];
        if tty {
            args.push("--tty".to_string());
        }
        if let Some(user) = self.target.user() {
            args.push("--user".to_string());
            args.push(user.to_string());
        }
        args.push(container_id.to_string());
        args.extend(self.shell_argv());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl Connection for ContainerConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    /// User given on the target, else the container's default
    fn user(&self) -> Option<&str> {
        self.target.user()
    }

    #[instrument(skip(self), fields(target = %self.target.safe_name()))]
    async fn connect(&mut self) -> Result<(), ExecError> {
        let name = self.target.host().ok_or_else(|| {
            ExecError::connect(
                ConnectIssue::Connect,
                format!("Target {} does not have a host", self.target.safe_name()),
            )
        })?;

        let mut command = self.cli();
        command.args(["inspect", "--format", "{{.Id}} {{.State.Running}}", name]);
        let output = run_captured(command).await.map_err(|e| {
            ExecError::connect(
                ConnectIssue::Connect,
                format!("Failed to connect to {}: {e}", self.target.safe_name()),
            )
        })?;

        let line = output.stdout.trim();
        match line.split_once(' ') {
            Some((id, "true")) if output.success() => {
                debug!(container = %id, "opened session");
                self.container_id = Some(id.to_string());
                Ok(())
            }
            Some((_, _)) if output.success() => Err(ExecError::connect(
                ConnectIssue::Connect,
                format!("Container '{name}' is not running"),
            )),
            _ => Err(ExecError::connect(
                ConnectIssue::Connect,
                format!(
                    "Could not find a container with name or ID matching '{name}': {}",
                    output.stderr.trim()
                ),
            )),
        }
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        self.container_id = None;
        Ok(())
    }

    #[instrument(skip(self, command), level = "debug")]
    async fn spawn(
        &mut self,
        command: &str,
        options: SpawnOptions,
    ) -> Result<RemoteProcess, ExecError> {
        let id = self.container_id()?.to_string();
        let args = self.exec_args(&id, command, options.tty || self.target.options.tty);
        debug!(command = %command, "executing in container");

        let mut cli = self.cli();
        cli.args(args);
        spawn_child(cli)
    }

    async fn upload_file(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        let id = self.container_id()?.to_string();
        let mut command = self.cli();
        command
            .arg("cp")
            .arg(source)
            .arg(format!("{id}:{destination}"));
        let output = run_captured(command).await?;
        if !output.success() {
            return Err(ExecError::file(
                "WRITE_ERROR",
                format!(
                    "Could not copy '{}' to container: {}",
                    source.display(),
                    output.stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    async fn download_file(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        let id = self.container_id()?.to_string();
        let mut command = self.cli();
        command.arg("cp").arg(format!("{id}:{source}")).arg(destination);
        let output = run_captured(command).await?;
        if !output.success() {
            return Err(ExecError::file(
                "READ_ERROR",
                format!("Could not copy '{source}' from container: {}", output.stderr.trim()),
            ));
        }
        Ok(())
    }

    fn reset_cwd(&self) -> bool {
        true
    }

    fn connection_type(&self) -> &'static str {
        self.runtime.program()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_api::TransportOptions;

    #[test]
    fn test_exec_args() {
        let target = Target::parse("docker://app@web").unwrap();
        let conn = ContainerConnection::new(target, ContainerRuntime::Docker);
        let args = conn.exec_args("abc123", "echo hi; id", true);
        assert_eq!(
            args,
            vec![
                "exec", "--interactive", "--tty", "--user", "app", "abc123", "sh", "-c",
                "echo hi; id"
            ]
        );
    }

    #[test]
    fn test_shell_command_option() {
        let mut options = TransportOptions::default();
        options.shell_command = Some("bash -lc".to_string());
        let target = Target::parse("podman://web").unwrap().with_options(options);
        let conn = ContainerConnection::new(target, ContainerRuntime::Podman);
        let args = conn.exec_args("abc123", "whoami", false);
        assert_eq!(args, vec!["exec", "--interactive", "abc123", "bash", "-lc", "whoami"]);
        assert_eq!(conn.connection_type(), "podman");
    }

    #[tokio::test]
    async fn test_spawn_requires_connect() {
        let mut conn =
            ContainerConnection::new(Target::parse("docker://web").unwrap(), ContainerRuntime::Docker);
        let err = conn
            .spawn("true", SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NotConnected));
    }
}
