//! LXD instances through the `lxc` CLI

use std::path::Path;

use async_trait::async_trait;
use convoy_api::Target;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::connection::subprocess::{run_captured, spawn_child};
use crate::connection::{Connection, SpawnOptions};
use crate::error::{ConnectIssue, ExecError};
use crate::process::RemoteProcess;

/// `lxc exec` always runs as root inside the instance
const LXD_USER: &str = "root";

#[derive(Debug)]
pub struct LxdConnection {
    target: Target,
    instance: Option<String>,
}

impl LxdConnection {
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            target,
            instance: None,
        }
    }

    /// Instance reference, qualified with the remote when `service-url` names one
    fn qualified(&self, name: &str) -> String {
        match &self.target.options.service_url {
            Some(remote) => format!("{remote}:{name}"),
            None => name.to_string(),
        }
    }

    fn instance(&self) -> Result<&str, ExecError> {
        self.instance.as_deref().ok_or(ExecError::NotConnected)
    }

    fn exec_args(&self, instance: &str, command: &str, tty: bool) -> Vec<String> {
        let mode = if tty { "--mode=interactive" } else { "--mode=non-interactive" };
        vec![
            "exec".to_string(),
            instance.to_string(),
            mode.to_string(),
            "--".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]
    }
}

#[async_trait]
impl Connection for LxdConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn user(&self) -> Option<&str> {
        Some(LXD_USER)
    }

    #[instrument(skip(self), fields(target = %self.target.safe_name()))]
    async fn connect(&mut self) -> Result<(), ExecError> {
        let name = self
            .target
            .host()
            .ok_or_else(|| {
                ExecError::connect(
                    ConnectIssue::Connect,
                    format!("Target {} does not have a host", self.target.safe_name()),
                )
            })?
            .to_string();
        let connect_error = |msg: String| {
            ExecError::connect(
                ConnectIssue::Connect,
                format!("Failed to connect to {}: {msg}", self.target.safe_name()),
            )
        };

        let mut command = Command::new("lxc");
        command.arg("list");
        if let Some(remote) = &self.target.options.service_url {
            command.arg(format!("{remote}:"));
        }
        command.args(["--format", "json"]);
        let output = run_captured(command)
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        if !output.success() {
            return Err(connect_error(output.stderr.trim().to_string()));
        }

        let instances: Vec<Value> =
            serde_json::from_str(&output.stdout).map_err(|e| connect_error(e.to_string()))?;
        let found = instances
            .iter()
            .any(|item| item.get("name").and_then(Value::as_str) == Some(name.as_str()));
        if !found {
            return Err(connect_error(format!(
                "Could not find a container with name matching '{name}'"
            )));
        }

        debug!(instance = %name, "opened session");
        self.instance = Some(self.qualified(&name));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        self.instance = None;
        Ok(())
    }

    #[instrument(skip(self, command), level = "debug")]
    async fn spawn(
        &mut self,
        command: &str,
        options: SpawnOptions,
    ) -> Result<RemoteProcess, ExecError> {
        let instance = self.instance()?.to_string();
        debug!(command = %command, "executing in instance");
        let mut cli = Command::new("lxc");
        cli.args(self.exec_args(&instance, command, options.tty));
        spawn_child(cli)
    }

    async fn upload_file(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        let instance = self.instance()?.to_string();
        let mut command = Command::new("lxc");
        command
            .args(["file", "push"])
            .arg(source)
            .arg(format!("{instance}{destination}"));
        let output = run_captured(command).await?;
        if !output.success() {
            return Err(ExecError::file(
                "WRITE_ERROR",
                format!(
                    "Error writing file to container {instance}: {}",
                    output.stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    async fn download_file(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        let instance = self.instance()?.to_string();
        let mut command = Command::new("lxc");
        command
            .args(["file", "pull"])
            .arg(format!("{instance}{source}"))
            .arg(destination);
        let output = run_captured(command).await?;
        if !output.success() {
            return Err(ExecError::file(
                "READ_ERROR",
                format!(
                    "Error reading file from container {instance}: {}",
                    output.stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    fn reset_cwd(&self) -> bool {
        true
    }

    fn connection_type(&self) -> &'static str {
        "lxd"
    }
}
