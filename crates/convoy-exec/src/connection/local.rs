//! Local command execution using `tokio::process`

use std::path::Path;

use async_trait::async_trait;
use convoy_api::Target;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::connection::subprocess::spawn_child;
use crate::connection::{Connection, SpawnOptions};
use crate::error::ExecError;
use crate::process::RemoteProcess;

/// Connection to the controller itself
///
/// Runs commands through `sh -c` (or the configured `shell-command`) and
/// copies files with the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalConnection {
    target: Target,
    user: Option<String>,
}

impl LocalConnection {
    /// Create a new local connection
    #[must_use]
    pub fn new(target: Target) -> Self {
        let user = target
            .user()
            .map(str::to_string)
            .or_else(|| std::env::var("USER").ok());
        Self { target, user }
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
}

#[async_trait]
impl Connection for LocalConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    async fn connect(&mut self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        Ok(())
    }

    #[instrument(skip(self, command), level = "debug")]
    async fn spawn(
        &mut self,
        command: &str,
        _options: SpawnOptions,
    ) -> Result<RemoteProcess, ExecError> {
        debug!(command = %command, "executing local command");

        let argv = self.shell_argv();
        let mut child = Command::new(&argv[0]);
        child.args(&argv[1..]).arg(command);
        spawn_child(child)
    }

    async fn upload_file(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        tokio::fs::copy(source, destination).await.map_err(|e| {
            ExecError::file(
                "WRITE_ERROR",
                format!("Could not copy '{}' to '{destination}': {e}", source.display()),
            )
        })?;
        Ok(())
    }

    async fn upload_bytes(&mut self, contents: &[u8], destination: &str) -> Result<(), ExecError> {
        tokio::fs::write(destination, contents).await.map_err(|e| {
            ExecError::file("WRITE_ERROR", format!("Could not write '{destination}': {e}"))
        })
    }

    async fn download_file(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        tokio::fs::copy(source, destination).await.map_err(|e| {
            ExecError::file(
                "READ_ERROR",
                format!("Could not copy '{source}' to '{}': {e}", destination.display()),
            )
        })?;
        Ok(())
    }

    fn reset_cwd(&self) -> bool {
        true
    }

    fn connection_type(&self) -> &'static str {
        "local"
    }
}
