//! Live sessions to a single target
//!
//! A connection is owned by exactly one unit of work: it is connected,
//! used by a shell, and disconnected again on every exit path by the
//! transport that opened it.

use std::path::Path;

use async_trait::async_trait;
use convoy_api::{Target, TransportKind};

use crate::command::quote;
use crate::error::ExecError;
use crate::process::{ProcessEvent, RemoteProcess};

pub mod container;
pub mod keys;
pub mod local;
pub mod lxd;
pub mod ssh;
pub mod subprocess;
pub mod winrm;

pub use container::{ContainerConnection, ContainerRuntime};
pub use local::LocalConnection;
pub use lxd::LxdConnection;
pub use ssh::SshConnection;
pub use winrm::WinrmConnection;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Allocate a pseudo-terminal where the connection supports one
    pub tty: bool,
}

#[async_trait]
pub trait Connection: Send {
    /// Target this connection reaches
    fn target(&self) -> &Target;

    /// User the connection is logged in as, when known
    fn user(&self) -> Option<&str>;

    async fn connect(&mut self) -> Result<(), ExecError>;

    async fn disconnect(&mut self) -> Result<(), ExecError>;

    /// Start a command given as shell text
    async fn spawn(&mut self, command: &str, options: SpawnOptions)
    -> Result<RemoteProcess, ExecError>;

    /// Copy a local file to the target
    async fn upload_file(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        let contents = tokio::fs::read(source).await.map_err(|e| {
            ExecError::file(
                "WRITE_ERROR",
                format!("Could not read '{}': {e}", source.display()),
            )
        })?;
        self.upload_bytes(&contents, destination).await
    }

    /// Write bytes to a file on the target
    ///
    /// The default streams the bytes through `cat` on the remote side.
    async fn upload_bytes(&mut self, contents: &[u8], destination: &str) -> Result<(), ExecError> {
        let command = format!("cat > {}", quote(destination));
        let mut process = self.spawn(&command, SpawnOptions::default()).await?;
        process.write_stdin(contents.to_vec()).await?;
        let output = process.wait().await;
        if !output.success() {
            return Err(ExecError::file(
                "WRITE_ERROR",
                format!("Could not write '{destination}': {}", output.stderr.trim()),
            ));
        }
        Ok(())
    }

    /// Copy a file from the target to a local path
    ///
    /// The default reads the file through `cat` on the remote side.
    async fn download_file(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        let command = format!("cat {}", quote(source));
        let mut process = self.spawn(&command, SpawnOptions::default()).await?;
        process.close_stdin().await;

        let mut contents = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = -1;
        while let Some(event) = process.next_event().await {
            match event {
                ProcessEvent::Stdout(data) => contents.extend_from_slice(&data),
                ProcessEvent::Stderr(data) => stderr.extend_from_slice(&data),
                ProcessEvent::Exit(code) => exit_code = code,
            }
        }
        if exit_code != 0 {
            return Err(ExecError::file(
                "READ_ERROR",
                format!(
                    "Could not read '{source}': {}",
                    String::from_utf8_lossy(&stderr).trim()
                ),
            ));
        }
        tokio::fs::write(destination, &contents)
            .await
            .map_err(|e| {
                ExecError::file(
                    "WRITE_ERROR",
                    format!("Could not write '{}': {e}", destination.display()),
                )
            })
    }

    /// Whether escalated commands should start in the run-as user's home
    fn reset_cwd(&self) -> bool {
        false
    }

    fn connection_type(&self) -> &'static str;
}

/// Open an unconnected session of the right kind for a target
///
/// # Errors
/// Returns `ExecError::Unsupported` for transports that do not use
/// connections (orchestrator, remote).
pub fn open(target: &Target) -> Result<Box<dyn Connection>, ExecError> {
    match target.transport {
        TransportKind::Ssh => Ok(Box::new(SshConnection::new(target.clone()))),
        TransportKind::Local => Ok(Box::new(LocalConnection::new(target.clone()))),
        TransportKind::Docker => Ok(Box::new(ContainerConnection::new(
            target.clone(),
            ContainerRuntime::Docker,
        ))),
        TransportKind::Podman => Ok(Box::new(ContainerConnection::new(
            target.clone(),
            ContainerRuntime::Podman,
        ))),
        TransportKind::Lxd => Ok(Box::new(LxdConnection::new(target.clone()))),
        TransportKind::Winrm => Ok(Box::new(WinrmConnection::new(target.clone()))),
        TransportKind::Orch | TransportKind::Remote => Err(ExecError::Unsupported {
            transport: target.transport.name(),
            operation: "connections",
        }),
    }
}
