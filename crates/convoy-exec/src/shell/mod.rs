//! Shells turn operations into command text for a connection
//!
//! POSIX targets get [`BashShell`], which handles sudo escalation and
//! temp directory staging. WinRM targets and targets whose login shell is
//! PowerShell get [`PowershellShell`].

pub mod bash;
pub mod escalate;
pub mod powershell;
pub mod snippets;
pub mod tmpdir;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};

use convoy_api::{LoginShell, Target, TargetResult, Task, TransportKind};
use serde_json::{Map, Value};

use crate::command::Command;
use crate::connection::Connection;
use crate::error::ExecError;
use crate::transport::RunOptions;

pub use bash::BashShell;
pub use escalate::{Escalation, EscalationAction, EscalationState};
pub use powershell::PowershellShell;
pub use tmpdir::RemoteTempDir;

#[derive(Debug, Clone)]
pub enum Shell {
    Bash(BashShell),
    Powershell(PowershellShell),
}

impl Shell {
    #[must_use]
    pub fn for_target(target: &Target) -> Self {
        if target.transport == TransportKind::Winrm
            || target.options.login_shell == LoginShell::Powershell
        {
            Shell::Powershell(PowershellShell::new(target.clone()))
        } else {
            Shell::Bash(BashShell::new(target.clone()))
        }
    }

    /// Features this shell adds for task implementation selection
    #[must_use]
    pub fn provided_features(&self) -> &'static [&'static str] {
        match self {
            Shell::Bash(_) => &["shell"],
            Shell::Powershell(_) => &["powershell"],
        }
    }

    pub async fn run_command(
        &self,
        conn: &mut dyn Connection,
        command: &Command,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        match self {
            Shell::Bash(shell) => shell.run_command(conn, command, options).await,
            Shell::Powershell(shell) => {
                shell
                    .run_command(conn, &command.to_string(), options)
                    .await
            }
        }
    }

    pub async fn run_script(
        &self,
        conn: &mut dyn Connection,
        script: &Path,
        arguments: &[String],
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        match self {
            Shell::Bash(shell) => shell.run_script(conn, script, arguments, options).await,
            Shell::Powershell(shell) => shell.run_script(conn, script, arguments, options).await,
        }
    }

    pub async fn run_task(
        &self,
        conn: &mut dyn Connection,
        task: &Task,
        arguments: &Map<String, Value>,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        match self {
            Shell::Bash(shell) => shell.run_task(conn, task, arguments, options).await,
            Shell::Powershell(shell) => shell.run_task(conn, task, arguments, options).await,
        }
    }

    pub async fn upload(
        &self,
        conn: &mut dyn Connection,
        source: &Path,
        destination: &str,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        match self {
            Shell::Bash(shell) => shell.upload(conn, source, destination, options).await,
            Shell::Powershell(shell) => shell.upload(conn, source, destination, options).await,
        }
    }

    pub async fn download(
        &self,
        conn: &mut dyn Connection,
        source: &str,
        destination: &Path,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        match self {
            Shell::Bash(shell) => shell.download(conn, source, destination, options).await,
            Shell::Powershell(shell) => shell.download(conn, source, destination, options).await,
        }
    }
}

pub(crate) fn basename(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Relative subdirectories and files under a local directory, sorted
pub(crate) fn local_tree(root: &Path) -> std::io::Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut queue = vec![PathBuf::new()];
    while let Some(relative) = queue.pop() {
        for entry in std::fs::read_dir(root.join(&relative))? {
            let entry = entry?;
            let path = relative.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                dirs.push(path.clone());
                queue.push(path);
            } else {
                files.push(path);
            }
        }
    }
    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_api::TransportOptions;

    #[test]
    fn test_shell_selection() {
        let ssh = Target::parse("ssh://web1").unwrap();
        assert!(matches!(Shell::for_target(&ssh), Shell::Bash(_)));
        assert_eq!(Shell::for_target(&ssh).provided_features(), &["shell"]);

        let winrm = Target::parse("winrm://win1").unwrap();
        assert!(matches!(Shell::for_target(&winrm), Shell::Powershell(_)));

        let mut options = TransportOptions::default();
        options.login_shell = LoginShell::Powershell;
        let win_ssh = Target::parse("ssh://win2").unwrap().with_options(options);
        assert_eq!(Shell::for_target(&win_ssh).provided_features(), &["powershell"]);
    }

    #[test]
    fn test_local_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top.txt"), "").unwrap();
        std::fs::write(dir.path().join("a/b/deep.txt"), "").unwrap();

        let (dirs, files) = local_tree(dir.path()).unwrap();
        assert_eq!(dirs, vec![PathBuf::from("a"), PathBuf::from("a/b")]);
        assert_eq!(files, vec![PathBuf::from("a/b/deep.txt"), PathBuf::from("top.txt")]);
    }
}
