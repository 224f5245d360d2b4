//! Scoped temporary directories on POSIX targets

use std::fmt;

use tracing::{debug, warn};

use crate::command::Command;
use crate::connection::Connection;
use crate::error::ExecError;
use crate::shell::bash::{BashShell, Exec};

const DEFAULT_TMPDIR: &str = "/tmp";

/// A directory created on the target for one operation
///
/// Created with [`RemoteTempDir::create`] and released with
/// [`RemoteTempDir::cleanup`], which the shell calls on every exit path
/// once the directory exists.
#[derive(Debug)]
pub struct RemoteTempDir {
    path: String,
    /// User the directory currently belongs to
    owner: Option<String>,
}

impl RemoteTempDir {
    /// Make `<tmpdir>/<script-dir or uuid>` with mode 700
    ///
    /// # Errors
    /// Returns a `TEMPDIR_ERROR` file error if `mkdir` fails.
    pub async fn create(shell: &BashShell, conn: &mut dyn Connection) -> Result<Self, ExecError> {
        let options = &shell.target().options;
        let root = options.tmpdir.as_deref().unwrap_or(DEFAULT_TMPDIR);
        let name = options
            .script_dir
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let path = format!("{}/{name}", root.trim_end_matches('/'));

        let output = shell
            .execute(conn, Command::argv(["mkdir", "-m", "700", path.as_str()]), Exec::default())
            .await?;
        if !output.success() {
            return Err(ExecError::file(
                "TEMPDIR_ERROR",
                format!("Could not make tmpdir: {}", output.stderr.trim()),
            ));
        }

        debug!(path = %path, "created tmpdir");
        Ok(Self {
            path,
            owner: conn.user().map(str::to_string),
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path of an entry inside the directory
    #[must_use]
    pub fn file(&self, name: &str) -> String {
        format!("{}/{}", self.path, name.trim_start_matches('/'))
    }

    /// Create subdirectories (absolute paths) with `mkdir -p`
    ///
    /// # Errors
    /// Returns a `MKDIR_ERROR` file error if `mkdir` fails.
    pub async fn mkdirs(
        &self,
        shell: &BashShell,
        conn: &mut dyn Connection,
        subdirs: &[String],
    ) -> Result<(), ExecError> {
        if subdirs.is_empty() {
            return Ok(());
        }
        let argv = ["mkdir".to_string(), "-p".to_string()]
            .into_iter()
            .chain(subdirs.iter().cloned());
        let output = shell
            .execute(conn, Command::argv(argv), Exec::default())
            .await?;
        if !output.success() {
            return Err(ExecError::file(
                "MKDIR_ERROR",
                format!(
                    "Could not create subdirectories in '{}': {}",
                    self.path,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    /// Hand the directory to the run-as user
    ///
    /// Nothing happens when `owner` is unset or already owns it.
    ///
    /// # Errors
    /// Returns `ID_ERROR` if the owner's group cannot be found and
    /// `CHOWN_ERROR` if `chown` fails.
    pub async fn chown(
        &mut self,
        shell: &BashShell,
        conn: &mut dyn Connection,
        owner: Option<&str>,
    ) -> Result<(), ExecError> {
        let Some(owner) = owner else {
            return Ok(());
        };
        if self.owner.as_deref() == Some(owner) {
            return Ok(());
        }

        let output = shell
            .execute(conn, Command::argv(["id", "-g", owner]), Exec::default())
            .await?;
        if !output.success() {
            return Err(ExecError::file(
                "ID_ERROR",
                format!(
                    "Could not identify group of user {owner}: {}",
                    output.stderr.trim()
                ),
            ));
        }
        let ownership = format!("{owner}:{}", output.stdout.trim());

        let output = shell
            .execute(
                conn,
                Command::argv(["chown", "-R", ownership.as_str(), self.path.as_str()]),
                Exec::escalated("root"),
            )
            .await?;
        if !output.success() {
            return Err(ExecError::file(
                "CHOWN_ERROR",
                format!(
                    "Could not change owner of '{}' to {owner}: {}",
                    self.path,
                    output.stderr.trim()
                ),
            ));
        }

        self.owner = Some(owner.to_string());
        Ok(())
    }

    /// Remove the directory as its current owner, or leave it when
    /// `cleanup` is disabled
    ///
    /// Failures are logged, never returned.
    pub async fn cleanup(self, shell: &BashShell, conn: &mut dyn Connection) {
        if !shell.target().options.cleanup {
            warn!(path = %self.path, "skipping cleanup of tmpdir");
            return;
        }

        let exec = match &self.owner {
            Some(owner) => Exec::escalated(owner),
            None => Exec::default(),
        };
        match shell
            .execute(conn, Command::argv(["rm", "-rf", self.path.as_str()]), exec)
            .await
        {
            Ok(output) if output.success() => debug!(path = %self.path, "removed tmpdir"),
            Ok(output) => warn!(
                path = %self.path,
                stderr = %output.stderr.trim(),
                "failed to clean up tmpdir"
            ),
            Err(e) => warn!(path = %self.path, error = %e, "failed to clean up tmpdir"),
        }
    }
}

impl fmt::Display for RemoteTempDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}
