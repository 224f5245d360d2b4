//! Captured process output

use std::time::{Duration, Instant};

use convoy_api::{Action, TargetResult};
use serde::{Deserialize, Serialize};

/// Accumulates stdout, stderr and the exit code while a command runs
#[derive(Debug)]
pub struct Output {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    started: Instant,
}

impl Output {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            started: Instant::now(),
        }
    }

    pub fn push_stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }

    pub fn push_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }

    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    /// Stop accumulating; a missing exit status becomes -1
    #[must_use]
    pub fn freeze(self) -> CommandOutput {
        CommandOutput {
            exit_code: self.exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            duration: self.started.elapsed(),
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a finished command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit status code (0 for success)
    pub exit_code: i32,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandOutput {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Wrap as the result of a command or script
    #[must_use]
    pub fn into_result(self, target: &str, action: Action, object: &str) -> TargetResult {
        TargetResult::for_command(
            target,
            action,
            object,
            &self.stdout,
            &self.stderr,
            self.exit_code,
        )
    }
}
