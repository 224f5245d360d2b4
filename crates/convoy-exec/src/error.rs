//! Error types for convoy-exec

use std::time::Duration;

use convoy_api::{ErrorKind, ResultError, TaskError, ValidationError};
use thiserror::Error;

/// Why a connection could not be established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectIssue {
    HostKey,
    Auth,
    Connect,
    Timeout,
}

impl ConnectIssue {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ConnectIssue::HostKey => "HOST_KEY_ERROR",
            ConnectIssue::Auth => "AUTH_ERROR",
            ConnectIssue::Connect => "CONNECT_ERROR",
            ConnectIssue::Timeout => "TIMEOUT_ERROR",
        }
    }
}

/// Errors that can occur while running an operation against one target
#[derive(Error, Debug)]
pub enum ExecError {
    /// Could not reach or authenticate to the target
    #[error("{msg}")]
    Connect {
        /// Classification of the failure
        issue: ConnectIssue,
        /// Human readable message
        msg: String,
    },

    /// Remote file operation failed
    #[error("{msg}")]
    File {
        /// Issue code such as `TEMPDIR_ERROR`
        code: &'static str,
        /// Human readable message
        msg: String,
    },

    /// Privilege escalation failed
    #[error("{msg}")]
    Escalate {
        /// Issue code such as `BAD_PASSWORD`
        code: &'static str,
        /// Human readable message
        msg: String,
    },

    /// Setting a task environment variable failed
    #[error("Could not set environment variable '{var}'")]
    EnvironmentVar {
        /// Variable name
        var: String,
    },

    /// Target options are invalid
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Task has nothing to run on this target
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Transport cannot perform this operation
    #[error("the {transport} transport does not support {operation}")]
    Unsupported {
        /// Transport name
        transport: &'static str,
        /// Operation name
        operation: &'static str,
    },

    /// Connection used before `connect`
    #[error("not connected")]
    NotConnected,

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote side answered with something unexpected
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation did not finish in time
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Failure already in structured form, passed through as is
    #[error("{0}")]
    Reported(ResultError),
}

impl ExecError {
    pub fn connect(issue: ConnectIssue, msg: impl Into<String>) -> Self {
        ExecError::Connect {
            issue,
            msg: msg.into(),
        }
    }

    pub fn file(code: &'static str, msg: impl Into<String>) -> Self {
        ExecError::File {
            code,
            msg: msg.into(),
        }
    }

    pub fn escalate(code: &'static str, msg: impl Into<String>) -> Self {
        ExecError::Escalate {
            code,
            msg: msg.into(),
        }
    }

    /// Convert into the structured error carried by a failed result
    #[must_use]
    pub fn to_result_error(&self) -> ResultError {
        match self {
            ExecError::Connect { issue, msg } => {
                ResultError::new(ErrorKind::Connect, msg.clone()).with_issue_code(issue.code())
            }
            ExecError::File { code, msg } => {
                ResultError::new(ErrorKind::File, msg.clone()).with_issue_code(*code)
            }
            ExecError::Escalate { code, msg } => {
                ResultError::new(ErrorKind::Escalate, msg.clone()).with_issue_code(*code)
            }
            ExecError::EnvironmentVar { var } => {
                ResultError::new(ErrorKind::EnvironmentVar, self.to_string())
                    .with_issue_code("ENVIRONMENT_VAR_ERROR")
                    .with_detail("var", var.as_str())
            }
            ExecError::Validation(e) => e.to_result_error(),
            ExecError::Task(e) => e.to_result_error(),
            ExecError::Unsupported { .. } => {
                ResultError::new(ErrorKind::UnsupportedOperation, self.to_string())
            }
            ExecError::NotConnected => ResultError::new(ErrorKind::Connect, self.to_string())
                .with_issue_code(ConnectIssue::Connect.code()),
            ExecError::Timeout { .. } => ResultError::new(ErrorKind::Connect, self.to_string())
                .with_issue_code(ConnectIssue::Timeout.code()),
            ExecError::Reported(error) => error.clone(),
            ExecError::Spawn(_)
            | ExecError::Io(_)
            | ExecError::Http(_)
            | ExecError::Json(_)
            | ExecError::Protocol(_) => {
                ResultError::new(ErrorKind::ExceptionFailure, self.to_string())
                    .with_issue_code("EXCEPTION")
            }
        }
    }
}
