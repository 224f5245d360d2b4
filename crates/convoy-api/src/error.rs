//! Error types for convoy-api

use thiserror::Error;

use crate::result::{ErrorKind, ResultError};

/// Errors raised while resolving targets and their options
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// An option still carries a `_plugin` reference
    #[error("transport option '{key}' references a plugin that has not been resolved")]
    UnresolvedConfig {
        /// Dotted path of the offending option
        key: String,
    },

    /// Target URI could not be parsed
    #[error("invalid target URI '{uri}': {reason}")]
    InvalidUri {
        /// The URI as given
        uri: String,
        /// Parser message
        reason: String,
    },

    /// Transport name is not known
    #[error("unknown transport '{0}'")]
    UnknownTransport(String),

    /// Option has the wrong shape or value
    #[error("invalid value for option '{option}': {reason}")]
    InvalidOption {
        /// Option name
        option: String,
        /// What is wrong with it
        reason: String,
    },

    /// Two options cannot be used together
    #[error("{0}")]
    Conflict(String),
}

impl ValidationError {
    /// Machine readable issue code
    #[must_use]
    pub fn issue_code(&self) -> &'static str {
        match self {
            ValidationError::UnresolvedConfig { .. } => "unresolved-transport-config",
            ValidationError::InvalidUri { .. } => "INVALID_URI",
            ValidationError::UnknownTransport(_) => "UNKNOWN_TRANSPORT",
            ValidationError::InvalidOption { .. } => "INVALID_OPTION",
            ValidationError::Conflict(_) => "OPTION_CONFLICT",
        }
    }

    /// Convert into the structured result error
    #[must_use]
    pub fn to_result_error(&self) -> ResultError {
        ResultError::new(ErrorKind::Validation, self.to_string()).with_issue_code(self.issue_code())
    }
}

/// Errors raised while selecting what to run for a task
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// No implementation matches the target's features
    #[error("No suitable implementation of {task} for {target}")]
    NoImplementation {
        /// Task name
        task: String,
        /// Target safe name
        target: String,
    },

    /// Metadata names a file the task does not ship
    #[error("task {task} does not include file '{file}'")]
    MissingFile {
        /// Task name
        task: String,
        /// File named by the metadata
        file: String,
    },
}

impl TaskError {
    /// Convert into the structured result error
    #[must_use]
    pub fn to_result_error(&self) -> ResultError {
        match self {
            TaskError::NoImplementation { task, target } => {
                ResultError::new(ErrorKind::NoImplementation, self.to_string())
                    .with_issue_code("NO_IMPLEMENTATION")
                    .with_detail("task", task.as_str())
                    .with_detail("target", target.as_str())
            }
            TaskError::MissingFile { task, file } => {
                ResultError::new(ErrorKind::Validation, self.to_string())
                    .with_issue_code("MISSING_FILE")
                    .with_detail("task", task.as_str())
                    .with_detail("file", file.as_str())
            }
        }
    }
}
