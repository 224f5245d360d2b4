//! Resolved transport options for a target
//!
//! Options arrive as a JSON/TOML table with kebab-case keys. Anything the
//! transports do not recognise is kept in [`TransportOptions::extra`] so it
//! can be handed on to remote tasks untouched.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Shell the target logs into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginShell {
    #[default]
    Bash,
    Sh,
    Powershell,
}

/// SSH private key, either on disk or inline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrivateKey {
    Path(PathBuf),
    Data {
        #[serde(rename = "key-data")]
        key_data: String,
    },
}

/// Interpreter override, a single program or a program with arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Interpreter {
    Program(String),
    Argv(Vec<String>),
}

impl Interpreter {
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        match self {
            Interpreter::Program(program) => vec![program.clone()],
            Interpreter::Argv(argv) => argv.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransportOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    // escalation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo_executable: Option<String>,

    // remote temp files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_dir: Option<String>,
    #[serde(default = "default_true")]
    pub cleanup: bool,

    /// Seconds allowed for establishing a connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds allowed for closing a connection
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout: u64,

    // ssh
    #[serde(default)]
    pub tty: bool,
    #[serde(default = "default_true")]
    pub host_key_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKey>,

    // execution
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub interpreters: BTreeMap<String, Interpreter>,
    #[serde(default)]
    pub login_shell: LoginShell,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_command: Option<String>,

    // winrm
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacert: Option<PathBuf>,

    // orchestrator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    #[serde(default = "default_task_environment")]
    pub task_environment: String,
    /// Seconds between job status polls
    #[serde(default = "default_job_poll_interval")]
    pub job_poll_interval: u64,
    /// Seconds before giving up on a job, unbounded when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_poll_timeout: Option<u64>,

    // remote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_on: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_disconnect_timeout() -> u64 {
    5
}

fn default_task_environment() -> String {
    "production".to_string()
}

fn default_job_poll_interval() -> u64 {
    1
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            user: None,
            password: None,
            run_as: None,
            run_as_command: None,
            sudo_password: None,
            sudo_executable: None,
            tmpdir: None,
            script_dir: None,
            cleanup: true,
            connect_timeout: default_connect_timeout(),
            disconnect_timeout: default_disconnect_timeout(),
            tty: false,
            host_key_check: true,
            private_key: None,
            extensions: Vec::new(),
            interpreters: BTreeMap::new(),
            login_shell: LoginShell::default(),
            shell_command: None,
            ssl: true,
            ssl_verify: true,
            cacert: None,
            service_url: None,
            token_file: None,
            task_environment: default_task_environment(),
            job_poll_interval: default_job_poll_interval(),
            job_poll_timeout: None,
            run_on: None,
            extra: Map::new(),
        }
    }
}

impl TransportOptions {
    /// Build options from a resolved config table
    ///
    /// # Errors
    /// Returns `ValidationError::UnresolvedConfig` if any value still holds a
    /// `_plugin` reference, and other variants for malformed or conflicting
    /// options.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        if let Some(key) = find_plugin_reference(&value, "") {
            return Err(ValidationError::UnresolvedConfig { key });
        }

        let mut options: TransportOptions =
            serde_json::from_value(value).map_err(|e| ValidationError::InvalidOption {
                option: "config".to_string(),
                reason: e.to_string(),
            })?;
        options.normalize();
        options.validate()?;
        Ok(options)
    }

    /// Check option combinations that cannot work together
    ///
    /// # Errors
    /// Returns a `ValidationError` describing the first problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.login_shell == LoginShell::Powershell {
            if self.tty {
                return Err(ValidationError::Conflict(
                    "the 'tty' option is not supported with login-shell powershell".to_string(),
                ));
            }
            if self.run_as.is_some() {
                return Err(ValidationError::Conflict(
                    "the 'run-as' option is not supported with login-shell powershell".to_string(),
                ));
            }
        }

        if let Some(command) = &self.run_as_command {
            if command.is_empty() {
                return Err(ValidationError::InvalidOption {
                    option: "run-as-command".to_string(),
                    reason: "must contain at least one element".to_string(),
                });
            }
        }

        if self.job_poll_interval == 0 {
            return Err(ValidationError::InvalidOption {
                option: "job-poll-interval".to_string(),
                reason: "must be at least 1 second".to_string(),
            });
        }

        Ok(())
    }

    /// Interpreter configured for an extension such as `.rb`
    #[must_use]
    pub fn interpreter_for(&self, extension: &str) -> Option<Vec<String>> {
        self.interpreters
            .get(&dotted(extension))
            .map(Interpreter::argv)
    }

    fn normalize(&mut self) {
        self.interpreters = std::mem::take(&mut self.interpreters)
            .into_iter()
            .map(|(ext, interpreter)| (dotted(&ext), interpreter))
            .collect();
        self.extensions = self.extensions.iter().map(|ext| dotted(ext)).collect();
    }
}

fn dotted(extension: &str) -> String {
    if extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{extension}")
    }
}

fn find_plugin_reference(value: &Value, path: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            if map.contains_key("_plugin") {
                return Some(if path.is_empty() { "_plugin".to_string() } else { path.to_string() });
            }
            map.iter().find_map(|(key, child)| {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                find_plugin_reference(child, &child_path)
            })
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, child)| find_plugin_reference(child, &format!("{path}[{i}]"))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = TransportOptions::from_value(json!({})).unwrap();
        assert!(options.cleanup);
        assert_eq!(options.connect_timeout, 10);
        assert_eq!(options.login_shell, LoginShell::Bash);
        assert_eq!(options, TransportOptions::default());
    }

    #[test]
    fn test_kebab_case_keys() {
        let options = TransportOptions::from_value(json!({
            "run-as": "root",
            "sudo-password": "secret",
            "run-as-command": ["doas", "-u"],
            "cleanup": false,
            "private-key": { "key-data": "-----BEGIN" },
            "interpreters": { "rb": "/usr/bin/ruby", ".py": ["/usr/bin/env", "python3"] },
            "extensions": ["py"],
            "custom-thing": 7
        }))
        .unwrap();

        assert_eq!(options.run_as.as_deref(), Some("root"));
        assert_eq!(options.sudo_password.as_deref(), Some("secret"));
        assert_eq!(options.run_as_command, Some(vec!["doas".into(), "-u".into()]));
        assert!(!options.cleanup);
        assert!(matches!(options.private_key, Some(PrivateKey::Data { .. })));
        assert_eq!(options.interpreter_for("rb"), Some(vec!["/usr/bin/ruby".to_string()]));
        assert_eq!(
            options.interpreter_for(".py"),
            Some(vec!["/usr/bin/env".to_string(), "python3".to_string()])
        );
        assert_eq!(options.extensions, vec![".py".to_string()]);
        assert_eq!(options.extra["custom-thing"], 7);
    }

    #[test]
    fn test_unresolved_plugin_rejected() {
        let err = TransportOptions::from_value(json!({
            "password": { "_plugin": "vault", "path": "secret/db" }
        }))
        .unwrap_err();

        assert_eq!(
            err,
            ValidationError::UnresolvedConfig {
                key: "password".to_string()
            }
        );
        assert_eq!(err.issue_code(), "unresolved-transport-config");
    }

    #[test]
    fn test_powershell_conflicts() {
        let err = TransportOptions::from_value(json!({
            "login-shell": "powershell",
            "tty": true
        }))
        .unwrap_err();
        assert!(matches!(err, ValidationError::Conflict(_)));

        let err = TransportOptions::from_value(json!({
            "login-shell": "powershell",
            "run-as": "root"
        }))
        .unwrap_err();
        assert!(matches!(err, ValidationError::Conflict(_)));
    }

    #[test]
    fn test_empty_run_as_command_rejected() {
        let err = TransportOptions::from_value(json!({ "run-as-command": [] })).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidOption { .. }));
    }
}
