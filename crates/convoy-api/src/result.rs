//! Per-target results and the ordered set returned by a fan-out

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

/// Operation a result belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Command,
    Script,
    Task,
    Upload,
    Download,
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Command => "command",
            Action::Script => "script",
            Action::Task => "task",
            Action::Upload => "upload",
            Action::Download => "download",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable kind tag carried by every failure
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connect,
    File,
    Escalate,
    NoImplementation,
    Validation,
    ExceptionFailure,
    Command,
    Task,
    SkippedNode,
    EnvironmentVar,
    MissingResult,
    UnsupportedOperation,
    /// Kind reported by a remote system that convoy does not define
    Other(String),
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::Connect => "connect-error",
            ErrorKind::File => "file-error",
            ErrorKind::Escalate => "escalate-error",
            ErrorKind::NoImplementation => "no-implementation-error",
            ErrorKind::Validation => "validation-error",
            ErrorKind::ExceptionFailure => "exception-failure",
            ErrorKind::Command => "command-error",
            ErrorKind::Task => "task-error",
            ErrorKind::SkippedNode => "skipped-node",
            ErrorKind::EnvironmentVar => "environment-var-error",
            ErrorKind::MissingResult => "missing-result-error",
            ErrorKind::UnsupportedOperation => "unsupported-operation",
            ErrorKind::Other(kind) => kind,
        }
    }

    /// Parse a kind tag, keeping unknown tags verbatim
    #[must_use]
    pub fn parse(kind: &str) -> Self {
        match kind {
            "connect-error" => ErrorKind::Connect,
            "file-error" => ErrorKind::File,
            "escalate-error" => ErrorKind::Escalate,
            "no-implementation-error" => ErrorKind::NoImplementation,
            "validation-error" => ErrorKind::Validation,
            "exception-failure" => ErrorKind::ExceptionFailure,
            "command-error" => ErrorKind::Command,
            "task-error" => ErrorKind::Task,
            "skipped-node" => ErrorKind::SkippedNode,
            "environment-var-error" => ErrorKind::EnvironmentVar,
            "missing-result-error" => ErrorKind::MissingResult,
            "unsupported-operation" => ErrorKind::UnsupportedOperation,
            other => ErrorKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        Ok(ErrorKind::parse(&kind))
    }
}

/// Structured failure: kind tag, message and free-form details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_code: Option<String>,
    pub msg: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl ResultError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            issue_code: None,
            msg: msg.into(),
            details: Map::new(),
        }
    }

    #[must_use]
    pub fn with_issue_code(mut self, code: impl Into<String>) -> Self {
        self.issue_code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Read an `_error` object as reported by a task
    ///
    /// Missing fields are filled in rather than rejected; tasks are not
    /// strict about the shape they report.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .map_or(ErrorKind::Task, ErrorKind::parse);
        let msg = value
            .get("msg")
            .and_then(Value::as_str)
            .map_or_else(|| value.to_string(), str::to_string);
        let issue_code = value
            .get("issue_code")
            .and_then(Value::as_str)
            .map(str::to_string);
        let details = value
            .get("details")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self {
            kind,
            issue_code,
            msg,
            details,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "msg": self.msg }))
    }
}

impl fmt::Display for ResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)
    }
}

impl std::error::Error for ResultError {}

/// Exactly one of a value or an error
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Map<String, Value>),
    Failure(ResultError),
}

/// Outcome of one operation against one target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetResult {
    /// Target name
    pub target: String,
    pub action: Action,
    /// Command text, script path, task name or upload source
    pub object: Option<String>,
    pub outcome: Outcome,
}

impl TargetResult {
    pub fn success(
        target: impl Into<String>,
        action: Action,
        object: Option<String>,
        value: Map<String, Value>,
    ) -> Self {
        Self {
            target: target.into(),
            action,
            object,
            outcome: Outcome::Success(value),
        }
    }

    pub fn failure(
        target: impl Into<String>,
        action: Action,
        object: Option<String>,
        error: ResultError,
    ) -> Self {
        Self {
            target: target.into(),
            action,
            object,
            outcome: Outcome::Failure(error),
        }
    }

    /// Build the result of a command or script from its captured output
    ///
    /// A non-zero exit code becomes a `command-error` failure carrying the
    /// streams in its details.
    pub fn for_command(
        target: impl Into<String>,
        action: Action,
        object: impl Into<String>,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
    ) -> Self {
        let mut value = Map::new();
        value.insert("stdout".into(), Value::from(stdout));
        value.insert("stderr".into(), Value::from(stderr));
        value.insert("exit_code".into(), Value::from(exit_code));

        let object = Some(object.into());
        if exit_code == 0 {
            return Self::success(target, action, object, value);
        }

        let mut error = ResultError::new(
            ErrorKind::Command,
            format!("The command failed with exit code {exit_code}"),
        )
        .with_issue_code("COMMAND_ERROR");
        error.details = value;
        Self::failure(target, action, object, error)
    }

    /// Build the result of a task from its captured output
    ///
    /// With `parse_stdout` the whole of stdout is read as a JSON object,
    /// falling back to `{"_output": stdout}`. Otherwise the streams are
    /// wrapped as they are. An `_error` key or a non-zero exit code makes
    /// the result a failure.
    pub fn for_task(
        target: impl Into<String>,
        task: impl Into<String>,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
        parse_stdout: bool,
    ) -> Self {
        let object = Some(task.into());
        let mut value = if parse_stdout {
            match serde_json::from_str::<Value>(stdout.trim()) {
                Ok(Value::Object(map)) => map,
                _ => {
                    let mut map = Map::new();
                    map.insert("_output".into(), Value::from(stdout));
                    map
                }
            }
        } else {
            let mut map = Map::new();
            map.insert("stdout".into(), Value::from(stdout));
            map.insert("stderr".into(), Value::from(stderr));
            map.insert("exit_code".into(), Value::from(exit_code));
            map
        };

        if let Some(reported) = value.remove("_error") {
            let mut error = ResultError::from_value(&reported);
            for (key, val) in value {
                error.details.entry(key).or_insert(val);
            }
            return Self::failure(target, Action::Task, object, error);
        }

        if exit_code != 0 {
            let mut error = ResultError::new(
                ErrorKind::Task,
                format!("The task failed with exit code {exit_code}"),
            )
            .with_issue_code("TASK_ERROR")
            .with_detail("exit_code", exit_code);
            if !stderr.is_empty() {
                error.details.entry("stderr").or_insert(Value::from(stderr));
            }
            for (key, val) in value {
                error.details.entry(key).or_insert(val);
            }
            return Self::failure(target, Action::Task, object, error);
        }

        Self::success(target, Action::Task, object, value)
    }

    pub fn for_upload(target: impl Into<String>, source: &str, destination: &str) -> Self {
        let target = target.into();
        let mut value = Map::new();
        value.insert(
            "_output".into(),
            Value::from(format!("Uploaded '{source}' to '{target}:{destination}'")),
        );
        value.insert("source".into(), Value::from(source));
        value.insert("destination".into(), Value::from(destination));
        Self::success(target, Action::Upload, Some(source.to_string()), value)
    }

    pub fn for_download(target: impl Into<String>, source: &str, destination: &str) -> Self {
        let target = target.into();
        let mut value = Map::new();
        value.insert(
            "_output".into(),
            Value::from(format!(
                "Downloaded '{target}:{source}' to '{destination}'"
            )),
        );
        value.insert("source".into(), Value::from(source));
        value.insert("path".into(), Value::from(destination));
        Self::success(target, Action::Download, Some(source.to_string()), value)
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    #[must_use]
    pub fn value(&self) -> Option<&Map<String, Value>> {
        match &self.outcome {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&ResultError> {
        match &self.outcome {
            Outcome::Success(_) => None,
            Outcome::Failure(error) => Some(error),
        }
    }

    /// Exit code reported by a command, script or task, if any
    #[must_use]
    pub fn exit_code(&self) -> Option<i64> {
        let fields = match &self.outcome {
            Outcome::Success(value) => value,
            Outcome::Failure(error) => &error.details,
        };
        fields.get("exit_code").and_then(Value::as_i64)
    }

    #[must_use]
    pub fn status(&self) -> &'static str {
        if self.ok() { "success" } else { "failure" }
    }

    /// JSON form: `{target, action, object, status, value}`
    #[must_use]
    pub fn to_value(&self) -> Value {
        let value = match &self.outcome {
            Outcome::Success(value) => Value::Object(value.clone()),
            Outcome::Failure(error) => json!({ "_error": error.to_value() }),
        };
        json!({
            "target": self.target,
            "action": self.action,
            "object": self.object,
            "status": self.status(),
            "value": value,
        })
    }
}

impl Serialize for TargetResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Ordered results of one fan-out, one per requested target
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    results: Vec<TargetResult>,
}

impl ResultSet {
    #[must_use]
    pub fn new(results: Vec<TargetResult>) -> Self {
        Self { results }
    }

    /// True when every result succeeded
    #[must_use]
    pub fn ok(&self) -> bool {
        self.results.iter().all(TargetResult::ok)
    }

    #[must_use]
    pub fn ok_set(&self) -> ResultSet {
        Self::new(self.results.iter().filter(|r| r.ok()).cloned().collect())
    }

    #[must_use]
    pub fn error_set(&self) -> ResultSet {
        Self::new(self.results.iter().filter(|r| !r.ok()).cloned().collect())
    }

    /// Split into (succeeded, failed), each keeping the original order
    #[must_use]
    pub fn partition(self) -> (ResultSet, ResultSet) {
        let (ok, failed): (Vec<_>, Vec<_>) = self.results.into_iter().partition(TargetResult::ok);
        (Self::new(ok), Self::new(failed))
    }

    #[must_use]
    pub fn find(&self, target: &str) -> Option<&TargetResult> {
        self.results.iter().find(|r| r.target == target)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.target.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TargetResult> {
        self.results.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<TargetResult> {
        self.results
    }
}

impl Serialize for ResultSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.results.serialize(serializer)
    }
}

impl IntoIterator for ResultSet {
    type Item = TargetResult;
    type IntoIter = std::vec::IntoIter<TargetResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a TargetResult;
    type IntoIter = std::slice::Iter<'a, TargetResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

impl FromIterator<TargetResult> for ResultSet {
    fn from_iter<I: IntoIterator<Item = TargetResult>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
