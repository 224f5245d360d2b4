//! Orchestrator transport: tasks run as jobs on an HTTP job service
//!
//! Commands, scripts and uploads are sent as shim tasks. Targets that
//! share a service URL, token file and task environment go out in one
//! job, and the per-node results are fanned back out.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use convoy_api::{
    Action, ErrorKind, EventSink, ProgressEvent, ResultError, Target, TargetResult, Task,
    TransportOptions,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument};
use url::Url;

use crate::command::Command;
use crate::error::{ConnectIssue, ExecError};
use crate::transport::{Operation, RunOptions, Transport, emit, failure_result};

pub const COMMAND_TASK: &str = "convoy_shim::command";
pub const SCRIPT_TASK: &str = "convoy_shim::script";
pub const UPLOAD_TASK: &str = "convoy_shim::upload";

const DEFAULT_PORT: u16 = 8143;
const TERMINAL_STATES: [&str; 4] = ["finished", "failed", "skipped", "stopped"];

/// Body of a task job submission
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskRequest {
    pub task: String,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noop: Option<bool>,
    pub params: Map<String, Value>,
    pub scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Scope {
    pub nodes: Vec<String>,
}

/// Final state of one node in a job
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NodeResult {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JobReference {
    job: JobId,
}

#[derive(Debug, Deserialize)]
struct JobId {
    name: String,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    state: String,
}

#[derive(Debug, Deserialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct InventoryNode {
    name: String,
    #[serde(default)]
    connected: bool,
}

/// Client for one job service
#[derive(Debug, Clone)]
pub struct OrchClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
    poll_interval: Duration,
    poll_timeout: Option<Duration>,
}

/// Targets with equal keys share a client and a job
#[must_use]
pub fn connection_key(options: &TransportOptions) -> String {
    format!(
        "{}-{}-{}",
        options.service_url.as_deref().unwrap_or_default(),
        options.task_environment,
        options
            .token_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    )
}

impl OrchClient {
    /// Build a client from a target's options
    ///
    /// # Errors
    /// Returns a connect error if `service-url` is missing or invalid, or
    /// if the token file or CA certificate cannot be read.
    pub fn from_options(options: &TransportOptions) -> Result<Self, ExecError> {
        let service_url = options.service_url.as_deref().ok_or_else(|| {
            ExecError::connect(ConnectIssue::Connect, "The 'service-url' option is required")
        })?;
        let mut base_url = Url::parse(service_url).map_err(|e| {
            ExecError::connect(
                ConnectIssue::Connect,
                format!("Invalid service-url '{service_url}': {e}"),
            )
        })?;
        if base_url.port().is_none() && base_url.set_port(Some(DEFAULT_PORT)).is_err() {
            return Err(ExecError::connect(
                ConnectIssue::Connect,
                format!("Invalid service-url '{service_url}'"),
            ));
        }

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(options.connect_timeout))
            .user_agent(concat!("convoy/", env!("CARGO_PKG_VERSION")));
        if let Some(cacert) = &options.cacert {
            let pem = std::fs::read(cacert).map_err(|e| {
                ExecError::connect(
                    ConnectIssue::Connect,
                    format!("Could not read cacert '{}': {e}", cacert.display()),
                )
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ExecError::connect(ConnectIssue::Connect, format!("Invalid cacert: {e}"))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        Ok(Self {
            http: builder.build()?,
            base_url,
            token: read_token(options)?,
            poll_interval: Duration::from_secs(options.job_poll_interval),
            poll_timeout: options.job_poll_timeout.map(Duration::from_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/orchestrator/v1/{path}",
            self.base_url.as_str().trim_end_matches('/')
        )
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ExecError> {
        let request = match &self.token {
            Some(token) => request.header("X-Authentication", token),
            None => request,
        };
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }
        Ok(response.json().await?)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ExecError> {
        self.send(self.http.get(self.url(path))).await
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ExecError> {
        self.send(self.http.post(self.url(path)).json(body)).await
    }

    /// Submit a task job, wait for it to end, and fetch the node results
    ///
    /// # Errors
    /// Returns `ExecError::Reported` for API errors and
    /// `ExecError::Timeout` once `job-poll-timeout` has passed.
    #[instrument(skip_all, fields(task = %request.task))]
    pub async fn run_task(&self, request: &TaskRequest) -> Result<Vec<NodeResult>, ExecError> {
        let reference: JobReference = self.post("command/task", request).await?;
        let job = reference.job.name;
        debug!(job = %job, "submitted job");

        let started = tokio::time::Instant::now();
        loop {
            let status: JobStatus = self.get(&format!("jobs/{job}")).await?;
            if TERMINAL_STATES.contains(&status.state.as_str()) {
                debug!(job = %job, state = %status.state, "job ended");
                break;
            }
            if let Some(timeout) = self.poll_timeout {
                if started.elapsed() >= timeout {
                    return Err(ExecError::Timeout { timeout });
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let nodes: Items<NodeResult> = self.get(&format!("jobs/{job}/nodes")).await?;
        Ok(nodes.items)
    }

    /// Names of the nodes the service currently has a connection to
    ///
    /// # Errors
    /// Returns request and API errors.
    pub async fn connected_nodes(&self, nodes: &[String]) -> Result<Vec<String>, ExecError> {
        let inventory: Items<InventoryNode> =
            self.post("inventory", &json!({ "nodes": nodes })).await?;
        Ok(inventory
            .items
            .into_iter()
            .filter(|n| n.connected)
            .map(|n| n.name)
            .collect())
    }
}

fn read_token(options: &TransportOptions) -> Result<Option<String>, ExecError> {
    let path = match &options.token_file {
        Some(path) => path.clone(),
        None => match dirs::home_dir().map(|h| h.join(".convoy").join("token")) {
            Some(path) if path.exists() => path,
            _ => return Ok(None),
        },
    };
    let token = std::fs::read_to_string(&path).map_err(|e| {
        ExecError::connect(
            ConnectIssue::Auth,
            format!("Could not read token file '{}': {e}", path.display()),
        )
    })?;
    Ok(Some(token.trim().to_string()))
}

/// Error responses carry `{kind, msg, details}`
fn api_error(status: u16, body: &str) -> ExecError {
    match serde_json::from_str::<Value>(body) {
        Ok(value) if value.get("kind").is_some() => {
            ExecError::Reported(ResultError::from_value(&value))
        }
        _ => ExecError::Protocol(format!("orchestrator returned {status}: {body}")),
    }
}

/// Node name a target is known by on the job service
fn certname(target: &Target) -> String {
    target.host().unwrap_or(&target.name).to_string()
}

#[derive(Debug, Default)]
pub struct OrchTransport {
    clients: Mutex<HashMap<String, OrchClient>>,
}

impl OrchTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, options: &TransportOptions) -> Result<OrchClient, ExecError> {
        let key = connection_key(options);
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| ExecError::Protocol("orchestrator client cache poisoned".into()))?;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        debug!(key = %key, "creating orchestrator client");
        let client = OrchClient::from_options(options)?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Shim task name and parameters for an operation
    async fn job_for(operation: &Operation) -> Result<(String, Map<String, Value>), ExecError> {
        let mut params = Map::new();
        let task = match operation {
            Operation::Command { command } => {
                params.insert("command".into(), Value::from(command.to_string()));
                COMMAND_TASK.to_string()
            }
            Operation::Script { script, arguments } => {
                params.insert("content".into(), Value::from(encode_file(script).await?));
                params.insert("arguments".into(), json!(arguments));
                SCRIPT_TASK.to_string()
            }
            Operation::Upload {
                source,
                destination,
            } => {
                params.insert("path".into(), Value::from(destination.as_str()));
                params.insert("content".into(), Value::from(encode_file(source).await?));
                params.insert("mode".into(), Value::from(file_mode(source).await?));
                UPLOAD_TASK.to_string()
            }
            Operation::Task { task, arguments } => {
                params.clone_from(arguments);
                task.name.clone()
            }
            Operation::Download { .. } => {
                return Err(ExecError::Unsupported {
                    transport: "orch",
                    operation: "download",
                });
            }
        };
        Ok((task, params))
    }

    /// Run one job for a batch of targets sharing a connection key
    async fn run_job(
        &self,
        targets: &[Target],
        operation: &Operation,
        options: &RunOptions,
    ) -> Result<Vec<TargetResult>, ExecError> {
        let Some(first) = targets.first() else {
            return Ok(Vec::new());
        };
        let client = self.client(&first.options)?;
        let (task, arguments) = Self::job_for(operation).await?;

        let request = TaskRequest {
            task,
            environment: first.options.task_environment.clone(),
            noop: arguments.get("_noop").and_then(Value::as_bool),
            params: arguments
                .into_iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .collect(),
            scope: Scope {
                nodes: targets.iter().map(certname).collect(),
            },
            description: options.description.clone(),
        };
        let nodes = client.run_task(&request).await?;

        Ok(targets
            .iter()
            .map(|target| {
                let node = nodes.iter().find(|n| n.name == certname(target));
                let result = process_node(target, operation, node);
                unwrap_shim(target, operation, result)
            })
            .collect())
    }

    async fn single(
        &self,
        target: &Target,
        operation: Operation,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let mut results = self
            .run_job(std::slice::from_ref(target), &operation, options)
            .await?;
        results
            .pop()
            .ok_or_else(|| ExecError::Protocol("no result returned".into()))
    }
}

async fn encode_file(path: &Path) -> Result<String, ExecError> {
    let content = tokio::fs::read(path).await.map_err(|e| {
        ExecError::file(
            "READ_ERROR",
            format!("Could not read '{}': {e}", path.display()),
        )
    })?;
    Ok(STANDARD.encode(content))
}

async fn file_mode(path: &Path) -> Result<u32, ExecError> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(mode_bits(&metadata))
}

#[cfg(unix)]
fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() { 0o100_444 } else { 0o100_644 }
}

/// Turn a node's final state into a result
///
/// `finished` nodes and nodes that report `_error` keep their value;
/// `skipped` becomes a skipped-node error; anything else is a failure
/// with an unknown exit code.
fn process_node(target: &Target, operation: &Operation, node: Option<&NodeResult>) -> TargetResult {
    let name = target.safe_name();
    let action = Action::Task;
    let object = match operation {
        Operation::Task { task, .. } => task.name.clone(),
        _ => operation.object(),
    };

    let Some(node) = node else {
        return TargetResult::failure(
            name,
            action,
            Some(object),
            ResultError::new(
                ErrorKind::MissingResult,
                format!("No result was returned for {}", certname(target)),
            ),
        );
    };

    let value = node.result.clone().unwrap_or(Value::Null);
    let reported_error = value.get("_error").cloned();
    if node.state == "finished" || reported_error.is_some() {
        let mut map = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("_output".into(), other);
                map
            }
        };
        return match map.remove("_error") {
            Some(error) => {
                let mut error = ResultError::from_value(&error);
                for (key, val) in map {
                    error.details.entry(key).or_insert(val);
                }
                TargetResult::failure(name, action, Some(object), error)
            }
            None => TargetResult::success(name, action, Some(object), map),
        };
    }

    if node.state == "skipped" {
        return TargetResult::failure(
            name,
            action,
            Some(object),
            ResultError::new(
                ErrorKind::SkippedNode,
                format!("Node {} was skipped", certname(target)),
            ),
        );
    }

    let error = ResultError::new(
        ErrorKind::Task,
        format!("The task ended in state '{}' with an unknown exit code", node.state),
    )
    .with_issue_code("TASK_ERROR")
    .with_detail("exit_code", "unknown")
    .with_detail("_output", value.to_string());
    TargetResult::failure(name, action, Some(object), error)
}

/// Shim task results become command, script or upload results
fn unwrap_shim(target: &Target, operation: &Operation, result: TargetResult) -> TargetResult {
    let action = operation.action();
    let object = operation.object();
    let Some(value) = result.value() else {
        return TargetResult {
            action,
            object: Some(object),
            ..result
        };
    };

    match operation {
        Operation::Task { .. } => result,
        Operation::Command { .. } | Operation::Script { .. } => {
            let text = |key: &str| value.get(key).and_then(Value::as_str).unwrap_or_default();
            let exit_code = value
                .get("exit_code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or(-1);
            TargetResult::for_command(
                target.safe_name(),
                action,
                object,
                text("stdout"),
                text("stderr"),
                exit_code,
            )
        }
        Operation::Upload {
            source,
            destination,
        } => TargetResult::for_upload(
            target.safe_name(),
            &source.display().to_string(),
            destination,
        ),
        Operation::Download { .. } => result,
    }
}

#[async_trait]
impl Transport for OrchTransport {
    fn name(&self) -> &'static str {
        "orch"
    }

    fn provided_features(&self, _target: &Target) -> Vec<&'static str> {
        vec!["puppet-agent"]
    }

    async fn run_command(
        &self,
        target: &Target,
        command: &Command,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let operation = Operation::Command {
            command: command.clone(),
        };
        self.single(target, operation, options).await
    }

    async fn run_script(
        &self,
        target: &Target,
        script: &Path,
        arguments: &[String],
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let operation = Operation::Script {
            script: script.to_path_buf(),
            arguments: arguments.to_vec(),
        };
        self.single(target, operation, options).await
    }

    async fn run_task(
        &self,
        target: &Target,
        task: &Task,
        arguments: &Map<String, Value>,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let operation = Operation::Task {
            task: task.clone(),
            arguments: arguments.clone(),
        };
        self.single(target, operation, options).await
    }

    async fn upload(
        &self,
        target: &Target,
        source: &Path,
        destination: &str,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let operation = Operation::Upload {
            source: source.to_path_buf(),
            destination: destination.to_string(),
        };
        self.single(target, operation, options).await
    }

    async fn connected(&self, target: &Target) -> bool {
        let Ok(client) = self.client(&target.options) else {
            return false;
        };
        let name = certname(target);
        match client.connected_nodes(std::slice::from_ref(&name)).await {
            Ok(nodes) => nodes.contains(&name),
            Err(e) => {
                info!(target = %target.safe_name(), error = %e, "inventory query failed");
                false
            }
        }
    }

    fn batches(&self, targets: Vec<Target>) -> Vec<Vec<Target>> {
        let mut groups: Vec<(String, Vec<Target>)> = Vec::new();
        for target in targets {
            let key = connection_key(&target.options);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(target),
                None => groups.push((key, vec![target])),
            }
        }
        groups.into_iter().map(|(_, group)| group).collect()
    }

    async fn batch_execute(
        &self,
        targets: &[Target],
        operation: &Operation,
        options: &RunOptions,
        events: Option<&EventSink>,
    ) -> Vec<TargetResult> {
        for target in targets {
            emit(
                events,
                ProgressEvent::node_start(target.safe_name(), operation.action()),
            );
        }

        let results = match self.run_job(targets, operation, options).await {
            Ok(results) => results,
            Err(e) => {
                info!(targets = targets.len(), error = %e, "orchestrator job failed");
                targets
                    .iter()
                    .map(|target| failure_result(target, operation, &e))
                    .collect()
            }
        };

        for result in &results {
            emit(events, ProgressEvent::node_result(result.clone()));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn orch_target(name: &str, server: &MockServer) -> Target {
        let options = TransportOptions::from_value(json!({
            "service-url": server.uri(),
        }))
        .unwrap();
        Target::parse(&format!("pcp://{name}"))
            .unwrap()
            .with_options(options)
    }

    async fn mock_job(server: &MockServer, nodes: Value) {
        mock_job_in_state(server, "finished", nodes).await;
    }

    async fn mock_job_in_state(server: &MockServer, state: &str, nodes: Value) {
        Mock::given(method("POST"))
            .and(path("/orchestrator/v1/command/task"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "job": {"id": format!("{}/orchestrator/v1/jobs/7", server.uri()), "name": "7"}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orchestrator/v1/jobs/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": state})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orchestrator/v1/jobs/7/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": nodes})))
            .mount(server)
            .await;
    }

    #[test]
    fn test_connection_key_groups_batches() {
        let mut a = TransportOptions::default();
        a.service_url = Some("https://orch1".into());
        let mut b = a.clone();
        b.task_environment = "staging".into();

        let targets = vec![
            Target::parse("pcp://n1").unwrap().with_options(a.clone()),
            Target::parse("pcp://n2").unwrap().with_options(b),
            Target::parse("pcp://n3").unwrap().with_options(a),
        ];
        let batches = OrchTransport::new().batches(targets);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][1].name, "pcp://n3");
    }

    #[tokio::test]
    async fn test_command_shim_unwrapped() {
        let server = MockServer::start().await;
        mock_job(
            &server,
            json!([{"name": "n1", "state": "finished",
                    "result": {"stdout": "hi\n", "stderr": "", "exit_code": 0}}]),
        )
        .await;

        let transport = OrchTransport::new();
        let target = orch_target("n1", &server);
        let result = transport
            .run_command(&target, &Command::from("echo hi"), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result.action, Action::Command);
        assert_eq!(result.value().unwrap()["stdout"], "hi\n");
        assert_eq!(result.object.as_deref(), Some("echo hi"));
    }

    #[tokio::test]
    async fn test_task_request_and_node_states() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orchestrator/v1/command/task"))
            .and(body_partial_json(json!({
                "task": "pkg::status",
                "environment": "production",
                "noop": true,
                "params": {"name": "nginx"},
                "scope": {"nodes": ["n1", "n2", "n3", "n4"]}
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "job": {"id": "x", "name": "7"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orchestrator/v1/jobs/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "failed"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orchestrator/v1/jobs/7/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [
                {"name": "n1", "state": "finished", "result": {"status": "running"}},
                {"name": "n2", "state": "skipped", "result": null},
                {"name": "n3", "state": "failed", "result": {"oops": 1}},
                {"name": "n4", "state": "failed",
                 "result": {"_error": {"kind": "acme/broken", "msg": "broken"}}}
            ]})))
            .mount(&server)
            .await;

        let targets: Vec<Target> = ["n1", "n2", "n3", "n4"]
            .iter()
            .map(|n| orch_target(n, &server))
            .collect();
        let operation = Operation::Task {
            task: Task::new("pkg::status", "/m/pkg/tasks/status.sh"),
            arguments: json!({"name": "nginx", "_noop": true}).as_object().unwrap().clone(),
        };
        let results = OrchTransport::new()
            .batch_execute(&targets, &operation, &RunOptions::default(), None)
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].value().unwrap()["status"], "running");
        assert_eq!(results[1].error().unwrap().kind, ErrorKind::SkippedNode);
        let unknown = results[2].error().unwrap();
        assert_eq!(unknown.kind, ErrorKind::Task);
        assert_eq!(unknown.details["exit_code"], "unknown");
        assert_eq!(results[3].error().unwrap().kind.as_str(), "acme/broken");
    }

    #[tokio::test]
    async fn test_skipped_job_stops_polling() {
        let server = MockServer::start().await;
        mock_job_in_state(
            &server,
            "skipped",
            json!([{"name": "n1", "state": "skipped", "result": null}]),
        )
        .await;

        let target = orch_target("n1", &server);
        let transport = OrchTransport::new();
        let task = Task::new("pkg::status", "/m/pkg/tasks/status.sh");
        let params = Map::new();
        let opts = RunOptions::default();
        let run = transport.run_task(&target, &task, &params, &opts);
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("job polling never ended")
            .unwrap();
        assert_eq!(result.error().unwrap().kind, ErrorKind::SkippedNode);
    }

    #[tokio::test]
    async fn test_api_error_fails_whole_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orchestrator/v1/command/task"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "kind": "puppetlabs.orchestrator/unknown-environment",
                "msg": "Unknown environment production"
            })))
            .mount(&server)
            .await;

        let targets = vec![orch_target("n1", &server), orch_target("n2", &server)];
        let operation = Operation::Command {
            command: Command::from("uptime"),
        };
        let events = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink_events = std::sync::Arc::clone(&events);
        let sink: EventSink = std::sync::Arc::new(move |event: &ProgressEvent| {
            sink_events.lock().unwrap().push(event.target().to_string());
        });

        let results = OrchTransport::new()
            .batch_execute(&targets, &operation, &RunOptions::default(), Some(&sink))
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.ok()));
        assert_eq!(
            results[0].error().unwrap().msg,
            "Unknown environment production"
        );
        assert_eq!(events.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_token_header_and_upload_shim() {
        let server = MockServer::start().await;
        let token = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(token.path(), "secret-token\n").unwrap();
        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), "kljhdfg").unwrap();

        Mock::given(method("POST"))
            .and(path("/orchestrator/v1/command/task"))
            .and(header("X-Authentication", "secret-token"))
            .and(body_partial_json(json!({
                "task": UPLOAD_TASK,
                "params": {"path": "/tmp/upload-test", "content": STANDARD.encode("kljhdfg")}
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "job": {"id": "x", "name": "7"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orchestrator/v1/jobs/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "finished"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orchestrator/v1/jobs/7/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [
                {"name": "n1", "state": "finished", "result": {}}
            ]})))
            .mount(&server)
            .await;

        let options = TransportOptions::from_value(json!({
            "service-url": server.uri(),
            "token-file": token.path(),
        }))
        .unwrap();
        let target = Target::parse("pcp://n1").unwrap().with_options(options);
        let result = OrchTransport::new()
            .upload(&target, source.path(), "/tmp/upload-test", &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result.action, Action::Upload);
        assert_eq!(result.value().unwrap()["destination"], "/tmp/upload-test");
    }

    #[tokio::test]
    async fn test_download_unsupported() {
        let server = MockServer::start().await;
        let target = orch_target("n1", &server);
        let err = OrchTransport::new()
            .download(&target, "/etc/hosts", Path::new("/tmp"), &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Unsupported { .. }));
    }
}
