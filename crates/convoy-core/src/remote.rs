//! Remote transport: tasks run on a proxy target on behalf of another
//!
//! Targets such as network devices or cloud APIs cannot run anything
//! themselves. Their tasks run on the target named by `run-on`
//! (`localhost` when unset) with the remote target's details passed in
//! the `_target` argument.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_api::{Inventory, Target, TargetResult, Task, TransportKind, ValidationError};
use convoy_exec::{Command, ExecError, RunOptions, Transport};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::registry::TransportRegistry;

const DEFAULT_RUN_ON: &str = "localhost";

pub struct RemoteTransport {
    inventory: Arc<dyn Inventory>,
    transports: TransportRegistry,
}

impl RemoteTransport {
    /// `transports` must not itself contain a remote transport
    #[must_use]
    pub fn new(inventory: Arc<dyn Inventory>, transports: TransportRegistry) -> Self {
        Self {
            inventory,
            transports,
        }
    }

    fn unsupported(operation: &'static str) -> ExecError {
        ExecError::Unsupported {
            transport: TransportKind::Remote.name(),
            operation,
        }
    }

    /// Proxy target and the transport that reaches it
    fn proxy(&self, target: &Target) -> Result<(Target, Arc<dyn Transport>), ExecError> {
        let run_on = target.options.run_on.as_deref().unwrap_or(DEFAULT_RUN_ON);
        let proxy = self
            .inventory
            .get_targets(run_on)?
            .into_iter()
            .next()
            .ok_or_else(|| ValidationError::InvalidOption {
                option: "run-on".to_string(),
                reason: format!("{} does not have a run-on target", target.safe_name()),
            })?;

        if proxy.transport == TransportKind::Remote {
            return Err(ValidationError::Conflict(format!(
                "{} cannot run through {}, which is itself a remote target",
                target.safe_name(),
                proxy.safe_name()
            ))
            .into());
        }

        let transport = self
            .transports
            .get(proxy.transport)
            .ok_or_else(|| ExecError::Unsupported {
                transport: proxy.transport.name(),
                operation: "task",
            })?;
        Ok((proxy, transport))
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    fn name(&self) -> &'static str {
        TransportKind::Remote.name()
    }

    async fn run_command(
        &self,
        _target: &Target,
        _command: &Command,
        _options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        Err(Self::unsupported("command"))
    }

    async fn run_script(
        &self,
        _target: &Target,
        _script: &Path,
        _arguments: &[String],
        _options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        Err(Self::unsupported("script"))
    }

    #[instrument(skip_all, fields(target = %target.safe_name(), task = %task.name))]
    async fn run_task(
        &self,
        target: &Target,
        task: &Task,
        arguments: &Map<String, Value>,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let (proxy, transport) = self.proxy(target)?;
        debug!(proxy = %proxy.safe_name(), "running remote task through proxy");

        let mut arguments = arguments.clone();
        arguments.insert("_target".to_string(), target.detail());
        let mut task = task.clone();
        task.metadata.remote = true;

        let result = transport.run_task(&proxy, &task, &arguments, options).await?;
        Ok(TargetResult {
            target: target.safe_name(),
            ..result
        })
    }

    async fn upload(
        &self,
        _target: &Target,
        _source: &Path,
        _destination: &str,
        _options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        Err(Self::unsupported("upload"))
    }

    async fn connected(&self, target: &Target) -> bool {
        match self.proxy(target) {
            Ok((proxy, transport)) => transport.connected(&proxy).await,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use convoy_api::{Action, ErrorKind};
    use serde_json::json;

    use super::*;
    use crate::inventory::StaticInventory;

    /// Records the target and arguments of every task it is asked to run
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<(String, Map<String, Value>, bool)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &'static str {
            "local"
        }

        async fn run_command(
            &self,
            _target: &Target,
            _command: &Command,
            _options: &RunOptions,
        ) -> Result<TargetResult, ExecError> {
            unreachable!("remote transport only proxies tasks")
        }

        async fn run_script(
            &self,
            _target: &Target,
            _script: &Path,
            _arguments: &[String],
            _options: &RunOptions,
        ) -> Result<TargetResult, ExecError> {
            unreachable!("remote transport only proxies tasks")
        }

        async fn run_task(
            &self,
            target: &Target,
            task: &Task,
            arguments: &Map<String, Value>,
            _options: &RunOptions,
        ) -> Result<TargetResult, ExecError> {
            self.calls.lock().unwrap().push((
                target.safe_name(),
                arguments.clone(),
                task.metadata.remote,
            ));
            Ok(TargetResult::for_task(
                target.safe_name(),
                task.name.clone(),
                r#"{"status": "done"}"#,
                "",
                0,
                true,
            ))
        }

        async fn upload(
            &self,
            _target: &Target,
            _source: &Path,
            _destination: &str,
            _options: &RunOptions,
        ) -> Result<TargetResult, ExecError> {
            unreachable!("remote transport only proxies tasks")
        }

        async fn connected(&self, _target: &Target) -> bool {
            true
        }
    }

    const INVENTORY: &str = r#"
[[targets]]
uri = "remote://device1"
name = "device1"
config = { run-on = "proxy1", remote = { api-key = "abc" } }

[[targets]]
uri = "remote://device2"
name = "device2"

[[targets]]
uri = "local://proxy1"
name = "proxy1"
"#;

    fn setup() -> (RemoteTransport, Arc<RecordingTransport>, StaticInventory) {
        let inventory = StaticInventory::from_toml_str(INVENTORY).unwrap();
        let recorder = Arc::new(RecordingTransport::default());
        let mut registry = TransportRegistry::empty();
        registry.register(TransportKind::Local, recorder.clone());
        let transport = RemoteTransport::new(Arc::new(inventory.clone()), registry);
        (transport, recorder, inventory)
    }

    #[tokio::test]
    async fn test_task_runs_on_proxy_with_target_details() {
        let (transport, recorder, inventory) = setup();
        let device = inventory.get_target("device1").unwrap();
        let task = Task::new("device::facts", "/m/device/tasks/facts.rb");

        let result = transport
            .run_task(
                &device,
                &task,
                json!({"detail": true}).as_object().unwrap(),
                &RunOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.target, "device1");
        assert_eq!(result.action, Action::Task);
        assert_eq!(result.value().unwrap()["status"], "done");

        let calls = recorder.calls.lock().unwrap();
        let (proxy, arguments, remote) = &calls[0];
        assert_eq!(proxy, "proxy1");
        assert!(remote);
        assert_eq!(arguments["detail"], true);
        assert_eq!(arguments["_target"]["name"], "device1");
        assert_eq!(arguments["_target"]["host"], "device1");
        assert_eq!(arguments["_target"]["remote"]["api-key"], "abc");
    }

    #[tokio::test]
    async fn test_run_on_defaults_to_localhost() {
        let (transport, recorder, inventory) = setup();
        let device = inventory.get_target("device2").unwrap();
        let task = Task::new("device::facts", "/m/device/tasks/facts.rb");

        transport
            .run_task(&device, &task, &Map::new(), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(recorder.calls.lock().unwrap()[0].0, "localhost");
    }

    #[tokio::test]
    async fn test_remote_proxy_rejected() {
        let (transport, _, _) = setup();
        let mut device = Target::parse("remote://device3").unwrap();
        device.options.run_on = Some("device1".to_string());
        let task = Task::new("device::facts", "/m/device/tasks/facts.rb");

        let err = transport
            .run_task(&device, &task, &Map::new(), &RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_result_error().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_other_operations_unsupported() {
        let (transport, _, inventory) = setup();
        let device = inventory.get_target("device1").unwrap();

        let err = transport
            .run_command(&device, &Command::from("uptime"), &RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_result_error().kind, ErrorKind::UnsupportedOperation);

        let err = transport
            .download(&device, "/etc/hosts", Path::new("/tmp"), &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Unsupported { operation: "download", .. }));
    }
}
