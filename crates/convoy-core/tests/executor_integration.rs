use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convoy_api::{Action, ErrorKind, EventSink, ProgressEvent, Target, TargetResult, Task, TransportKind};
use convoy_core::{Context, Executor, TransportRegistry};
use convoy_exec::error::ConnectIssue;
use convoy_exec::{Command, ExecError, RunOptions, Transport};
use serde_json::{Map, Value};

/// Answers every operation after a delay, failing targets whose host starts with `bad`
#[derive(Default)]
struct FakeTransport {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    batch_size: Option<usize>,
    batches_seen: Mutex<Vec<usize>>,
    downloads: Mutex<Vec<(String, String)>>,
}

impl FakeTransport {
    fn batching(size: usize) -> Self {
        Self {
            batch_size: Some(size),
            ..Self::default()
        }
    }

    async fn answer(&self, target: &Target, object: &str) -> Result<TargetResult, ExecError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        // later targets finish first
        let n: u64 = target
            .host()
            .and_then(|h| h.trim_start_matches(|c: char| !c.is_ascii_digit()).parse().ok())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(n * 5))).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let host = target.host().unwrap_or_default();
        if host.starts_with("bad") {
            return Err(ExecError::connect(
                ConnectIssue::Connect,
                format!("Failed to connect to {host}"),
            ));
        }
        if host.starts_with("panic") {
            panic!("transport bug");
        }
        Ok(TargetResult::for_command(
            target.safe_name(),
            Action::Command,
            object,
            host,
            "",
            0,
        ))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn run_command(
        &self,
        target: &Target,
        command: &Command,
        _options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        self.answer(target, &command.to_string()).await
    }

    async fn run_script(
        &self,
        target: &Target,
        script: &Path,
        _arguments: &[String],
        _options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        self.answer(target, &script.display().to_string()).await
    }

    async fn run_task(
        &self,
        target: &Target,
        task: &Task,
        _arguments: &Map<String, Value>,
        _options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        self.answer(target, &task.name).await
    }

    async fn upload(
        &self,
        target: &Target,
        source: &Path,
        _destination: &str,
        _options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        self.answer(target, &source.display().to_string()).await
    }

    async fn download(
        &self,
        target: &Target,
        source: &str,
        destination: &Path,
        _options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        self.downloads
            .lock()
            .unwrap()
            .push((target.safe_name(), destination.display().to_string()));
        Ok(TargetResult::for_download(
            target.safe_name(),
            source,
            &destination.join("file").display().to_string(),
        ))
    }

    async fn connected(&self, _target: &Target) -> bool {
        true
    }

    fn batches(&self, targets: Vec<Target>) -> Vec<Vec<Target>> {
        let size = self.batch_size.unwrap_or(1);
        let batches: Vec<Vec<Target>> = targets.chunks(size).map(<[Target]>::to_vec).collect();
        self.batches_seen
            .lock()
            .unwrap()
            .extend(batches.iter().map(Vec::len));
        batches
    }
}

fn targets(hosts: &[&str]) -> Vec<Target> {
    hosts.iter().map(|h| Target::parse(h).unwrap()).collect()
}

fn executor(transport: Arc<FakeTransport>, context: Context) -> Executor {
    let mut registry = TransportRegistry::empty();
    registry.register(TransportKind::Ssh, transport);
    Executor::new(registry, context)
}

#[tokio::test]
async fn test_one_failure_does_not_abort_siblings() {
    let transport = Arc::new(FakeTransport::default());
    let executor = executor(transport, Context::new());
    let hosts = ["web1", "web2", "bad3", "web4", "web5"];

    let results = executor
        .run_command(&targets(&hosts), "uptime", &RunOptions::default())
        .await;

    assert_eq!(results.len(), 5);
    assert_eq!(results.names(), hosts.to_vec());
    assert!(!results.ok());

    let failed = results.error_set();
    assert_eq!(failed.names(), vec!["bad3"]);
    let error = failed.find("bad3").unwrap().error().unwrap();
    assert_eq!(error.kind, ErrorKind::Connect);
    assert_eq!(error.issue_code.as_deref(), Some("CONNECT_ERROR"));
    assert_eq!(results.ok_set().len(), 4);

    for result in results.ok_set().iter() {
        assert_eq!(result.value().unwrap()["stdout"], result.target.as_str());
    }
}

#[tokio::test]
async fn test_panicking_unit_becomes_exception_failure() {
    let transport = Arc::new(FakeTransport::default());
    let executor = executor(transport, Context::new());

    let results = executor
        .run_command(&targets(&["web1", "panic2", "web3"]), "id", &RunOptions::default())
        .await;

    assert_eq!(results.names(), vec!["web1", "panic2", "web3"]);
    let error = results.find("panic2").unwrap().error().unwrap();
    assert_eq!(error.kind, ErrorKind::ExceptionFailure);
    assert!(results.find("web1").unwrap().ok());
    assert!(results.find("web3").unwrap().ok());
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let transport = Arc::new(FakeTransport::default());
    let executor = executor(Arc::clone(&transport), Context::new().with_concurrency(2));
    let hosts: Vec<String> = (1..=6).map(|i| format!("web{i}")).collect();
    let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();

    let results = executor
        .run_command(&targets(&hosts), "true", &RunOptions::default())
        .await;

    assert!(results.ok());
    assert!(transport.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_events_for_every_target() {
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
    let sink: EventSink = {
        let events = Arc::clone(&events);
        Arc::new(move |event: &ProgressEvent| events.lock().unwrap().push(event.clone()))
    };
    let transport = Arc::new(FakeTransport::default());
    let executor = executor(transport, Context::new().with_events(sink));

    executor
        .run_command(&targets(&["web1", "bad2"]), "true", &RunOptions::default())
        .await;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 4);
    for name in ["web1", "bad2"] {
        let mine: Vec<_> = events.iter().filter(|e| e.target() == name).collect();
        assert!(matches!(mine[0], ProgressEvent::NodeStart { .. }));
        assert!(matches!(mine[1], ProgressEvent::NodeResult { .. }));
    }
}

#[tokio::test]
async fn test_batches_are_fanned_back_out_in_order() {
    let transport = Arc::new(FakeTransport::batching(2));
    let executor = executor(Arc::clone(&transport), Context::new());
    let hosts = ["web1", "web2", "web3", "web4", "web5"];

    let results = executor
        .run_task(
            &targets(&hosts),
            &Task::new("pkg::status", "/m/pkg/tasks/status.sh"),
            &Map::new(),
            &RunOptions::default(),
        )
        .await;

    assert_eq!(results.names(), hosts.to_vec());
    assert_eq!(*transport.batches_seen.lock().unwrap(), vec![2, 2, 1]);
}

#[tokio::test]
async fn test_unregistered_transport_fails_only_its_targets() {
    let transport = Arc::new(FakeTransport::default());
    let executor = executor(transport, Context::new());
    let targets = targets(&["web1", "docker://app", "web2"]);

    let results = executor
        .run_command(&targets, "true", &RunOptions::default())
        .await;

    assert_eq!(results.names(), vec!["web1", "docker://app", "web2"]);
    let error = results.find("docker://app").unwrap().error().unwrap();
    assert_eq!(error.kind, ErrorKind::UnsupportedOperation);
    assert_eq!(results.ok_set().len(), 2);
}

#[tokio::test]
async fn test_downloads_land_in_per_target_dirs() {
    let transport = Arc::new(FakeTransport::batching(10));
    let executor = executor(Arc::clone(&transport), Context::new());

    let results = executor
        .download(
            &targets(&["web1", "ssh://admin@web2:2222"]),
            "/etc/hosts",
            Path::new("/downloads"),
            &RunOptions::default(),
        )
        .await;

    assert!(results.ok());
    let mut downloads = transport.downloads.lock().unwrap().clone();
    downloads.sort();
    assert_eq!(
        downloads,
        vec![
            ("ssh://admin@web2:2222".to_string(), "/downloads/ssh___admin@web2_2222".to_string()),
            ("web1".to_string(), "/downloads/web1".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_empty_target_list() {
    let transport = Arc::new(FakeTransport::default());
    let executor = executor(transport, Context::new());
    let results = executor.run_command(&[], "true", &RunOptions::default()).await;
    assert!(results.is_empty());
    assert!(results.ok());
}

/// Collects formatted log lines for assertions
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_start_and_summary_are_logged() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let transport = Arc::new(FakeTransport::default());
    let executor = executor(transport, Context::new());
    executor
        .run_command(&targets(&["web1", "bad2"]), "uptime", &RunOptions::default())
        .await;

    let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert!(text.contains(r#"Starting command 'uptime' on ["web1", "bad2"]"#), "{text}");
    assert!(text.contains("Ran command 'uptime' on 2 targets with 1 failures"), "{text}");
}
