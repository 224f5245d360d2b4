//! Connection failures classified through the SSH transport

use convoy_api::{ErrorKind, Target, TransportKind, TransportOptions};
use convoy_exec::{Command, ConnectionTransport, Operation, RunOptions, Transport};
use serde_json::json;
use tokio::net::TcpListener;

fn ssh_target(uri: &str, connect_timeout: u64) -> Target {
    let options = TransportOptions::from_value(json!({
        "connect-timeout": connect_timeout,
        "host-key-check": false,
    }))
    .unwrap();
    Target::parse(uri).unwrap().with_options(options)
}

fn uptime() -> Operation {
    Operation::Command {
        command: Command::from("uptime"),
    }
}

#[tokio::test]
async fn test_refused_port_is_connect_error() {
    let transport = ConnectionTransport::new(TransportKind::Ssh);
    let target = ssh_target("ssh://127.0.0.1:1", 5);

    let results = transport
        .batch_execute(&[target], &uptime(), &RunOptions::default(), None)
        .await;

    assert_eq!(results.len(), 1);
    let error = results[0].error().unwrap();
    assert_eq!(error.kind, ErrorKind::Connect);
    assert_eq!(error.issue_code.as_deref(), Some("CONNECT_ERROR"));
}

#[tokio::test]
async fn test_silent_server_times_out() {
    // accepts TCP but never sends an SSH banner
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let transport = ConnectionTransport::new(TransportKind::Ssh);
    let target = ssh_target(&format!("ssh://127.0.0.1:{port}"), 1);

    let results = transport
        .batch_execute(&[target], &uptime(), &RunOptions::default(), None)
        .await;
    server.abort();

    let error = results[0].error().unwrap();
    assert_eq!(error.kind, ErrorKind::Connect);
    assert_eq!(error.issue_code.as_deref(), Some("TIMEOUT_ERROR"));
}

#[tokio::test]
async fn test_connected_is_false_for_unreachable_host() {
    let transport = ConnectionTransport::new(TransportKind::Ssh);
    assert!(!transport.connected(&ssh_target("ssh://127.0.0.1:1", 2)).await);
}
