//! Local child processes behind a [`RemoteProcess`]
//!
//! Shared by every connection that shells out on the controller: local
//! execution and the container CLIs.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ExecError;
use crate::output::CommandOutput;
use crate::process::{ProcessEvent, ProcessPipes, RemoteProcess, StdinMsg};

const CHUNK_SIZE: usize = 4096;

/// Spawn a child with piped stdio and stream it through a process handle
///
/// # Errors
/// Returns `ExecError::Spawn` if the program cannot be started.
pub fn spawn_child(mut command: Command) -> Result<RemoteProcess, ExecError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| ExecError::Spawn(e.to_string()))?;

    let (process, pipes) = RemoteProcess::pipe();
    let ProcessPipes {
        events,
        mut stdin,
        mut kill,
    } = pipes;

    let readers: Vec<_> = [
        child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward(out, events.clone(), ProcessEvent::Stdout))),
        child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward(err, events.clone(), ProcessEvent::Stderr))),
    ]
    .into_iter()
    .flatten()
    .collect();

    if let Some(mut child_stdin) = child.stdin.take() {
        tokio::spawn(async move {
            while let Some(msg) = stdin.recv().await {
                match msg {
                    StdinMsg::Data(data) => {
                        // the child may exit without reading its input
                        if child_stdin.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    StdinMsg::Eof => break,
                }
            }
            let _ = child_stdin.shutdown().await;
        });
    }

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = &mut kill => {
                debug!("killing child process");
                let _ = child.kill().await;
                None
            }
        };
        for reader in readers {
            let _ = reader.await;
        }
        let code = status.and_then(|s| s.code()).unwrap_or(-1);
        let _ = events.send(ProcessEvent::Exit(code)).await;
    });

    Ok(process)
}

/// Run a controller-side helper (`docker cp`, `lxc list`) to completion
///
/// # Errors
/// Returns `ExecError::Spawn` if the program cannot be started.
pub async fn run_captured(mut command: Command) -> Result<CommandOutput, ExecError> {
    command.stdin(Stdio::null());
    let started = std::time::Instant::now();
    let output = command
        .output()
        .await
        .map_err(|e| ExecError::Spawn(e.to_string()))?;
    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: started.elapsed(),
    })
}

async fn forward<R>(mut reader: R, events: mpsc::Sender<ProcessEvent>, wrap: fn(Vec<u8>) -> ProcessEvent)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if events.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}
