//! Streaming handle to a running command
//!
//! Every connection hands back a [`RemoteProcess`]: output arrives as
//! [`ProcessEvent`]s in the order the connection saw it, and stdin is fed
//! through a channel so the caller can write mid-stream (sudo passwords,
//! task input released after escalation).

use tokio::sync::{mpsc, oneshot};

use crate::error::ExecError;
use crate::output::{CommandOutput, Output};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Always the last event; -1 when the remote reported no status
    Exit(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinMsg {
    Data(Vec<u8>),
    Eof,
}

/// Caller side of a running command
#[derive(Debug)]
pub struct RemoteProcess {
    events: mpsc::Receiver<ProcessEvent>,
    stdin: Option<mpsc::Sender<StdinMsg>>,
    kill: Option<oneshot::Sender<()>>,
}

/// Connection side of a running command
#[derive(Debug)]
pub struct ProcessPipes {
    pub events: mpsc::Sender<ProcessEvent>,
    pub stdin: mpsc::Receiver<StdinMsg>,
    /// Fires when the caller kills or drops the process
    pub kill: oneshot::Receiver<()>,
}

impl RemoteProcess {
    /// Create a connected pair of handles
    #[must_use]
    pub fn pipe() -> (RemoteProcess, ProcessPipes) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (stdin_tx, stdin_rx) = mpsc::channel(EVENT_BUFFER);
        let (kill_tx, kill_rx) = oneshot::channel();
        (
            RemoteProcess {
                events: events_rx,
                stdin: Some(stdin_tx),
                kill: Some(kill_tx),
            },
            ProcessPipes {
                events: events_tx,
                stdin: stdin_rx,
                kill: kill_rx,
            },
        )
    }

    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    /// Write to the process's stdin
    ///
    /// # Errors
    /// Returns `ExecError::Io` if stdin has already been closed.
    pub async fn write_stdin(&mut self, data: impl Into<Vec<u8>>) -> Result<(), ExecError> {
        let closed = || {
            ExecError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin is closed",
            ))
        };
        let stdin = self.stdin.as_ref().ok_or_else(closed)?;
        stdin
            .send(StdinMsg::Data(data.into()))
            .await
            .map_err(|_| closed())
    }

    /// Signal end of input; further writes fail
    pub async fn close_stdin(&mut self) {
        if let Some(stdin) = self.stdin.take() {
            // the process may already have exited and dropped its end
            let _ = stdin.send(StdinMsg::Eof).await;
        }
    }

    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Close stdin and collect all remaining output
    pub async fn wait(mut self) -> CommandOutput {
        self.close_stdin().await;
        let mut output = Output::new();
        while let Some(event) = self.next_event().await {
            match event {
                ProcessEvent::Stdout(data) => output.push_stdout(&data),
                ProcessEvent::Stderr(data) => output.push_stderr(&data),
                ProcessEvent::Exit(code) => output.set_exit_code(code),
            }
        }
        output.freeze()
    }
}
