//! In-memory connection that records commands and replays canned output

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convoy_api::Target;

use crate::connection::{Connection, SpawnOptions};
use crate::error::ExecError;
use crate::process::{ProcessEvent, ProcessPipes, RemoteProcess, StdinMsg};
use crate::shell::escalate::SUDO_PROMPT;

/// How the fake process answers a command
#[derive(Debug, Clone)]
pub enum Reply {
    Exit {
        stdout: String,
        stderr: String,
        code: i32,
    },
    /// Prompt for a password, then print `stdout` if it matches
    Sudo { password: String, stdout: String },
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Exit {
            stdout: stdout.to_string(),
            stderr: String::new(),
            code: 0,
        }
    }

    pub fn fail(stderr: &str, code: i32) -> Self {
        Reply::Exit {
            stdout: String::new(),
            stderr: stderr.to_string(),
            code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Spawn { command: String, stdin: Vec<u8> },
    Upload { source: String, destination: String },
    UploadBytes { contents: Vec<u8>, destination: String },
    Download { source: String, destination: String },
}

impl Recorded {
    pub fn command(&self) -> Option<&str> {
        match self {
            Recorded::Spawn { command, .. } => Some(command),
            _ => None,
        }
    }
}

/// Replies are matched by substring, first match wins; anything else
/// succeeds with no output.
#[derive(Debug, Clone)]
pub struct ScriptedConnection {
    target: Target,
    user: Option<String>,
    reset_cwd: bool,
    replies: Vec<(String, Reply)>,
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl ScriptedConnection {
    pub fn new(target: Target, user: Option<&str>) -> Self {
        Self {
            target,
            user: user.map(str::to_string),
            reset_cwd: false,
            replies: Vec::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn reply(mut self, pattern: &str, reply: Reply) -> Self {
        self.replies.push((pattern.to_string(), reply));
        self
    }

    pub fn with_reset_cwd(mut self) -> Self {
        self.reset_cwd = true;
        self
    }

    /// Shared handle on everything the connection was asked to do
    pub fn log(&self) -> Arc<Mutex<Vec<Recorded>>> {
        Arc::clone(&self.log)
    }

    pub fn commands(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.command().map(str::to_string))
            .collect()
    }

    fn reply_for(&self, command: &str) -> Reply {
        self.replies
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map_or_else(|| Reply::ok(""), |(_, reply)| reply.clone())
    }
}

/// Collect stdin until EOF, or until nothing arrives for a while
async fn drain_stdin(stdin: &mut tokio::sync::mpsc::Receiver<StdinMsg>) -> Vec<u8> {
    let mut collected = Vec::new();
    while let Ok(Some(StdinMsg::Data(data))) =
        tokio::time::timeout(Duration::from_millis(100), stdin.recv()).await
    {
        collected.extend(data);
    }
    collected
}

/// The id a stdin-bearing sudo command echoes before reading input
fn correlation_id(command: &str) -> Option<&str> {
    let start = command.find("echo convoy-sudo-")? + "echo ".len();
    command[start..].split_whitespace().next()
}

async fn play(reply: Reply, pipes: ProcessPipes, command: String, log: Arc<Mutex<Vec<Recorded>>>) {
    let ProcessPipes {
        events, mut stdin, ..
    } = pipes;

    let (stdin_seen, code) = match reply {
        Reply::Exit {
            stdout,
            stderr,
            code,
        } => {
            let seen = drain_stdin(&mut stdin).await;
            if !stdout.is_empty() {
                let _ = events.send(ProcessEvent::Stdout(stdout.into_bytes())).await;
            }
            if !stderr.is_empty() {
                let _ = events.send(ProcessEvent::Stderr(stderr.into_bytes())).await;
            }
            (seen, code)
        }
        Reply::Sudo { password, stdout } => {
            let _ = events
                .send(ProcessEvent::Stderr(SUDO_PROMPT.as_bytes().to_vec()))
                .await;
            let answer = match stdin.recv().await {
                Some(StdinMsg::Data(data)) => data,
                _ => Vec::new(),
            };
            if answer == format!("{password}\n").into_bytes() {
                if let Some(id) = correlation_id(&command) {
                    let _ = events
                        .send(ProcessEvent::Stderr(format!("{id}\n").into_bytes()))
                        .await;
                }
                let mut rest = drain_stdin(&mut stdin).await;
                let _ = events.send(ProcessEvent::Stdout(stdout.into_bytes())).await;
                let mut seen = answer;
                seen.append(&mut rest);
                (seen, 0)
            } else {
                let _ = events
                    .send(ProcessEvent::Stderr(b"Sorry, try again.\n".to_vec()))
                    .await;
                let _ = events
                    .send(ProcessEvent::Stderr(SUDO_PROMPT.as_bytes().to_vec()))
                    .await;
                (answer, 1)
            }
        }
    };

    log.lock().unwrap().push(Recorded::Spawn {
        command,
        stdin: stdin_seen,
    });
    let _ = events.send(ProcessEvent::Exit(code)).await;
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    async fn connect(&mut self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn spawn(
        &mut self,
        command: &str,
        _options: SpawnOptions,
    ) -> Result<RemoteProcess, ExecError> {
        let (process, pipes) = RemoteProcess::pipe();
        let reply = self.reply_for(command);
        tokio::spawn(play(reply, pipes, command.to_string(), Arc::clone(&self.log)));
        Ok(process)
    }

    async fn upload_file(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        self.log.lock().unwrap().push(Recorded::Upload {
            source: source.display().to_string(),
            destination: destination.to_string(),
        });
        Ok(())
    }

    async fn upload_bytes(&mut self, contents: &[u8], destination: &str) -> Result<(), ExecError> {
        self.log.lock().unwrap().push(Recorded::UploadBytes {
            contents: contents.to_vec(),
            destination: destination.to_string(),
        });
        Ok(())
    }

    async fn download_file(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        self.log.lock().unwrap().push(Recorded::Download {
            source: source.to_string(),
            destination: destination.display().to_string(),
        });
        Ok(())
    }

    fn reset_cwd(&self) -> bool {
        self.reset_cwd
    }

    fn connection_type(&self) -> &'static str {
        "scripted"
    }
}
