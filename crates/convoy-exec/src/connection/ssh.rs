//! SSH connections using the russh crate

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use convoy_api::Target;
use russh::keys::{PrivateKeyWithHashAlg, check_known_hosts, ssh_key};
use russh::{ChannelMsg, Disconnect, client};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::connection::keys::KeySource;
use crate::connection::{Connection, SpawnOptions};
use crate::error::{ConnectIssue, ExecError};
use crate::process::{ProcessEvent, ProcessPipes, RemoteProcess, StdinMsg};

const DEFAULT_PORT: u16 = 22;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host: String,
    port: u16,
    host_key_check: bool,
    /// Set when the server key did not match `known_hosts`
    rejected: Arc<AtomicBool>,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.host_key_check {
            return Ok(true);
        }
        match check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) | Err(_) => {
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

/// SSH connection to one target
///
/// Authenticates with the configured private key, then default keys from
/// `~/.ssh`, then the password. Each spawned command gets its own session
/// channel.
pub struct SshConnection {
    target: Target,
    user: String,
    session: Option<client::Handle<SshClientHandler>>,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("target", &self.target.safe_name())
            .field("user", &self.user)
            .field("connected", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl SshConnection {
    #[must_use]
    pub fn new(target: Target) -> Self {
        let user = target
            .user()
            .map(str::to_string)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        Self {
            target,
            user,
            session: None,
        }
    }

    fn host(&self) -> Result<String, ExecError> {
        self.target.host().map(str::to_string).ok_or_else(|| {
            ExecError::connect(
                ConnectIssue::Connect,
                format!("No host given for {}", self.target.safe_name()),
            )
        })
    }

    fn session(&self) -> Result<&client::Handle<SshClientHandler>, ExecError> {
        self.session.as_ref().ok_or(ExecError::NotConnected)
    }

    async fn authenticate(
        &self,
        session: &mut client::Handle<SshClientHandler>,
    ) -> Result<(), ExecError> {
        let auth_error = |msg: String| ExecError::connect(ConnectIssue::Auth, msg);
        let key_source = KeySource::from_options(&self.target.options);
        let keys = match key_source.resolve() {
            Ok(keys) => keys,
            Err(e) => {
                return Err(auth_error(format!(
                    "Failed to load private key for {}: {e}",
                    self.target.safe_name()
                )));
            }
        };

        for key in keys {
            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            let result = session
                .authenticate_publickey(
                    &self.user,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
                .map_err(|e| auth_error(e.to_string()))?;
            if result.success() {
                return Ok(());
            }
            debug!(user = %self.user, "public key rejected");
        }

        if let Some(password) = self.target.password() {
            let result = session
                .authenticate_password(&self.user, password)
                .await
                .map_err(|e| auth_error(e.to_string()))?;
            if result.success() {
                return Ok(());
            }
        }

        Err(auth_error(format!(
            "Authentication failed for user {} on {}",
            self.user,
            self.target.safe_name()
        )))
    }

    async fn sftp(&self) -> Result<SftpSession, ExecError> {
        let channel = self
            .session()?
            .channel_open_session()
            .await
            .map_err(|e| ExecError::Protocol(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ExecError::Protocol(e.to_string()))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ExecError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn user(&self) -> Option<&str> {
        Some(&self.user)
    }

    #[instrument(skip(self), fields(target = %self.target.safe_name()))]
    async fn connect(&mut self) -> Result<(), ExecError> {
        if self.session.is_some() {
            return Ok(());
        }

        let host = self.host()?;
        let port = self.target.port().unwrap_or(DEFAULT_PORT);
        let connect_timeout = Duration::from_secs(self.target.options.connect_timeout);

        info!(host = %host, port, user = %self.user, "connecting to SSH");

        let rejected = Arc::new(AtomicBool::new(false));
        let handler = SshClientHandler {
            host: host.clone(),
            port,
            host_key_check: self.target.options.host_key_check,
            rejected: Arc::clone(&rejected),
        };
        let config = Arc::new(client::Config::default());

        let mut session = match timeout(
            connect_timeout,
            client::connect(config, (host.as_str(), port), handler),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) if rejected.load(Ordering::SeqCst) => {
                return Err(ExecError::connect(
                    ConnectIssue::HostKey,
                    format!("Host key verification failed for {}: {e}", self.target.safe_name()),
                ));
            }
            Ok(Err(e)) => {
                return Err(ExecError::connect(
                    ConnectIssue::Connect,
                    format!("Failed to connect to {}: {e}", self.target.safe_name()),
                ));
            }
            Err(_) => {
                return Err(ExecError::connect(
                    ConnectIssue::Timeout,
                    format!(
                        "Timeout after {} seconds connecting to {}",
                        connect_timeout.as_secs(),
                        self.target.safe_name()
                    ),
                ));
            }
        };

        self.authenticate(&mut session).await?;

        info!(host = %host, "SSH connected and authenticated");
        self.session = Some(session);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        if let Some(session) = self.session.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::Protocol(e.to_string()))?;
            debug!(target = %self.target.safe_name(), "SSH disconnected");
        }
        Ok(())
    }

    #[instrument(skip(self, command), fields(target = %self.target.safe_name()))]
    async fn spawn(
        &mut self,
        command: &str,
        options: SpawnOptions,
    ) -> Result<RemoteProcess, ExecError> {
        let io_error = |e: russh::Error| ExecError::Protocol(e.to_string());
        let mut channel = self
            .session()?
            .channel_open_session()
            .await
            .map_err(io_error)?;

        if options.tty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(io_error)?;
        }

        debug!(command = %command, "executing remote command");
        channel.exec(true, command).await.map_err(io_error)?;

        let (process, pipes) = RemoteProcess::pipe();
        tokio::spawn(async move {
            let ProcessPipes {
                events,
                mut stdin,
                mut kill,
            } = pipes;
            let mut status = None;
            let mut stdin_open = true;

            loop {
                tokio::select! {
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            let _ = events.send(ProcessEvent::Stdout(data.to_vec())).await;
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                            let _ = events.send(ProcessEvent::Stderr(data.to_vec())).await;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            status = Some(exit_status.cast_signed());
                        }
                        Some(ChannelMsg::Close) | None => break,
                        _ => {}
                    },
                    msg = stdin.recv(), if stdin_open => match msg {
                        Some(StdinMsg::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                warn!(error = %e, "failed to write to remote stdin");
                                stdin_open = false;
                            }
                        }
                        Some(StdinMsg::Eof) | None => {
                            let _ = channel.eof().await;
                            stdin_open = false;
                        }
                    },
                    _ = &mut kill => {
                        let _ = channel.close().await;
                        break;
                    }
                }
            }

            let _ = events.send(ProcessEvent::Exit(status.unwrap_or(-1))).await;
        });

        Ok(process)
    }

    async fn upload_file(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        let contents = tokio::fs::read(source).await.map_err(|e| {
            ExecError::file(
                "WRITE_ERROR",
                format!("Could not read '{}': {e}", source.display()),
            )
        })?;
        self.upload_bytes(&contents, destination).await
    }

    async fn upload_bytes(&mut self, contents: &[u8], destination: &str) -> Result<(), ExecError> {
        let write_error =
            |e: String| ExecError::file("WRITE_ERROR", format!("Could not write '{destination}': {e}"));
        let sftp = self.sftp().await?;
        let mut file = sftp
            .open_with_flags(
                destination,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| write_error(e.to_string()))?;
        file.write_all(contents)
            .await
            .map_err(|e| write_error(e.to_string()))?;
        file.flush().await.map_err(|e| write_error(e.to_string()))?;
        file.shutdown()
            .await
            .map_err(|e| write_error(e.to_string()))?;
        Ok(())
    }

    async fn download_file(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        let read_error =
            |e: String| ExecError::file("READ_ERROR", format!("Could not read '{source}': {e}"));
        let sftp = self.sftp().await?;
        let mut file = sftp
            .open_with_flags(source, OpenFlags::READ)
            .await
            .map_err(|e| read_error(e.to_string()))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .await
            .map_err(|e| read_error(e.to_string()))?;
        tokio::fs::write(destination, &contents).await.map_err(|e| {
            ExecError::file(
                "WRITE_ERROR",
                format!("Could not write '{}': {e}", destination.display()),
            )
        })
    }

    fn connection_type(&self) -> &'static str {
        "ssh"
    }
}
