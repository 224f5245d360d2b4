//! Windows targets over WinRM (WS-Management)
//!
//! A remote shell is created on connect and deleted on disconnect. Each
//! spawned command is a `powershell.exe -EncodedCommand` inside that shell;
//! its output is collected by polling `Receive` from a background task.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use convoy_api::Target;
use regex::Regex;
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::connection::{Connection, SpawnOptions};
use crate::error::{ConnectIssue, ExecError};
use crate::process::{ProcessEvent, ProcessPipes, RemoteProcess, StdinMsg};

const HTTP_PORT: u16 = 5985;
const HTTPS_PORT: u16 = 5986;

const RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// WS-Man fault raised when a `Receive` long-poll ends without output
const RECEIVE_TIMEOUT_FAULT: &str = "2150858793";

/// Encoded command lines longer than this are staged in a file first
const MAX_ENCODED_COMMAND: usize = 8000;

/// Raw bytes per upload chunk; keeps each chunk's command line short
const UPLOAD_CHUNK: usize = 1500;

const POWERSHELL_ARGS: &str = "-NoProfile -NonInteractive -NoLogo -ExecutionPolicy Bypass";

static SHELL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:<(?:\w+:)?ShellId>([^<]+)<|Name="ShellId">([^<]+)<)"#).expect("static regex")
});
static COMMAND_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?CommandId>([^<]+)<").expect("static regex")
});
static STREAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<(?:\w+:)?Stream\s[^>]*Name="(\w+)"[^>/]*>([^<]*)</(?:\w+:)?Stream>"#)
        .expect("static regex")
});
static COMMAND_STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<(?:\w+:)?CommandState\s[^>]*State="([^"]+)""#).expect("static regex")
});
static EXIT_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?ExitCode>(-?\d+)<").expect("static regex")
});
static FAULT_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?Text[^>]*>([^<]+)<").expect("static regex")
});

/// Endpoint and credentials shared by the connection and its poll tasks
#[derive(Debug, Clone)]
struct WsmanClient {
    http: Client,
    endpoint: Url,
    user: String,
    password: Option<String>,
}

/// Parsed `Receive` response
#[derive(Debug, Default, PartialEq, Eq)]
struct Received {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    done: bool,
    exit_code: Option<i32>,
}

impl WsmanClient {
    async fn post(&self, body: String) -> Result<String, ExecError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .basic_auth(&self.user, self.password.as_deref())
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            return Ok(text);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ExecError::connect(
                ConnectIssue::Auth,
                format!("Authentication failed for {}", self.endpoint),
            ));
        }
        if text.contains(RECEIVE_TIMEOUT_FAULT) {
            return Err(ExecError::Timeout {
                timeout: Duration::from_secs(0),
            });
        }
        let reason = FAULT_TEXT
            .captures(&text)
            .and_then(|c| c.get(1))
            .map_or_else(|| status.to_string(), |m| m.as_str().trim().to_string());
        Err(ExecError::Protocol(format!("WinRM request failed: {reason}")))
    }

    fn envelope(&self, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
        let selector = shell_id.map_or_else(String::new, |id| {
            format!(r#"<w:SelectorSet><w:Selector Name="ShellId">{id}</w:Selector></w:SelectorSet>"#)
        });
        format!(
            concat!(
                r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
                r#"xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
                r#"xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
                r#"xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">"#,
                "<s:Header>",
                "<a:To>{endpoint}</a:To>",
                r#"<a:ReplyTo><a:Address s:mustUnderstand="true">"#,
                "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
                "</a:Address></a:ReplyTo>",
                r#"<w:MaxEnvelopeSize s:mustUnderstand="true">153600</w:MaxEnvelopeSize>"#,
                "<a:MessageID>uuid:{message_id}</a:MessageID>",
                r#"<w:Locale xml:lang="en-US" s:mustUnderstand="false"/>"#,
                "<w:OperationTimeout>PT20S</w:OperationTimeout>",
                r#"<w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>"#,
                r#"<a:Action s:mustUnderstand="true">{action}</a:Action>"#,
                "{selector}{options}",
                "</s:Header>",
                "<s:Body>{body}</s:Body>",
                "</s:Envelope>"
            ),
            endpoint = self.endpoint,
            message_id = uuid::Uuid::new_v4().to_string().to_uppercase(),
            resource = RESOURCE_URI,
            action = action,
            selector = selector,
            options = options,
            body = body,
        )
    }

    async fn create_shell(&self) -> Result<String, ExecError> {
        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>"#,
            r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = concat!(
            "<rsp:Shell>",
            "<rsp:InputStreams>stdin</rsp:InputStreams>",
            "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
            "</rsp:Shell>"
        );
        let response = self
            .post(self.envelope(ACTION_CREATE, None, options, body))
            .await?;
        SHELL_ID
            .captures(&response)
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ExecError::Protocol("no ShellId in Create response".to_string()))
    }

    async fn delete_shell(&self, shell_id: &str) -> Result<(), ExecError> {
        self.post(self.envelope(ACTION_DELETE, Some(shell_id), "", ""))
            .await
            .map(|_| ())
    }

    async fn start_command(&self, shell_id: &str, arguments: &str) -> Result<String, ExecError> {
        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = format!(
            "<rsp:CommandLine><rsp:Command>powershell.exe</rsp:Command>\
             <rsp:Arguments>{arguments}</rsp:Arguments></rsp:CommandLine>"
        );
        let response = self
            .post(self.envelope(ACTION_COMMAND, Some(shell_id), options, &body))
            .await?;
        COMMAND_ID
            .captures(&response)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ExecError::Protocol("no CommandId in Command response".to_string()))
    }

    async fn send_stdin(
        &self,
        shell_id: &str,
        command_id: &str,
        data: &[u8],
        end: bool,
    ) -> Result<(), ExecError> {
        let end = if end { r#" End="true""# } else { "" };
        let body = format!(
            r#"<rsp:Send><rsp:Stream Name="stdin" CommandId="{command_id}"{end}>{}</rsp:Stream></rsp:Send>"#,
            BASE64.encode(data)
        );
        self.post(self.envelope(ACTION_SEND, Some(shell_id), "", &body))
            .await
            .map(|_| ())
    }

    async fn receive(&self, shell_id: &str, command_id: &str) -> Result<Received, ExecError> {
        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#
        );
        match self
            .post(self.envelope(ACTION_RECEIVE, Some(shell_id), "", &body))
            .await
        {
            Ok(response) => parse_receive(&response),
            Err(ExecError::Timeout { .. }) => Ok(Received::default()),
            Err(e) => Err(e),
        }
    }

    async fn terminate(&self, shell_id: &str, command_id: &str) -> Result<(), ExecError> {
        let body = format!(
            r#"<rsp:Signal CommandId="{command_id}"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"#
        );
        self.post(self.envelope(ACTION_SIGNAL, Some(shell_id), "", &body))
            .await
            .map(|_| ())
    }
}

fn parse_receive(response: &str) -> Result<Received, ExecError> {
    let mut received = Received::default();
    for capture in STREAM.captures_iter(response) {
        let (Some(name), Some(data)) = (capture.get(1), capture.get(2)) else {
            continue;
        };
        let bytes = BASE64
            .decode(data.as_str().trim())
            .map_err(|e| ExecError::Protocol(format!("invalid stream data: {e}")))?;
        match name.as_str() {
            "stdout" => received.stdout.extend(bytes),
            "stderr" => received.stderr.extend(bytes),
            _ => {}
        }
    }
    received.done = COMMAND_STATE
        .captures(response)
        .and_then(|c| c.get(1))
        .is_some_and(|m| m.as_str().ends_with("/Done"));
    received.exit_code = EXIT_CODE
        .captures(response)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    Ok(received)
}

/// Base64 of the UTF-16LE script, as `-EncodedCommand` expects
fn encode_command(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    BASE64.encode(bytes)
}

fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Drive one command until it finishes, forwarding output to the caller
async fn pump(client: WsmanClient, shell_id: String, command_id: String, pipes: ProcessPipes) {
    let ProcessPipes {
        events,
        mut stdin,
        mut kill,
    } = pipes;
    let mut stdin_open = true;

    let exit_code = loop {
        // dropping the handle counts as a kill
        if !matches!(kill.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            break -1;
        }

        while stdin_open {
            let sent = match stdin.try_recv() {
                Ok(StdinMsg::Data(data)) => {
                    client.send_stdin(&shell_id, &command_id, &data, false).await
                }
                Ok(StdinMsg::Eof) | Err(TryRecvError::Disconnected) => {
                    stdin_open = false;
                    client.send_stdin(&shell_id, &command_id, &[], true).await
                }
                Err(TryRecvError::Empty) => break,
            };
            if let Err(e) = sent {
                debug!(error = %e, "stdin send failed");
                stdin_open = false;
            }
        }

        match client.receive(&shell_id, &command_id).await {
            Ok(received) => {
                if !received.stdout.is_empty() {
                    let _ = events.send(ProcessEvent::Stdout(received.stdout)).await;
                }
                if !received.stderr.is_empty() {
                    let _ = events.send(ProcessEvent::Stderr(received.stderr)).await;
                }
                if received.done {
                    break received.exit_code.unwrap_or(-1);
                }
            }
            Err(e) => {
                warn!(error = %e, "WinRM receive failed");
                let _ = events
                    .send(ProcessEvent::Stderr(e.to_string().into_bytes()))
                    .await;
                break -1;
            }
        }
    };

    if let Err(e) = client.terminate(&shell_id, &command_id).await {
        debug!(error = %e, "command cleanup failed");
    }
    let _ = events.send(ProcessEvent::Exit(exit_code)).await;
}

#[derive(Debug)]
pub struct WinrmConnection {
    target: Target,
    client: Option<WsmanClient>,
    shell_id: Option<String>,
}

impl WinrmConnection {
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            target,
            client: None,
            shell_id: None,
        }
    }

    fn endpoint(&self) -> Result<Url, ExecError> {
        let host = self.target.host().ok_or_else(|| {
            ExecError::connect(
                ConnectIssue::Connect,
                format!("Target {} does not have a host", self.target.safe_name()),
            )
        })?;
        let ssl = self.target.options.ssl;
        let scheme = if ssl { "https" } else { "http" };
        let port = self
            .target
            .port()
            .unwrap_or(if ssl { HTTPS_PORT } else { HTTP_PORT });
        Url::parse(&format!("{scheme}://{host}:{port}/wsman")).map_err(|e| {
            ExecError::connect(ConnectIssue::Connect, format!("Invalid WinRM endpoint: {e}"))
        })
    }

    fn http_client(&self) -> Result<Client, ExecError> {
        let options = &self.target.options;
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(options.connect_timeout))
            .danger_accept_invalid_certs(!options.ssl_verify);
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
        Ok(builder.build()?)
    }

    fn session(&self) -> Result<(&WsmanClient, &str), ExecError> {
        match (&self.client, &self.shell_id) {
            (Some(client), Some(shell_id)) => Ok((client, shell_id)),
            _ => Err(ExecError::NotConnected),
        }
    }

    /// Wrap a script for the command line, staging it in a file when too long
    async fn command_arguments(&mut self, script: &str) -> Result<String, ExecError> {
        let encoded = encode_command(script);
        if encoded.len() <= MAX_ENCODED_COMMAND {
            return Ok(format!("{POWERSHELL_ARGS} -EncodedCommand {encoded}"));
        }

        let path = format!(
            "$env:TEMP\\convoy-{}.ps1",
            uuid::Uuid::new_v4().simple()
        );
        self.write_chunks(script.as_bytes(), &path).await?;
        let bootstrap = format!(
            "$p = \"{path}\"; try {{ & $p }} finally {{ Remove-Item -Force -Path $p }}; exit $LASTEXITCODE"
        );
        Ok(format!(
            "{POWERSHELL_ARGS} -EncodedCommand {}",
            encode_command(&bootstrap)
        ))
    }

    /// Write bytes to a remote path with a series of short commands
    ///
    /// `path` is inserted verbatim into a double-quoted PowerShell string.
    async fn write_chunks(&mut self, contents: &[u8], path: &str) -> Result<(), ExecError> {
        let chunks: Vec<&[u8]> = if contents.is_empty() {
            vec![contents]
        } else {
            contents.chunks(UPLOAD_CHUNK).collect()
        };
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mode = if i == 0 { "Create" } else { "Append" };
            let script = format!(
                "$b = [Convert]::FromBase64String('{}'); \
                 $f = [IO.File]::Open(\"{path}\", [IO.FileMode]::{mode}); \
                 $f.Write($b, 0, $b.Length); $f.Close()",
                BASE64.encode(chunk)
            );
            let output = self.spawn(&script, SpawnOptions::default()).await?.wait().await;
            if !output.success() {
                return Err(ExecError::file(
                    "WRITE_ERROR",
                    format!("Could not write '{path}': {}", output.stderr.trim()),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for WinrmConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn user(&self) -> Option<&str> {
        self.target.user()
    }

    #[instrument(skip(self), fields(target = %self.target.safe_name()))]
    async fn connect(&mut self) -> Result<(), ExecError> {
        let user = self.target.user().ok_or_else(|| {
            ExecError::connect(
                ConnectIssue::Auth,
                format!("No user given for {}", self.target.safe_name()),
            )
        })?;
        let client = WsmanClient {
            http: self.http_client()?,
            endpoint: self.endpoint()?,
            user: user.to_string(),
            password: self.target.password().map(str::to_string),
        };

        let timeout = Duration::from_secs(self.target.options.connect_timeout);
        let shell_id = match tokio::time::timeout(timeout, client.create_shell()).await {
            Err(_) => {
                return Err(ExecError::connect(
                    ConnectIssue::Timeout,
                    format!("Timeout after {}s connecting to {}", timeout.as_secs(), client.endpoint),
                ));
            }
            Ok(Err(ExecError::Http(e))) => {
                return Err(ExecError::connect(
                    ConnectIssue::Connect,
                    format!("Failed to connect to {}: {e}", client.endpoint),
                ));
            }
            Ok(result) => result?,
        };

        debug!(shell_id = %shell_id, "opened session");
        self.client = Some(client);
        self.shell_id = Some(shell_id);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        if let (Some(client), Some(shell_id)) = (self.client.take(), self.shell_id.take()) {
            client.delete_shell(&shell_id).await?;
            debug!(shell_id = %shell_id, "closed session");
        }
        Ok(())
    }

    #[instrument(skip(self, command), level = "debug")]
    async fn spawn(
        &mut self,
        command: &str,
        _options: SpawnOptions,
    ) -> Result<RemoteProcess, ExecError> {
        self.session()?;
        let arguments = self.command_arguments(command).await?;
        let (client, shell_id) = self.session()?;
        let command_id = client.start_command(shell_id, &arguments).await?;
        debug!(command_id = %command_id, "started command");

        let (process, pipes) = RemoteProcess::pipe();
        tokio::spawn(pump(client.clone(), shell_id.to_string(), command_id, pipes));
        Ok(process)
    }

    async fn upload_bytes(&mut self, contents: &[u8], destination: &str) -> Result<(), ExecError> {
        self.write_chunks(contents, &destination.replace('"', "`\"")).await
    }

    async fn download_file(
        &mut self,
        source: &str,
        destination: &std::path::Path,
    ) -> Result<(), ExecError> {
        let script = format!(
            "[Convert]::ToBase64String([IO.File]::ReadAllBytes({}))",
            ps_quote(source)
        );
        let output = self.spawn(&script, SpawnOptions::default()).await?.wait().await;
        if !output.success() {
            return Err(ExecError::file(
                "READ_ERROR",
                format!("Could not read '{source}': {}", output.stderr.trim()),
            ));
        }
        let contents = BASE64
            .decode(output.stdout.trim())
            .map_err(|e| ExecError::file("READ_ERROR", format!("Could not read '{source}': {e}")))?;
        tokio::fs::write(destination, contents).await.map_err(|e| {
            ExecError::file(
                "WRITE_ERROR",
                format!("Could not write '{}': {e}", destination.display()),
            )
        })
    }

    fn connection_type(&self) -> &'static str {
        "winrm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_api::TransportOptions;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target_for(server: &MockServer) -> Target {
        let address = server.address();
        let mut options = TransportOptions::default();
        options.ssl = false;
        Target::parse(&format!(
            "winrm://Administrator:secret@{}:{}",
            address.ip(),
            address.port()
        ))
        .unwrap()
        .with_options(options)
    }

    #[test]
    fn test_encode_command_is_utf16le() {
        // "a" as UTF-16LE is 0x61 0x00
        assert_eq!(encode_command("a"), BASE64.encode([0x61, 0x00]));
    }

    #[test]
    fn test_parse_receive() {
        let response = format!(
            concat!(
                "<s:Body><rsp:ReceiveResponse>",
                r#"<rsp:Stream Name="stdout" CommandId="C1">{}</rsp:Stream>"#,
                r#"<rsp:Stream Name="stderr" CommandId="C1">{}</rsp:Stream>"#,
                r#"<rsp:Stream Name="stdout" CommandId="C1" End="true"></rsp:Stream>"#,
                r#"<rsp:CommandState CommandId="C1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">"#,
                "<rsp:ExitCode>3</rsp:ExitCode></rsp:CommandState>",
                "</rsp:ReceiveResponse></s:Body>"
            ),
            BASE64.encode("hello\r\n"),
            BASE64.encode("oops"),
        );
        let received = parse_receive(&response).unwrap();
        assert_eq!(received.stdout, b"hello\r\n");
        assert_eq!(received.stderr, b"oops");
        assert!(received.done);
        assert_eq!(received.exit_code, Some(3));
    }

    #[test]
    fn test_endpoint_defaults() {
        let conn = WinrmConnection::new(Target::parse("winrm://win1").unwrap());
        assert_eq!(conn.endpoint().unwrap().as_str(), "https://win1:5986/wsman");

        let mut options = TransportOptions::default();
        options.ssl = false;
        let conn = WinrmConnection::new(Target::parse("winrm://win1").unwrap().with_options(options));
        assert_eq!(conn.endpoint().unwrap().as_str(), "http://win1:5985/wsman");
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/wsman"))
            .and(body_string_contains(ACTION_CREATE))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<s:Body><rsp:Shell><rsp:ShellId>SHELL-1</rsp:ShellId></rsp:Shell></s:Body>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains(ACTION_COMMAND))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<rsp:CommandResponse><rsp:CommandId>CMD-1</rsp:CommandId></rsp:CommandResponse>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains(ACTION_RECEIVE))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                concat!(
                    r#"<rsp:Stream Name="stdout" CommandId="CMD-1">{}</rsp:Stream>"#,
                    r#"<rsp:CommandState CommandId="CMD-1" State="x/CommandState/Done">"#,
                    "<rsp:ExitCode>0</rsp:ExitCode></rsp:CommandState>"
                ),
                BASE64.encode("win1\r\n")
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<s:Body/>"))
            .mount(&server)
            .await;

        let mut conn = WinrmConnection::new(target_for(&server));
        conn.connect().await.unwrap();
        let output = conn
            .spawn("hostname", SpawnOptions::default())
            .await
            .unwrap()
            .wait()
            .await;
        conn.disconnect().await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "win1\r\n");
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let mut conn = WinrmConnection::new(target_for(&server));
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::Connect {
                issue: ConnectIssue::Auth,
                ..
            }
        ));
    }
}
