//! POSIX shell command construction
//!
//! Builds `sh` command lines for ssh, local, docker, podman and lxd
//! targets: sudo wrapping, temp directory staging, task input methods
//! and interpreter selection.

use std::path::Path;

use convoy_api::{Action, InputMethod, Target, TargetResult, Task, envify_params};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::command::{Command, join, quote};
use crate::connection::{Connection, SpawnOptions};
use crate::error::ExecError;
use crate::output::{CommandOutput, Output};
use crate::process::ProcessEvent;
use crate::shell::escalate::{Escalation, EscalationAction, SUDO_PROMPT, Stream};
use crate::shell::tmpdir::RemoteTempDir;
use crate::shell::{basename, local_tree};
use crate::transport::RunOptions;

/// How one command should be run
#[derive(Debug, Default)]
pub(crate) struct Exec {
    /// User to escalate to; `None` runs as the login user
    pub run_as: Option<String>,
    pub stdin: Option<String>,
    pub env_vars: Vec<(String, String)>,
    pub interpreter: Vec<String>,
}

impl Exec {
    pub(crate) fn escalated(user: &str) -> Self {
        Self {
            run_as: Some(user.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct BashShell {
    target: Target,
}

impl BashShell {
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self { target }
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    fn run_as(&self, options: &RunOptions) -> Option<String> {
        options
            .run_as
            .clone()
            .or_else(|| self.target.options.run_as.clone())
    }

    fn sudo_password(&self) -> Option<String> {
        self.target
            .options
            .sudo_password
            .clone()
            .or_else(|| self.target.password().map(str::to_string))
    }

    fn interpreter_for(&self, path: &str) -> Vec<String> {
        Path::new(path)
            .extension()
            .and_then(|ext| self.target.options.interpreter_for(&ext.to_string_lossy()))
            .unwrap_or_default()
    }

    fn sudo_command(&self, run_as: &str, preserve_env: bool) -> String {
        let options = &self.target.options;
        if let Some(custom) = &options.run_as_command {
            let argv: Vec<&str> = custom
                .iter()
                .map(String::as_str)
                .chain([run_as])
                .collect();
            return join(&argv);
        }

        let sudo = options.sudo_executable.as_deref().unwrap_or("sudo");
        let mut flags = vec![sudo, "-S", "-H", "-u", run_as, "-p", SUDO_PROMPT];
        if preserve_env {
            flags.push("-E");
        }
        join(&flags)
    }

    /// Run one command, escalating and answering sudo as needed
    ///
    /// # Errors
    /// Returns an escalation error when sudo rejects the login user or
    /// password, and connection errors from spawning.
    pub(crate) async fn execute(
        &self,
        conn: &mut dyn Connection,
        command: Command,
        exec: Exec,
    ) -> Result<CommandOutput, ExecError> {
        let options = &self.target.options;
        let login_user = conn.user().map(str::to_string);
        let run_as = exec
            .run_as
            .filter(|user| login_user.as_deref() != Some(user.as_str()));
        let use_sudo = run_as.is_some() && options.run_as_command.is_none();
        let sudo_id = (use_sudo && exec.stdin.is_some())
            .then(|| format!("convoy-sudo-{}", uuid::Uuid::new_v4().simple()));

        let mut command_str = command.with_interpreter(&exec.interpreter).to_shell_string();
        if let Some(user) = &run_as {
            let sudo_str = self.sudo_command(user, !exec.env_vars.is_empty());
            command_str =
                build_sudoable_command_str(&command_str, &sudo_str, sudo_id.as_deref(), conn.reset_cwd());
        }
        if !exec.env_vars.is_empty() {
            let decls: Vec<String> = exec
                .env_vars
                .iter()
                .map(|(key, value)| format!("{key}={}", quote(value)))
                .collect();
            command_str = format!("{} {command_str}", decls.join(" "));
        }

        debug!(command = %command_str, "executing");
        let mut process = conn
            .spawn(&command_str, SpawnOptions { tty: options.tty })
            .await?;

        let mut escalation = if use_sudo {
            Escalation::new(
                login_user.unwrap_or_default(),
                self.target.safe_name(),
                self.sudo_password(),
                sudo_id,
            )
        } else {
            Escalation::disabled()
        };

        let mut pending_stdin = None;
        if use_sudo {
            pending_stdin = exec.stdin;
        } else {
            if let Some(stdin) = exec.stdin {
                process.write_stdin(stdin).await?;
            }
            process.close_stdin().await;
        }

        let mut output = Output::new();
        while let Some(event) = process.next_event().await {
            let (stream, data) = match event {
                ProcessEvent::Stdout(data) => (Stream::Stdout, data),
                ProcessEvent::Stderr(data) => (Stream::Stderr, data),
                ProcessEvent::Exit(code) => {
                    output.set_exit_code(code);
                    continue;
                }
            };

            let (kept, actions) = escalation.feed(stream, &data);
            match stream {
                Stream::Stdout => output.push_stdout(&kept),
                Stream::Stderr => output.push_stderr(&kept),
            }

            for action in actions {
                match action {
                    EscalationAction::SendPassword(password) => {
                        process.write_stdin(password).await?;
                    }
                    EscalationAction::ReleaseStdin => {
                        if let Some(stdin) = pending_stdin.take() {
                            process.write_stdin(format!("{stdin}\n")).await?;
                        }
                        process.close_stdin().await;
                    }
                    EscalationAction::Fail(error) => {
                        process.kill();
                        return Err(error);
                    }
                }
            }
        }
        output.push_stdout(&escalation.finish(Stream::Stdout));
        output.push_stderr(&escalation.finish(Stream::Stderr));

        let output = output.freeze();
        if output.success() {
            debug!(target = %self.target.safe_name(), "command returned successfully");
        } else {
            info!(
                target = %self.target.safe_name(),
                exit_code = output.exit_code,
                "command failed"
            );
        }
        Ok(output)
    }

    /// Upload a file and mark it executable
    async fn write_executable(
        &self,
        conn: &mut dyn Connection,
        source: &Path,
        destination: &str,
    ) -> Result<(), ExecError> {
        conn.upload_file(source, destination).await?;
        self.make_executable(conn, destination).await
    }

    async fn make_executable(&self, conn: &mut dyn Connection, path: &str) -> Result<(), ExecError> {
        let output = self
            .execute(conn, Command::argv(["chmod", "u+x", path]), Exec::default())
            .await?;
        if !output.success() {
            return Err(ExecError::file(
                "CHMOD_ERROR",
                format!(
                    "Could not make file '{path}' executable: {}",
                    output.stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(target = %self.target.safe_name()))]
    pub async fn run_command(
        &self,
        conn: &mut dyn Connection,
        command: &Command,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let exec = Exec {
            run_as: self.run_as(options),
            env_vars: options.env_pairs(),
            ..Exec::default()
        };
        // variables prefixed to a raw string would be expanded before they are set
        let wrapped = match command {
            Command::Shell(text) if !exec.env_vars.is_empty() => {
                Command::argv(["sh", "-c", text.as_str()])
            }
            other => other.clone(),
        };
        let output = self.execute(conn, wrapped, exec).await?;
        Ok(output.into_result(&self.target.safe_name(), Action::Command, &command.to_string()))
    }

    #[instrument(skip_all, fields(target = %self.target.safe_name(), script = %script.display()))]
    pub async fn run_script(
        &self,
        conn: &mut dyn Connection,
        script: &Path,
        arguments: &[String],
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let mut dir = RemoteTempDir::create(self, conn).await?;
        let result = self
            .script_in(conn, &mut dir, script, arguments, options)
            .await;
        dir.cleanup(self, conn).await;
        result
    }

    async fn script_in(
        &self,
        conn: &mut dyn Connection,
        dir: &mut RemoteTempDir,
        script: &Path,
        arguments: &[String],
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let run_as = self.run_as(options);
        let remote = dir.file(&basename(script));
        self.write_executable(conn, script, &remote).await?;
        dir.chown(self, conn, run_as.as_deref()).await?;

        let argv = std::iter::once(remote.clone()).chain(arguments.iter().cloned());
        let exec = Exec {
            run_as,
            env_vars: options.env_pairs(),
            interpreter: self.interpreter_for(&remote),
            ..Exec::default()
        };
        let output = self.execute(conn, Command::argv(argv), exec).await?;
        Ok(output.into_result(
            &self.target.safe_name(),
            Action::Script,
            &script.display().to_string(),
        ))
    }

    #[instrument(skip_all, fields(target = %self.target.safe_name(), task = %task.name))]
    pub async fn run_task(
        &self,
        conn: &mut dyn Connection,
        task: &Task,
        arguments: &Map<String, Value>,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let mut dir = RemoteTempDir::create(self, conn).await?;
        let result = self.task_in(conn, &mut dir, task, arguments, options).await;
        dir.cleanup(self, conn).await;
        result
    }

    async fn task_in(
        &self,
        conn: &mut dyn Connection,
        dir: &mut RemoteTempDir,
        task: &Task,
        arguments: &Map<String, Value>,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let implementation = task.select_implementation(&self.target, &["shell"])?;
        let input_method = implementation.input_method.unwrap_or(InputMethod::Both);
        let run_as = self.run_as(options);
        let mut arguments = arguments.clone();
        let executable = basename(Path::new(&implementation.name));

        let remote_task = if implementation.files.is_empty() {
            dir.file(&executable)
        } else {
            arguments.insert("_installdir".into(), Value::from(dir.path()));
            let task_dir = dir.file(&task.tasks_dir());
            let mut subdirs = vec![task_dir.clone()];
            for file in &implementation.files {
                if let Some(parent) = Path::new(&file.name).parent() {
                    let parent = parent.to_string_lossy();
                    let subdir = dir.file(&parent);
                    if !parent.is_empty() && !subdirs.contains(&subdir) {
                        subdirs.push(subdir);
                    }
                }
            }
            dir.mkdirs(self, conn, &subdirs).await?;
            for file in &implementation.files {
                conn.upload_file(&file.path, &dir.file(&file.name)).await?;
            }
            format!("{task_dir}/{executable}")
        };
        self.write_executable(conn, &implementation.path, &remote_task)
            .await?;

        debug!(arguments = ?arguments, "task arguments");
        let stdin = input_method
            .uses_stdin()
            .then(|| Value::Object(arguments.clone()).to_string());
        let env_vars = if input_method.uses_environment() {
            envify_params(&arguments)
        } else {
            Vec::new()
        };
        let interpreter = self.interpreter_for(&remote_task);

        let (command, stdin, interpreter) = match stdin {
            Some(payload) if self.target.options.tty => {
                // a pty cannot take piped input, so embed it in a wrapper
                let wrapper = dir.file("wrapper.sh");
                let invocation: Vec<&str> = interpreter
                    .iter()
                    .map(String::as_str)
                    .chain([remote_task.as_str()])
                    .collect();
                let contents = format!(
                    "#!/bin/sh\n{} <<'EOF'\n{payload}\nEOF\n",
                    join(&invocation)
                );
                conn.upload_bytes(contents.as_bytes(), &wrapper).await?;
                self.make_executable(conn, &wrapper).await?;
                (Command::argv([wrapper]), None, Vec::new())
            }
            stdin => (Command::argv([remote_task]), stdin, interpreter),
        };

        dir.chown(self, conn, run_as.as_deref()).await?;
        let output = self
            .execute(
                conn,
                command,
                Exec {
                    run_as,
                    stdin,
                    env_vars,
                    interpreter,
                },
            )
            .await?;

        Ok(TargetResult::for_task(
            self.target.safe_name(),
            &task.name,
            &output.stdout,
            &output.stderr,
            output.exit_code,
            input_method.uses_stdin(),
        ))
    }

    #[instrument(skip_all, fields(target = %self.target.safe_name(), destination = %destination))]
    pub async fn upload(
        &self,
        conn: &mut dyn Connection,
        source: &Path,
        destination: &str,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let mut dir = RemoteTempDir::create(self, conn).await?;
        let result = self
            .upload_in(conn, &mut dir, source, destination, options)
            .await;
        dir.cleanup(self, conn).await;
        result
    }

    async fn upload_in(
        &self,
        conn: &mut dyn Connection,
        dir: &mut RemoteTempDir,
        source: &Path,
        destination: &str,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        let run_as = self.run_as(options);
        let staged = dir.file(&basename(Path::new(destination)));

        if source.is_dir() {
            let (subdirs, files) = local_tree(source).map_err(|e| {
                ExecError::file(
                    "WRITE_ERROR",
                    format!("Could not read '{}': {e}", source.display()),
                )
            })?;
            let remote_dirs: Vec<String> = std::iter::once(staged.clone())
                .chain(subdirs.iter().map(|d| format!("{staged}/{}", d.display())))
                .collect();
            dir.mkdirs(self, conn, &remote_dirs).await?;
            for file in &files {
                conn.upload_file(&source.join(file), &format!("{staged}/{}", file.display()))
                    .await?;
            }
        } else {
            conn.upload_file(source, &staged).await?;
        }

        dir.chown(self, conn, run_as.as_deref()).await?;
        let exec = Exec {
            run_as,
            ..Exec::default()
        };
        let output = self
            .execute(conn, Command::argv(["mv", "-f", staged.as_str(), destination]), exec)
            .await?;
        if !output.success() {
            return Err(ExecError::file(
                "MV_ERROR",
                format!(
                    "Could not move temporary file '{staged}' to {destination}: {}",
                    output.stderr.trim()
                ),
            ));
        }

        Ok(TargetResult::for_upload(
            self.target.safe_name(),
            &source.display().to_string(),
            destination,
        ))
    }

    /// Fetch `source` into `destination/<basename>`
    ///
    /// When escalating, the file is first copied into a temp directory as
    /// the run-as user and handed back to the login user.
    #[instrument(skip_all, fields(target = %self.target.safe_name(), source = %source))]
    pub async fn download(
        &self,
        conn: &mut dyn Connection,
        source: &str,
        destination: &Path,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        tokio::fs::create_dir_all(destination).await.map_err(|e| {
            ExecError::file(
                "WRITE_ERROR",
                format!("Could not create '{}': {e}", destination.display()),
            )
        })?;
        let local = destination.join(basename(Path::new(source)));

        let run_as = self
            .run_as(options)
            .filter(|user| conn.user() != Some(user.as_str()));
        match run_as {
            None => conn.download_file(source, &local).await?,
            Some(run_as) => {
                let mut dir = RemoteTempDir::create(self, conn).await?;
                let result = self
                    .download_via(conn, &mut dir, source, &local, &run_as)
                    .await;
                dir.cleanup(self, conn).await;
                result?;
            }
        }

        Ok(TargetResult::for_download(
            self.target.safe_name(),
            source,
            &local.display().to_string(),
        ))
    }

    async fn download_via(
        &self,
        conn: &mut dyn Connection,
        dir: &mut RemoteTempDir,
        source: &str,
        local: &Path,
        run_as: &str,
    ) -> Result<(), ExecError> {
        dir.chown(self, conn, Some(run_as)).await?;
        let staged = dir.file(&basename(Path::new(source)));
        let output = self
            .execute(
                conn,
                Command::argv(["cp", "-R", source, staged.as_str()]),
                Exec::escalated(run_as),
            )
            .await?;
        if !output.success() {
            return Err(ExecError::file(
                "COPY_ERROR",
                format!(
                    "Could not copy file '{source}' to temporary directory '{dir}': {}",
                    output.stderr.trim()
                ),
            ));
        }

        let login_user = conn.user().map(str::to_string);
        dir.chown(self, conn, login_user.as_deref()).await?;
        conn.download_file(&staged, local).await
    }
}

/// Wrap an escalated command, echoing the correlation id first when stdin
/// must wait for sudo to finish
fn build_sudoable_command_str(
    command: &str,
    sudo: &str,
    sudo_id: Option<&str>,
    reset_cwd: bool,
) -> String {
    let cd = if reset_cwd { "cd; " } else { "" };
    match sudo_id {
        Some(id) => format!(
            "{sudo} sh -c {}",
            quote(&format!("{cd}echo {id} 1>&2; {command}"))
        ),
        None if reset_cwd => format!("{sudo} sh -c {}", quote(&format!("cd; {command}"))),
        None => format!("{sudo} {command}"),
    }
}
