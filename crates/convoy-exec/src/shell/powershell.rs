//! PowerShell command construction for WinRM and Windows ssh targets

use std::collections::BTreeSet;
use std::path::Path;

use convoy_api::{Action, InputMethod, Target, TargetResult, Task, envify_params};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::connection::{Connection, SpawnOptions};
use crate::error::ExecError;
use crate::output::CommandOutput;
use crate::shell::{basename, local_tree, snippets};
use crate::transport::RunOptions;

const DEFAULT_EXTENSIONS: [&str; 3] = [".ps1", ".rb", ".pp"];

#[derive(Debug, Clone)]
pub struct PowershellShell {
    target: Target,
    extensions: BTreeSet<String>,
}

impl PowershellShell {
    #[must_use]
    pub fn new(target: Target) -> Self {
        let options = &target.options;
        let extensions = DEFAULT_EXTENSIONS
            .iter()
            .map(|ext| (*ext).to_string())
            .chain(options.extensions.iter().cloned())
            .chain(options.interpreters.keys().cloned())
            .map(|ext| ext.to_lowercase())
            .collect();
        Self { target, extensions }
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// `powershell` for `.ps1` executables, `both` for anything else
    #[must_use]
    pub fn default_input_method(path: &Path) -> InputMethod {
        if is_powershell_file(path) {
            InputMethod::Powershell
        } else {
            InputMethod::Both
        }
    }

    /// Reject files whose extension is not allowed on this target
    ///
    /// # Errors
    /// Returns a `FILETYPE_ERROR` file error.
    pub fn validate_extension(&self, path: &Path) -> Result<(), ExecError> {
        let ext = extension(path);
        if self.extensions.contains(&ext) {
            return Ok(());
        }
        Err(ExecError::file(
            "FILETYPE_ERROR",
            format!(
                "File extension {ext} is not enabled, to run it please add to '{}: extensions'",
                self.target.transport
            ),
        ))
    }

    /// Escalation has no PowerShell counterpart
    fn reject_run_as(&self, options: &RunOptions) -> Result<(), ExecError> {
        if options.run_as.is_some() || self.target.options.run_as.is_some() {
            return Err(ExecError::Unsupported {
                transport: self.target.transport.name(),
                operation: "run-as with a PowerShell shell",
            });
        }
        Ok(())
    }

    /// Run a PowerShell script and collect its output
    async fn execute(
        &self,
        conn: &mut dyn Connection,
        script: &str,
    ) -> Result<CommandOutput, ExecError> {
        let process = conn.spawn(script, SpawnOptions::default()).await?;
        let output = process.wait().await;
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

    async fn make_tmpdir(&self, conn: &mut dyn Connection) -> Result<String, ExecError> {
        let parent = self
            .target
            .options
            .tmpdir
            .as_deref()
            .map_or_else(|| "[System.IO.Path]::GetTempPath()".to_string(), snippets::quote_string);
        let output = self.execute(conn, &snippets::make_tmpdir(&parent)).await?;
        if !output.success() {
            return Err(ExecError::file(
                "TEMPDIR_ERROR",
                format!("Could not make tmpdir: {}", output.stderr.trim()),
            ));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn rmdir(&self, conn: &mut dyn Connection, dir: &str) {
        if !self.target.options.cleanup {
            warn!(path = %dir, "skipping cleanup of tmpdir");
            return;
        }
        match self.execute(conn, &snippets::rmdir(dir)).await {
            Ok(output) if output.success() => debug!(path = %dir, "removed tmpdir"),
            Ok(output) => warn!(
                path = %dir,
                stderr = %output.stderr.trim(),
                "failed to clean up tmpdir"
            ),
            Err(e) => warn!(path = %dir, error = %e, "failed to clean up tmpdir"),
        }
    }

    async fn mkdirs(&self, conn: &mut dyn Connection, dirs: &[String]) -> Result<(), ExecError> {
        let output = self.execute(conn, &snippets::mkdirs(dirs)).await?;
        if !output.success() {
            return Err(ExecError::file(
                "MKDIR_ERROR",
                format!("Could not create directories: {}", output.stderr.trim()),
            ));
        }
        Ok(())
    }

    /// Exported before the command; names must be usable by
    /// `SetEnvironmentVariable`
    fn env_prefix(env_vars: &[(String, String)]) -> Result<String, ExecError> {
        let mut prefix = String::new();
        for (name, value) in env_vars {
            if name.is_empty() || name.contains('=') || name.contains('\0') {
                return Err(ExecError::EnvironmentVar { var: name.clone() });
            }
            prefix.push_str(&snippets::set_env(name, value));
        }
        Ok(prefix)
    }

    /// Interpreter and arguments that run `path`
    fn process_for(&self, path: &str) -> (String, Vec<String>) {
        let interpreter = self
            .target
            .options
            .interpreter_for(&extension(Path::new(path)))
            .unwrap_or_default();
        match interpreter.split_first() {
            Some((program, args)) => {
                let mut args = args.to_vec();
                args.push(path.to_string());
                (program.clone(), args)
            }
            None => process_from_extension(path),
        }
    }

    #[instrument(skip_all, fields(target = %self.target.safe_name()))]
    pub async fn run_command(
        &self,
        conn: &mut dyn Connection,
        command: &str,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        self.reject_run_as(options)?;
        let script = format!("{}{command}", Self::env_prefix(&options.env_pairs())?);
        let output = self.execute(conn, &script).await?;
        Ok(output.into_result(&self.target.safe_name(), Action::Command, command))
    }

    #[instrument(skip_all, fields(target = %self.target.safe_name(), script = %script.display()))]
    pub async fn run_script(
        &self,
        conn: &mut dyn Connection,
        script: &Path,
        arguments: &[String],
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        self.reject_run_as(options)?;
        self.validate_extension(script)?;
        let env = Self::env_prefix(&options.env_pairs())?;

        let dir = self.make_tmpdir(conn).await?;
        let result = async {
            let remote = windows_join(&dir, &basename(script));
            conn.upload_file(script, &remote).await?;

            let body = if is_powershell_file(Path::new(&remote))
                && self.target.options.interpreter_for(".ps1").is_none()
            {
                snippets::run_script(arguments, &remote)
            } else {
                let (program, mut args) = self.process_for(&remote);
                args.extend(escape_arguments(arguments));
                execute_process(&program, &args, None)
            };
            let output = self.execute(conn, &format!("{env}{body}")).await?;
            Ok::<_, ExecError>(output.into_result(
                &self.target.safe_name(),
                Action::Script,
                &script.display().to_string(),
            ))
        }
        .await;
        self.rmdir(conn, &dir).await;
        result
    }

    #[instrument(skip_all, fields(target = %self.target.safe_name(), task = %task.name))]
    pub async fn run_task(
        &self,
        conn: &mut dyn Connection,
        task: &Task,
        arguments: &Map<String, Value>,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        self.reject_run_as(options)?;
        let implementation = task.select_implementation(&self.target, &["powershell"])?;
        let executable = implementation.name.clone();
        self.validate_extension(Path::new(&executable))?;
        let input_method = implementation
            .input_method
            .unwrap_or_else(|| Self::default_input_method(Path::new(&executable)));

        let dir = self.make_tmpdir(conn).await?;
        let result = async {
            let mut arguments = arguments.clone();
            let task_dir = if implementation.files.is_empty() {
                dir.clone()
            } else {
                arguments.insert("_installdir".into(), Value::from(dir.as_str()));
                let task_dir = windows_join(&dir, &task.tasks_dir());
                let mut dirs = vec![task_dir.clone()];
                for file in &implementation.files {
                    if let Some(parent) = Path::new(&file.name).parent() {
                        let parent = windows_join(&dir, &parent.to_string_lossy());
                        if !dirs.contains(&parent) {
                            dirs.push(parent);
                        }
                    }
                }
                dirs.sort();
                self.mkdirs(conn, &dirs).await?;
                for file in &implementation.files {
                    conn.upload_file(&file.path, &windows_join(&dir, &file.name))
                        .await?;
                }
                task_dir
            };
            let remote_task = windows_join(&task_dir, &basename(Path::new(&executable)));
            conn.upload_file(&implementation.path, &remote_task).await?;

            debug!(arguments = ?arguments, "task arguments");
            let stdin = input_method
                .uses_stdin()
                .then(|| Value::Object(arguments.clone()).to_string());
            let env_vars = if input_method.uses_environment() {
                envify_params(&arguments)
            } else {
                Vec::new()
            };

            let mut script = String::from(snippets::SHELL_INIT);
            script.push_str(&Self::env_prefix(&env_vars)?);
            let is_ps1 = is_powershell_file(Path::new(&remote_task))
                && self.target.options.interpreter_for(".ps1").is_none();
            match &stdin {
                None if is_ps1 => {
                    if input_method == InputMethod::Powershell {
                        script.push_str(&snippets::ps_task(&remote_task, &arguments));
                    } else {
                        script.push_str(&snippets::try_catch(&remote_task));
                    }
                }
                _ => {
                    let (program, args) = self.process_for(&remote_task);
                    script.push_str(&execute_process(&program, &args, stdin.as_deref()));
                }
            }

            let output = self.execute(conn, &script).await?;
            Ok::<_, ExecError>(TargetResult::for_task(
                self.target.safe_name(),
                &task.name,
                &output.stdout,
                &output.stderr,
                output.exit_code,
                stdin.is_some(),
            ))
        }
        .await;
        self.rmdir(conn, &dir).await;
        result
    }

    #[instrument(skip_all, fields(target = %self.target.safe_name(), destination = %destination))]
    pub async fn upload(
        &self,
        conn: &mut dyn Connection,
        source: &Path,
        destination: &str,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        self.reject_run_as(options)?;
        if source.is_dir() {
            let (subdirs, files) = local_tree(source).map_err(|e| {
                ExecError::file(
                    "WRITE_ERROR",
                    format!("Could not read '{}': {e}", source.display()),
                )
            })?;
            let dirs: Vec<String> = std::iter::once(destination.to_string())
                .chain(
                    subdirs
                        .iter()
                        .map(|d| windows_join(destination, &d.to_string_lossy())),
                )
                .collect();
            self.mkdirs(conn, &dirs).await?;
            for file in &files {
                conn.upload_file(
                    &source.join(file),
                    &windows_join(destination, &file.to_string_lossy()),
                )
                .await?;
            }
        } else {
            conn.upload_file(source, destination).await?;
        }
        Ok(TargetResult::for_upload(
            self.target.safe_name(),
            &source.display().to_string(),
            destination,
        ))
    }

    #[instrument(skip_all, fields(target = %self.target.safe_name(), source = %source))]
    pub async fn download(
        &self,
        conn: &mut dyn Connection,
        source: &str,
        destination: &Path,
        options: &RunOptions,
    ) -> Result<TargetResult, ExecError> {
        self.reject_run_as(options)?;
        tokio::fs::create_dir_all(destination).await.map_err(|e| {
            ExecError::file(
                "WRITE_ERROR",
                format!("Could not create '{}': {e}", destination.display()),
            )
        })?;
        let name = source
            .rsplit(['\\', '/'])
            .find(|part| !part.is_empty())
            .unwrap_or(source);
        let local = destination.join(name);
        conn.download_file(source, &local).await?;
        Ok(TargetResult::for_download(
            self.target.safe_name(),
            source,
            &local.display().to_string(),
        ))
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn is_powershell_file(path: &Path) -> bool {
    extension(path) == ".ps1"
}

fn windows_join(dir: &str, name: &str) -> String {
    format!(
        "{}\\{}",
        dir.trim_end_matches('\\'),
        name.trim_start_matches('/').replace('/', "\\")
    )
}

/// Program and arguments that run a file by its extension
///
/// Unknown extensions go through `cmd.exe` so Windows file associations
/// decide.
fn process_from_extension(path: &str) -> (String, Vec<String>) {
    let quoted = format!("\"{path}\"");
    let (program, args): (&str, Vec<String>) = match extension(Path::new(path)).as_str() {
        ".rb" => ("ruby.exe", vec!["-S".into(), quoted]),
        ".ps1" => (
            "powershell.exe",
            ["-NoProfile", "-NonInteractive", "-NoLogo", "-ExecutionPolicy", "Bypass", "-File"]
                .into_iter()
                .map(String::from)
                .chain([quoted])
                .collect(),
        ),
        ".pp" => ("puppet.bat", vec!["apply".into(), quoted]),
        _ => ("cmd.exe", vec!["/c".into(), quoted]),
    };
    (program.to_string(), args)
}

/// Double-quote arguments containing spaces
fn escape_arguments(arguments: &[String]) -> Vec<String> {
    arguments
        .iter()
        .map(|arg| {
            if arg.contains(' ') {
                format!("\"{arg}\"")
            } else {
                arg.clone()
            }
        })
        .collect()
}

/// `& program args`, with stdin piped in from a here-string
fn execute_process(program: &str, arguments: &[String], stdin: Option<&str>) -> String {
    let quoted_path = if (program.starts_with('\'') && program.ends_with('\''))
        || (program.starts_with('"') && program.ends_with('"'))
    {
        program.to_string()
    } else {
        snippets::quote_string(program)
    };
    let quoted_args: Vec<String> = arguments.iter().map(|a| snippets::quote_string(a)).collect();
    let invocation = format!("& {quoted_path} {}", quoted_args.join(" "));
    let command = match stdin {
        Some(input) => format!("{} | {invocation}", snippets::here_string(input)),
        None => invocation,
    };
    snippets::execute_process(&command)
}
