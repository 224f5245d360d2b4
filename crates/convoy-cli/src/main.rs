//! convoy CLI
//!
//! Runs commands, scripts, tasks and file transfers across targets and
//! prints the results as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use convoy_api::{Inventory, ResultSet, Target, Task, TaskMetadata};
use convoy_core::{Context, Executor, StaticInventory, TransportRegistry};
use convoy_exec::RunOptions;
use eyre::{WrapErr, bail};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Exit status when at least one target failed
const FAILURE_EXIT_CODE: i32 = 2;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Run commands, scripts and tasks across many targets", long_about = None)]
struct Cli {
    /// Inventory file (default: $CONVOY_INVENTORY, ./inventory.toml, config dir)
    #[arg(long, global = true)]
    inventory: Option<PathBuf>,

    /// Maximum number of targets worked on at once
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Log filter such as `info` or `convoy_exec=debug`; falls back to RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Args)]
struct TargetArgs {
    /// Comma separated target names, groups or URIs
    #[arg(short, long)]
    targets: String,

    /// User to run as on the targets
    #[arg(long)]
    run_as: Option<String>,

    /// Environment variable for commands and scripts, as KEY=VALUE
    #[arg(long = "env", value_parser = parse_key_val)]
    env_vars: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shell command
    #[command(subcommand)]
    Command(CommandCmd),
    /// Upload and run a local script
    #[command(subcommand)]
    Script(ScriptCmd),
    /// Run a task
    #[command(subcommand)]
    Task(TaskCmd),
    /// Copy files to or from targets
    #[command(subcommand)]
    File(FileCmd),
}

#[derive(Subcommand)]
enum CommandCmd {
    Run {
        command: String,
        #[command(flatten)]
        targets: TargetArgs,
    },
}

#[derive(Subcommand)]
enum ScriptCmd {
    Run {
        script: PathBuf,
        /// Arguments passed to the script
        #[arg(last = true)]
        arguments: Vec<String>,
        #[command(flatten)]
        targets: TargetArgs,
    },
}

#[derive(Subcommand)]
enum TaskCmd {
    Run {
        /// Task name, such as `package::install`
        name: String,
        /// Task executable
        #[arg(long)]
        executable: PathBuf,
        /// Task metadata JSON (default: executable path with a .json extension)
        #[arg(long)]
        metadata: Option<PathBuf>,
        /// Extra file shipped with the task, as NAME=PATH
        #[arg(long = "file", value_parser = parse_key_val)]
        files: Vec<(String, String)>,
        /// Task parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        #[command(flatten)]
        targets: TargetArgs,
    },
}

#[derive(Subcommand)]
enum FileCmd {
    Upload {
        source: PathBuf,
        destination: String,
        #[command(flatten)]
        targets: TargetArgs,
    },
    /// Download into `<destination>/<target>/`
    Download {
        source: String,
        destination: PathBuf,
        #[command(flatten)]
        targets: TargetArgs,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

fn init_tracing(level: Option<&str>, format: LogFormat) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

struct Runner {
    inventory: StaticInventory,
    executor: Executor,
}

impl Runner {
    fn new(inventory: StaticInventory, concurrency: Option<usize>) -> Self {
        let registry = TransportRegistry::with_defaults(Arc::new(inventory.clone()));
        let mut context = Context::new();
        if let Some(n) = concurrency.or(inventory.concurrency()) {
            context = context.with_concurrency(n);
        }
        Self {
            inventory,
            executor: Executor::new(registry, context),
        }
    }

    fn resolve(&self, args: &TargetArgs) -> Result<(Vec<Target>, RunOptions)> {
        let targets = self.inventory.get_targets(&args.targets)?;
        if targets.is_empty() {
            bail!("no targets matched '{}'", args.targets);
        }
        info!(pattern = %args.targets, targets = targets.len(), "resolved targets");
        let options = RunOptions {
            run_as: args.run_as.clone(),
            env_vars: args.env_vars.iter().cloned().collect(),
            description: None,
        };
        Ok((targets, options))
    }

    async fn run(&self, command: Commands) -> Result<ResultSet> {
        let results = match command {
            Commands::Command(CommandCmd::Run { command, targets }) => {
                let (targets, options) = self.resolve(&targets)?;
                self.executor
                    .run_command(&targets, command.as_str(), &options)
                    .await
            }
            Commands::Script(ScriptCmd::Run {
                script,
                arguments,
                targets,
            }) => {
                let (targets, options) = self.resolve(&targets)?;
                self.executor
                    .run_script(&targets, &script, &arguments, &options)
                    .await
            }
            Commands::Task(TaskCmd::Run {
                name,
                executable,
                metadata,
                files,
                params,
                targets,
            }) => {
                let task = load_task(&name, &executable, metadata.as_deref(), &files)?;
                let arguments = match serde_json::from_str::<Value>(&params)
                    .wrap_err("--params is not valid JSON")?
                {
                    Value::Object(map) => map,
                    _ => bail!("--params must be a JSON object"),
                };
                let (targets, options) = self.resolve(&targets)?;
                self.executor
                    .run_task(&targets, &task, &arguments, &options)
                    .await
            }
            Commands::File(FileCmd::Upload {
                source,
                destination,
                targets,
            }) => {
                let (targets, options) = self.resolve(&targets)?;
                self.executor
                    .upload(&targets, &source, &destination, &options)
                    .await
            }
            Commands::File(FileCmd::Download {
                source,
                destination,
                targets,
            }) => {
                let (targets, options) = self.resolve(&targets)?;
                self.executor
                    .download(&targets, &source, &destination, &options)
                    .await
            }
        };
        Ok(results)
    }
}

fn load_task(
    name: &str,
    executable: &Path,
    metadata: Option<&Path>,
    files: &[(String, String)],
) -> Result<Task> {
    if !executable.is_file() {
        bail!("task executable {} does not exist", executable.display());
    }

    let sibling = executable.with_extension("json");
    let metadata_path = match metadata {
        Some(path) => Some(path.to_path_buf()),
        None if sibling.is_file() => Some(sibling),
        None => None,
    };
    let metadata: TaskMetadata = match metadata_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .wrap_err_with(|| format!("invalid task metadata in {}", path.display()))?
        }
        None => TaskMetadata::default(),
    };

    let mut task = Task::new(name, executable).with_metadata(metadata);
    for (file_name, path) in files {
        task = task.with_file(file_name.as_str(), path.as_str());
    }
    Ok(task)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref(), cli.log_format)?;

    let inventory = StaticInventory::load_default(cli.inventory.as_deref())
        .wrap_err("failed to load inventory")?;
    debug!(concurrency = ?inventory.concurrency(), "inventory loaded");
    let runner = Runner::new(inventory, cli.concurrency);
    let results = runner.run(cli.command).await?;

    println!("{}", serde_json::to_string_pretty(&results)?);

    if !results.ok() {
        std::process::exit(FAILURE_EXIT_CODE);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_cli_shapes() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from([
            "convoy",
            "command",
            "run",
            "uptime",
            "--targets",
            "web1,web2",
            "--env",
            "A=1",
        ])
        .unwrap();
        let Commands::Command(CommandCmd::Run { command, targets }) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(command, "uptime");
        assert_eq!(targets.targets, "web1,web2");
        assert_eq!(targets.env_vars, vec![("A".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_load_task_reads_sibling_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("install.sh");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("install.json"), r#"{"input_method": "environment"}"#).unwrap();

        let task = load_task("pkg::install", &exe, None, &[]).unwrap();
        assert_eq!(
            task.metadata.input_method,
            Some(convoy_api::InputMethod::Environment)
        );
    }
}
