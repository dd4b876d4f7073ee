//! zfsrepl
//!
//! Run commands and ZFS replication tasks on local or SSH transports

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::WrapErr;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zfsrepl_transport::{
    ExecError, ExecOptions, ObserverError, ReplicationProcess, Shell, Transport,
};

mod config;

use config::{Config, LoggingConfig, TaskConfig};

#[derive(Parser)]
#[command(name = "zfsrepl")]
#[command(about = "ZFS snapshot replication over local and SSH transports", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Transport to run on (a name from `[transports]`, or `local`)
    #[arg(long, short, global = true, default_value = "local")]
    transport: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and stream its output
    Exec {
        #[arg(trailing_var_arg = true, required = true)]
        args: Vec<String>,
    },
    /// List a directory
    Ls { path: String },
    /// Check whether a path exists (exit code 1 if not)
    Exists { path: String },
    /// Upload a local file
    Put {
        source: PathBuf,
        destination: String,
    },
    /// Run configured replication tasks
    Replicate {
        /// Only run the task with this id
        #[arg(long)]
        task: Option<String>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let path = Config::locate(cli.config);
    let config = match &path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    init_tracing(&config.logging);
    match &path {
        Some(path) => info!(path = %path.display(), "loaded configuration"),
        None => warn!("no config file found, using defaults"),
    }

    let code = match cli.command {
        Commands::Replicate { task } => replicate(&config, task.as_deref()).await?,
        command => {
            let shell = config.transport(&cli.transport)?.shell()?;
            let result = run_shell_command(&shell, command).await;
            if let Err(e) = shell.close().await {
                warn!(error = %e, "failed to close shell");
            }
            result?
        }
    };

    std::process::exit(code)
}

async fn run_shell_command(shell: &Shell, command: Commands) -> Result<i32> {
    match command {
        Commands::Exec { args } => exec(shell, &args).await,
        Commands::Ls { path } => {
            for entry in shell.ls(&path).await? {
                let suffix = if entry.is_dir { "/" } else { "" };
                println!("{}{suffix}", entry.name);
            }
            Ok(0)
        }
        Commands::Exists { path } => {
            let exists = shell.exists(&path).await?;
            println!("{exists}");
            Ok(if exists { 0 } else { 1 })
        }
        Commands::Put {
            source,
            destination,
        } => {
            let mut file = tokio::fs::File::open(&source)
                .await
                .wrap_err_with(|| format!("failed to open {}", source.display()))?;
            shell.put_file(&mut file, &destination).await?;
            info!(source = %source.display(), destination, "uploaded");
            Ok(0)
        }
        Commands::Replicate { .. } => {
            eyre::bail!("replicate runs on the transports named by each task")
        }
    }
}

async fn exec(shell: &Shell, args: &[String]) -> Result<i32> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(line) = rx.recv().await {
            let _ = stdout.write_all(line.as_bytes());
            let _ = stdout.flush();
        }
    });

    let mut execution = shell
        .exec_async(args, ExecOptions::new().with_stdout(tx))
        .await?;
    let stop = execution.stop_handle();

    let outcome = tokio::select! {
        outcome = execution.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            stop.stop();
            execution.wait().await
        }
    };
    let _ = printer.await;

    match outcome {
        Ok(_) => Ok(0),
        Err(ExecError::CommandFailed { exit_code, output }) => {
            eprint!("{output}");
            Ok(exit_code)
        }
        Err(e) => Err(e.into()),
    }
}

async fn replicate(config: &Config, id: Option<&str>) -> Result<i32> {
    let tasks = config.select_tasks(id)?;
    if tasks.is_empty() {
        warn!("no replication tasks configured");
    }

    let mut failed = 0;
    for task in tasks {
        if let Err(e) = replicate_one(config, task).await {
            eprintln!("{}: {e:#}", task.task.id);
            failed += 1;
        }
    }
    Ok(i32::from(failed > 0))
}

async fn replicate_one(config: &Config, task: &TaskConfig) -> Result<()> {
    let transport = config.transport(&task.transport)?;
    let local_shell = Transport::Local.shell()?;
    let remote_shell = transport.shell()?;

    let mut process = transport.replication_process(
        local_shell.clone(),
        remote_shell.clone(),
        task.task.clone(),
    );
    add_progress_printer(&process);

    let outcome = run_to_end(&mut process).await;

    for shell in [&local_shell, &remote_shell] {
        if let Err(e) = shell.close().await {
            warn!(shell = shell.id(), error = %e, "failed to close shell");
        }
    }
    outcome.wrap_err("replication failed")
}

async fn run_to_end(process: &mut ReplicationProcess) -> Result<(), ExecError> {
    process.run().await?;
    let stop = process.stop_handle();

    tokio::select! {
        outcome = process.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            stop.stop();
            process.wait().await
        }
    }
}

fn add_progress_printer(process: &ReplicationProcess) {
    let id = process.task().id.clone();
    process.add_progress_observer(
        move |snapshot: &str, current: u64, total: u64| -> Result<(), ObserverError> {
            let mut stderr = std::io::stderr();
            if total == 0 {
                writeln!(stderr, "{id} {snapshot}: {current} bytes")?;
            } else {
                let percent = current.saturating_mul(100) / total;
                writeln!(stderr, "{id} {snapshot}: {current}/{total} bytes ({percent}%)")?;
            }
            Ok(())
        },
    );
}
