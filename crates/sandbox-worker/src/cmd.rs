use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use sandbox::SandboxConfig;
use sandbox_python::PythonFactory;
use sandbox_worker::{Client, RunReply, WorkerConfig, WorkerError, WorkerResult, config};
use tracing::info;

#[derive(Args)]
pub struct ServeArgs {
    /// Worker config file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
pub struct RunArgs {
    /// Worker config file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source code to execute
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    code: Option<String>,

    /// File containing the source code to execute
    file: Option<PathBuf>,

    /// Give up waiting for the result after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

fn spawn_worker(config: WorkerConfig) -> (sandbox_worker::WorkerHandle, sandbox_worker::Events) {
    sandbox_worker::spawn(
        Arc::new(PythonFactory::new()),
        SandboxConfig::new(config.policy),
        config.queue_capacity,
    )
}

pub async fn run_serve(args: ServeArgs) -> WorkerResult<()> {
    let config = config::load_or_default(args.config.as_deref()).await?;
    info!(queue_capacity = config.queue_capacity, "serving on stdio");
    let (handle, events) = spawn_worker(config);
    sandbox_worker::serve(tokio::io::stdin(), tokio::io::stdout(), handle, events).await
}

pub async fn run_once(args: RunArgs) -> WorkerResult<ExitCode> {
    let config = config::load_or_default(args.config.as_deref()).await?;
    let code = match (args.code, args.file) {
        (Some(code), _) => code,
        (None, Some(path)) => read_source(&path).await?,
        (None, None) => return Err(WorkerError::Config("no code given".into())),
    };
    let timeout = args.timeout_secs.map(Duration::from_secs);

    let (handle, events) = spawn_worker(config);
    let mut client = Client::new(handle, events);
    client.wait_ready(timeout).await?;

    match client.run(code, timeout).await? {
        RunReply::Done(done) => {
            print!("{}", done.stdout);
            eprint!("{}", done.stderr);
            if let Some(value) = &done.result {
                println!("{value}");
            }
            Ok(if done.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        RunReply::Error(reason) => Err(WorkerError::Infrastructure(reason)),
    }
}

async fn read_source(path: &Path) -> WorkerResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| WorkerError::Config(format!("read {}: {e}", path.display())))
}
