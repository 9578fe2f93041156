use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use orchid_artifact::FsStore;
use orchid_runtime::{ProcessToolExecutor, Run, RunConfig};

/// Orchid - run a workflow description against a job document
#[derive(Parser)]
#[command(name = "orchid")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the process description (JSON or YAML)
  process: PathBuf,

  /// Path to the job document holding the input values (JSON or YAML)
  job: PathBuf,

  /// Directory for output files and the output document
  #[arg(long, default_value = ".")]
  outdir: PathBuf,

  /// Base directory for relative file paths in the job (default: the job
  /// file's directory)
  #[arg(long)]
  basedir: Option<PathBuf>,

  /// Path to the durable file store (default: ~/.orchid/store)
  #[arg(long)]
  store: Option<PathBuf>,

  /// Scratch directory for running tasks (default: a fresh temp directory)
  #[arg(long)]
  workdir: Option<PathBuf>,

  /// Only log warnings and errors
  #[arg(long)]
  quiet: bool,

  /// Never use containers, even when a tool asks for one
  #[arg(long)]
  no_container: bool,

  /// Run a single tool directly, without staging or scheduling
  #[arg(long)]
  conformance_test: bool,

  /// Keep the run's files in the store after the outputs are written
  #[arg(long)]
  keep_intermediates: bool,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.quiet { "warn" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
    )
    .with_writer(std::io::stderr)
    .init();

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_async(cli).await })
}

async fn run_async(cli: Cli) -> Result<()> {
  let store_dir = match cli.store {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".orchid")
      .join("store"),
  };

  // a temp workdir is removed when `scratch` drops at the end of the run
  let scratch;
  let workdir = match cli.workdir {
    Some(dir) => dir,
    None => {
      scratch = tempfile::tempdir().context("failed to create scratch directory")?;
      scratch.path().to_path_buf()
    }
  };

  let config = RunConfig {
    outdir: cli.outdir,
    basedir: cli.basedir,
    workdir,
    conformance_test: cli.conformance_test,
    keep_intermediates: cli.keep_intermediates,
  };

  let mut tools = ProcessToolExecutor::new();
  if cli.no_container {
    tools = tools.without_containers();
  }

  let run = Run::new(config, Arc::new(FsStore::new(store_dir)), Arc::new(tools));

  let cancel = CancellationToken::new();
  let on_interrupt = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      on_interrupt.cancel();
    }
  });

  let output = run
    .execute(&cli.process, &cli.job, &cancel)
    .await
    .with_context(|| format!("failed to run {}", cli.process.display()))?;

  println!("{}", serde_json::to_string_pretty(&output)?);

  Ok(())
}
