//! Atomic tool execution.
//!
//! A [`ToolExecutor`] runs one tool against a resolved job whose files have
//! already been materialized locally. [`ProcessToolExecutor`] runs the tool's
//! command line as a child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use orchid_config::{Record, ToolDef};
use serde_json::Value;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ToolError;

/// Environment variable holding the path of the job document.
pub const JOB_ENV: &str = "ORCHID_JOB";

/// Name of the document a tool may write instead of printing its outputs.
pub const OUTPUT_DOCUMENT: &str = "cwl.output.json";

/// Isolated scratch directories for one running task.
#[derive(Debug, Clone)]
pub struct ScratchDirs {
  root: PathBuf,
  /// Materialized input files.
  pub inp: PathBuf,
  /// Working directory; files the tool produces go here.
  pub out: PathBuf,
  pub tmp: PathBuf,
}

impl ScratchDirs {
  /// Create `inp/`, `out/` and `tmp/` under `root`.
  pub async fn create(root: impl Into<PathBuf>) -> std::io::Result<Self> {
    let root = root.into();
    let out = root.join("out");
    Self::create_with_output(root, out).await
  }

  /// Like [`ScratchDirs::create`], but with `out/` placed at `out`.
  ///
  /// `out` survives [`ScratchDirs::remove`].
  pub async fn create_with_output(
    root: impl Into<PathBuf>,
    out: impl Into<PathBuf>,
  ) -> std::io::Result<Self> {
    let root = root.into();
    let dirs = Self {
      inp: root.join("inp"),
      out: out.into(),
      tmp: root.join("tmp"),
      root,
    };
    for dir in [&dirs.inp, &dirs.out, &dirs.tmp] {
      fs::create_dir_all(dir).await?;
    }
    Ok(dirs)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Remove the scratch tree.
  pub async fn remove(self) -> std::io::Result<()> {
    fs::remove_dir_all(&self.root).await
  }
}

/// Runs atomic tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
  /// Run `tool` on `inputs`, returning its output record.
  ///
  /// File paths in `inputs` are local. File paths in the returned record may
  /// be relative to `dirs.out`.
  async fn execute(
    &self,
    tool: &ToolDef,
    inputs: &Record,
    dirs: &ScratchDirs,
  ) -> Result<Record, ToolError>;
}

/// Runs a tool's `baseCommand` and `arguments` as a child process.
///
/// The process runs in `out/` with `TMPDIR` pointing at `tmp/`. The job is
/// written to `tmp/job.json` and its path exported as [`JOB_ENV`]. Outputs
/// are read from `out/cwl.output.json` if the tool wrote one, else from
/// stdout. The child is killed if the task running it is aborted.
#[derive(Debug, Default)]
pub struct ProcessToolExecutor {
  no_container: bool,
  warned_container: AtomicBool,
}

impl ProcessToolExecutor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Silence the warning for tools that request a container.
  pub fn without_containers(mut self) -> Self {
    self.no_container = true;
    self
  }
}

#[async_trait]
impl ToolExecutor for ProcessToolExecutor {
  async fn execute(
    &self,
    tool: &ToolDef,
    inputs: &Record,
    dirs: &ScratchDirs,
  ) -> Result<Record, ToolError> {
    if !self.no_container
      && tool.has_requirement("DockerRequirement")
      && !self.warned_container.swap(true, Ordering::Relaxed)
    {
      warn!("DockerRequirement is ignored; tools run directly on the host");
    }

    let command = tool
      .base_command
      .as_ref()
      .map(|c| c.as_slice())
      .unwrap_or_default();
    let Some((program, args)) = command.split_first() else {
      return Err(ToolError::NoCommand);
    };

    let job_path = dirs.tmp.join("job.json");
    let job = serde_json::to_vec_pretty(inputs).map_err(|e| ToolError::InvalidOutput {
      message: format!("job is not serializable: {}", e),
    })?;
    fs::write(&job_path, job).await?;

    debug!(command = %program, args = ?args, arguments = ?tool.arguments, "starting tool process");

    let output = Command::new(program)
      .args(args)
      .args(&tool.arguments)
      .current_dir(&dirs.out)
      .env("TMPDIR", &dirs.tmp)
      .env(JOB_ENV, &job_path)
      .stdin(Stdio::null())
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|source| ToolError::Spawn {
        command: program.clone(),
        source,
      })?;

    if !output.status.success() {
      return Err(ToolError::Failed {
        status: output.status.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }

    let document = dirs.out.join(OUTPUT_DOCUMENT);
    let raw = if fs::try_exists(&document).await? {
      fs::read(&document).await?
    } else {
      output.stdout
    };

    parse_outputs(&raw)
  }
}

/// Parse a tool's output document. Empty output is an empty record.
fn parse_outputs(raw: &[u8]) -> Result<Record, ToolError> {
  if raw.iter().all(u8::is_ascii_whitespace) {
    return Ok(Record::new());
  }
  match serde_json::from_slice(raw) {
    Ok(Value::Object(record)) => Ok(record),
    Ok(other) => Err(ToolError::InvalidOutput {
      message: format!("expected a JSON object, got {}", other),
    }),
    Err(e) => Err(ToolError::InvalidOutput {
      message: e.to_string(),
    }),
  }
}
