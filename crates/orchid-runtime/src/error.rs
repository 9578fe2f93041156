//! Runtime error types.

use std::path::PathBuf;

use orchid_config::ConfigError;
use orchid_workflow::{FileRefError, PromiseError, RequirementError, SchedulerError};

/// Errors raised by a tool executor.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
  /// The tool has no command to run.
  #[error("tool has no baseCommand")]
  NoCommand,

  /// The command could not be started.
  #[error("failed to start '{command}': {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  /// The command exited unsuccessfully.
  #[error("tool failed ({status}): {stderr}")]
  Failed {
    status: String,
    code: Option<i32>,
    stderr: String,
  },

  /// The tool's output is not a JSON object.
  #[error("invalid tool output: {message}")]
  InvalidOutput { message: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Errors raised while executing a task graph.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
  #[error(transparent)]
  Promise(#[from] PromiseError),

  #[error(transparent)]
  Scheduler(#[from] SchedulerError),

  #[error("file store error: {0}")]
  Artifact(#[from] orchid_artifact::Error),

  #[error(transparent)]
  FileRef(#[from] FileRefError),

  /// A tool failed. The executor's error is kept verbatim.
  #[error("step '{step}' failed: {source}")]
  Tool {
    step: String,
    #[source]
    source: ToolError,
  },

  /// Scratch directory or output document I/O failed.
  #[error("io error at {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// A job or tool output named a stored file instead of a local one.
  #[error("'{basename}' refers to stored file '{handle}'; only local files can be stored")]
  ForeignHandle { handle: String, basename: String },

  #[error("failed to encode output document: {0}")]
  Encode(#[from] serde_json::Error),

  /// No task can start but some have not completed.
  #[error("{remaining} tasks can never become ready")]
  Stalled { remaining: usize },

  /// A spawned task panicked or was aborted.
  #[error("task join error: {0}")]
  Join(#[from] tokio::task::JoinError),

  /// Execution was cancelled.
  #[error("execution cancelled")]
  Cancelled,
}

impl TaskError {
  pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
    let path = path.into();
    move |source| TaskError::Io { path, source }
  }
}

/// Errors raised by a workflow run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Requirement(#[from] RequirementError),

  #[error(transparent)]
  Scheduler(#[from] SchedulerError),

  /// A required input has no value and no default.
  #[error("missing required input parameter '{input}'")]
  MissingInput { input: String },

  #[error(transparent)]
  FileRef(#[from] FileRefError),

  #[error(transparent)]
  Task(#[from] TaskError),

  /// The graph completed without producing an output record.
  #[error("run finished without an output record")]
  NoOutput,
}
