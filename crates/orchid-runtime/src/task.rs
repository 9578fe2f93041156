//! What each kind of task does when it runs.
//!
//! Workflow tasks are not here: they mutate the task graph and run inline in
//! the executor loop. Everything else runs detached on its own private copy
//! of its resolved input.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use orchid_artifact::{Store, materialize, store_file};
use orchid_config::{Record, ToolDef};
use orchid_workflow::files::{adjust_async, file_paths};
use orchid_workflow::{FilePath, TaskId, TaskKind};
use serde_json::Value;
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::error::TaskError;
use crate::tool::{OUTPUT_DOCUMENT, ScratchDirs, ToolExecutor};

/// Shared collaborators of detached tasks.
#[derive(Clone)]
pub(crate) struct TaskContext {
  pub store: Arc<dyn Store>,
  pub tools: Arc<dyn ToolExecutor>,
  pub workdir: PathBuf,
}

/// A task that runs off the executor loop.
#[derive(Debug, Clone)]
pub(crate) enum DetachedTask {
  Stage,
  Tool { name: String, tool: Arc<ToolDef> },
  ResolveIndirect,
  Finalize { outdir: PathBuf },
}

impl DetachedTask {
  /// `None` for workflow tasks, which must run inline.
  pub fn from_kind(kind: &TaskKind) -> Option<Self> {
    match kind {
      TaskKind::Stage => Some(DetachedTask::Stage),
      TaskKind::Tool { name, tool } => Some(DetachedTask::Tool {
        name: name.clone(),
        tool: tool.clone(),
      }),
      TaskKind::ResolveIndirect { .. } => Some(DetachedTask::ResolveIndirect),
      TaskKind::Finalize { outdir } => Some(DetachedTask::Finalize {
        outdir: outdir.clone(),
      }),
      TaskKind::Workflow { .. } => None,
    }
  }

  #[instrument(name = "run_task", skip(self, ctx, id, input), fields(task_id = %id))]
  pub async fn run(self, ctx: TaskContext, id: TaskId, input: Record) -> Result<Record, TaskError> {
    match self {
      DetachedTask::Stage => stage(ctx.store.as_ref(), input).await,
      DetachedTask::Tool { name, tool } => run_tool(&ctx, id, &name, &tool, input).await,
      // resolving the input already flattened it
      DetachedTask::ResolveIndirect => Ok(input),
      DetachedTask::Finalize { outdir } => finalize(ctx.store.as_ref(), &outdir, input).await,
    }
  }
}

/// Upload every local file in the job into the store.
async fn stage(store: &dyn Store, job: Record) -> Result<Record, TaskError> {
  let job = Value::Object(job);
  local_files_only(&job)?;
  let staged = adjust_async(&job, |path| upload(store, None, path)).await?;
  Ok(into_record(staged))
}

async fn run_tool(
  ctx: &TaskContext,
  id: TaskId,
  name: &str,
  tool: &ToolDef,
  job: Record,
) -> Result<Record, TaskError> {
  let root = ctx.workdir.join(id.to_string());
  let dirs = ScratchDirs::create(&root)
    .await
    .map_err(TaskError::io(&root))?;

  info!(step = %name, "tool started");
  let result = execute_in(ctx, name, tool, job, &dirs).await;

  let root = dirs.root().to_path_buf();
  if let Err(e) = dirs.remove().await {
    warn!(path = %root.display(), error = %e, "failed to remove scratch directory");
  }

  match &result {
    Ok(_) => info!(step = %name, "tool completed"),
    Err(e) => warn!(step = %name, error = %e, "tool failed"),
  }
  result
}

async fn execute_in(
  ctx: &TaskContext,
  name: &str,
  tool: &ToolDef,
  job: Record,
  dirs: &ScratchDirs,
) -> Result<Record, TaskError> {
  let store = ctx.store.as_ref();

  let inp = dirs.inp.as_path();
  let local = adjust_async(&Value::Object(job), move |path| download_into(store, inp, path)).await?;

  let outputs = ctx
    .tools
    .execute(tool, &into_record(local), dirs)
    .await
    .map_err(|source| TaskError::Tool {
      step: name.to_string(),
      source,
    })?;

  let outputs = Value::Object(outputs);
  local_files_only(&outputs)?;

  let out = dirs.out.as_path();
  let stored = adjust_async(&outputs, move |path| {
    upload(store, Some(out), path)
  })
  .await?;
  Ok(into_record(stored))
}

/// Download every stored output into `outdir` and write the output document.
async fn finalize(store: &dyn Store, outdir: &Path, output: Record) -> Result<Record, TaskError> {
  fs::create_dir_all(outdir)
    .await
    .map_err(TaskError::io(outdir))?;

  let restored = adjust_async(&Value::Object(output), |path| async move {
    match path {
      FilePath::Stored(file) => {
        let dest = materialize(store, &file, &outdir.join(&file.basename)).await?;
        Ok::<_, TaskError>(FilePath::Local(dest.to_string_lossy().into_owned()))
      }
      local => Ok(local),
    }
  })
  .await?;

  let document = outdir.join(OUTPUT_DOCUMENT);
  let pretty = serde_json::to_vec_pretty(&restored)?;
  fs::write(&document, pretty)
    .await
    .map_err(TaskError::io(&document))?;

  info!(document = %document.display(), "output document written");
  Ok(into_record(restored))
}

/// Handles are only minted by uploads, never taken from a job or a tool.
fn local_files_only(value: &Value) -> Result<(), TaskError> {
  for path in file_paths(value)? {
    if let FilePath::Stored(file) = path {
      return Err(TaskError::ForeignHandle {
        handle: file.handle,
        basename: file.basename,
      });
    }
  }
  Ok(())
}

/// Store a local file; relative paths are taken relative to `base`.
async fn upload(store: &dyn Store, base: Option<&Path>, path: FilePath) -> Result<FilePath, TaskError> {
  match path {
    FilePath::Local(local) => {
      let local = match base {
        Some(base) => base.join(local),
        None => PathBuf::from(local),
      };
      Ok(FilePath::Stored(store_file(store, &local).await?))
    }
    stored => Ok(stored),
  }
}

/// Materialize a stored file under `inp/<handle>/<basename>`.
async fn download_into(store: &dyn Store, inp: &Path, path: FilePath) -> Result<FilePath, TaskError> {
  match path {
    FilePath::Stored(file) => {
      let dest = inp.join(&file.handle).join(&file.basename);
      let dest = materialize(store, &file, &dest).await?;
      Ok(FilePath::Local(dest.to_string_lossy().into_owned()))
    }
    local => Ok(local),
  }
}

/// Adjusting an object yields an object.
fn into_record(value: Value) -> Record {
  match value {
    Value::Object(record) => record,
    _ => Record::new(),
  }
}
