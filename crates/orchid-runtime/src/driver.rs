//! Running a process description against a job.
//!
//! [`Run`] loads both documents, validates requirements, fills in input
//! defaults and builds the top-level graph:
//!
//! ```text
//! Stage -> (follow-on) Workflow | Tool -> (follow-on) Finalize
//! ```
//!
//! The graph is then handed to the [`LocalExecutor`], and the record produced
//! by the Finalize task is the run's result.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use orchid_artifact::Store;
use orchid_config::{InputDef, ProcessDef, Record, load_document, load_job, parse_process, shortname};
use orchid_workflow::files::{adjust, file_paths};
use orchid_workflow::{
  Dependencies, FilePath, FileRefError, JobObject, Promise, StepScheduler, TaskGraph, TaskInput,
  TaskKind, validate_requirements,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{RunError, TaskError};
use crate::executor::{LocalExecutor, TaskResults};
use crate::tool::{ScratchDirs, ToolExecutor};

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
  /// Where output files and the output document are written.
  pub outdir: PathBuf,
  /// Base for relative file paths in the job. Defaults to the job file's
  /// directory.
  pub basedir: Option<PathBuf>,
  /// Scratch space for running tasks.
  pub workdir: PathBuf,
  /// Run a single tool directly, without staging or scheduling.
  pub conformance_test: bool,
  /// Leave the run's files in the store once the outputs are written.
  pub keep_intermediates: bool,
}

/// One workflow run.
pub struct Run {
  config: RunConfig,
  store: Arc<dyn Store>,
  tools: Arc<dyn ToolExecutor>,
}

impl Run {
  pub fn new(config: RunConfig, store: Arc<dyn Store>, tools: Arc<dyn ToolExecutor>) -> Self {
    Self {
      config,
      store,
      tools,
    }
  }

  /// Run `process` on `job` and return the output record.
  #[instrument(name = "run", skip(self, process, job, cancel), fields(process = %process.display()))]
  pub async fn execute(
    &self,
    process: &Path,
    job: &Path,
    cancel: &CancellationToken,
  ) -> Result<Record, RunError> {
    let run_id = uuid::Uuid::new_v4().to_string();

    let document = load_document(process)?;
    validate_requirements(&document)?;
    let definition = parse_process(&document)?;

    let basedir = match &self.config.basedir {
      Some(dir) => dir.clone(),
      None => parent_dir(job),
    };
    let job = absolutize(&load_job(job)?, &basedir)?;
    let inputs = prepare_inputs(definition.inputs(), job, &parent_dir(process))?;

    info!(run_id = %run_id, inputs = inputs.len(), "run started");

    let result = if self.config.conformance_test {
      self.run_conformance(definition, inputs, cancel).await
    } else {
      self.run_graph(definition, inputs, cancel).await
    };

    match &result {
      Ok(_) => info!(run_id = %run_id, "run completed"),
      Err(e) => error!(run_id = %run_id, error = %e, "run failed"),
    }
    result
  }

  async fn run_graph(
    &self,
    definition: ProcessDef,
    inputs: Record,
    cancel: &CancellationToken,
  ) -> Result<Record, RunError> {
    let name = definition.id().map(shortname).unwrap_or("main").to_string();

    let kind = match definition {
      ProcessDef::Tool(tool) => TaskKind::Tool {
        name,
        tool: Arc::new(tool),
      },
      ProcessDef::Workflow(workflow) => {
        // reject unsupported features before anything is staged
        StepScheduler::new(&name, &workflow).check()?;
        TaskKind::Workflow {
          name,
          workflow: Arc::new(workflow),
        }
      }
    };

    let mut graph = TaskGraph::new();
    let stage = graph.add_task(
      TaskKind::Stage,
      TaskInput::Object(JobObject::Plain(inputs)),
      Dependencies::default(),
    );
    let main = graph.add_task(
      kind,
      TaskInput::Promise(Promise::pending(stage)),
      Dependencies::follow_on(stage),
    );
    let finalize = graph.add_task(
      TaskKind::Finalize {
        outdir: self.config.outdir.clone(),
      },
      TaskInput::Promise(Promise::pending(main)),
      Dependencies::follow_on(main),
    );

    let executor = LocalExecutor::new(
      self.store.clone(),
      self.tools.clone(),
      self.config.workdir.clone(),
    );
    let results = executor.execute(&mut graph, cancel).await?;

    let output = match results.get(&finalize).map(|r| r.as_ref()) {
      Some(JobObject::Plain(record)) => record.clone(),
      _ => return Err(RunError::NoOutput),
    };
    if !self.config.keep_intermediates {
      self.remove_intermediates(&results).await;
    }
    Ok(output)
  }

  /// Delete every file the run put in the store. By now Finalize has copied
  /// the outputs into the output directory.
  async fn remove_intermediates(&self, results: &TaskResults) {
    let mut handles = HashSet::new();
    for result in results.values() {
      let JobObject::Plain(record) = result.as_ref() else {
        continue;
      };
      match file_paths(&Value::Object(record.clone())) {
        Ok(paths) => handles.extend(paths.into_iter().filter_map(|path| match path {
          FilePath::Stored(file) => Some(file.handle),
          FilePath::Local(_) => None,
        })),
        Err(e) => warn!(error = %e, "skipping unreadable task result"),
      }
    }

    for handle in &handles {
      if let Err(e) = self.store.delete(handle).await {
        warn!(handle = %handle, error = %e, "failed to remove stored file");
      }
    }
    debug!(files = handles.len(), "removed intermediate files");
  }

  /// Run a tool directly in the output directory.
  async fn run_conformance(
    &self,
    definition: ProcessDef,
    inputs: Record,
    cancel: &CancellationToken,
  ) -> Result<Record, RunError> {
    let ProcessDef::Tool(tool) = definition else {
      warn!("conformance mode only applies to tools; running the workflow normally");
      return self.run_graph(definition, inputs, cancel).await;
    };

    let root = self.config.workdir.join("conformance");
    let dirs = ScratchDirs::create_with_output(&root, &self.config.outdir)
      .await
      .map_err(TaskError::io(&root))?;

    let outputs = tokio::select! {
      outputs = self.tools.execute(&tool, &inputs, &dirs) => {
        outputs.map_err(|source| TaskError::Tool {
          step: tool.id.as_deref().map(shortname).unwrap_or("main").to_string(),
          source,
        })
      }
      _ = cancel.cancelled() => Err(TaskError::Cancelled),
    };

    let out = dirs.out.clone();
    if let Err(e) = dirs.remove().await {
      warn!(error = %e, "failed to remove conformance scratch directory");
    }

    Ok(absolutize(&outputs?, &out)?)
  }
}

/// Fill in defaults and check that every required input has a value.
///
/// Relative file paths in defaults are taken relative to `process_dir`.
fn prepare_inputs(
  declared: &[InputDef],
  mut job: Record,
  process_dir: &Path,
) -> Result<Record, RunError> {
  for input in declared {
    let key = shortname(&input.id);
    if job.contains_key(key) {
      continue;
    }
    match &input.default {
      Some(default) => {
        let default = adjust(default, |path| relative_to(process_dir, path))?;
        job.insert(key.to_string(), default);
      }
      None if input.is_optional() => {}
      None => {
        return Err(RunError::MissingInput {
          input: key.to_string(),
        });
      }
    }
  }
  Ok(job)
}

/// Make every relative local file path in `record` absolute against `base`.
fn absolutize(record: &Record, base: &Path) -> Result<Record, FileRefError> {
  match adjust(&Value::Object(record.clone()), |path| relative_to(base, path))? {
    Value::Object(record) => Ok(record),
    _ => Ok(Record::new()),
  }
}

fn relative_to(base: &Path, path: FilePath) -> Result<FilePath, FileRefError> {
  Ok(match path {
    FilePath::Local(local) if Path::new(&local).is_relative() => {
      FilePath::Local(base.join(local).to_string_lossy().into_owned())
    }
    other => other,
  })
}

fn parent_dir(path: &Path) -> PathBuf {
  match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
    _ => PathBuf::from("."),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn inputs(doc: Value) -> Vec<InputDef> {
    serde_json::from_value(doc).unwrap()
  }

  fn record(value: Value) -> Record {
    match value {
      Value::Object(map) => map,
      _ => panic!("expected object"),
    }
  }

  #[test]
  fn test_prepare_inputs_fills_defaults() {
    let declared = inputs(json!([
      { "id": "#main/x" },
      { "id": "#main/n", "default": 3 },
      { "id": "#main/ref", "default": { "class": "File", "path": "ref.fa" } },
      { "id": "#main/opt", "type": ["null", "int"] }
    ]));

    let prepared = prepare_inputs(
      &declared,
      record(json!({ "x": 1, "n": 9 })),
      Path::new("/wf"),
    )
    .unwrap();

    assert_eq!(prepared["x"], 1);
    assert_eq!(prepared["n"], 9);
    assert_eq!(prepared["ref"]["path"], "/wf/ref.fa");
    assert!(!prepared.contains_key("opt"));
  }

  #[test]
  fn test_prepare_inputs_missing_required() {
    let declared = inputs(json!([{ "id": "#main/x", "type": "int" }]));

    let err = prepare_inputs(&declared, Record::new(), Path::new(".")).unwrap_err();
    assert!(matches!(err, RunError::MissingInput { ref input } if input == "x"));
  }

  #[test]
  fn test_absolutize_only_touches_relative_local_paths() {
    let job = record(json!({
      "a": { "class": "File", "path": "reads.fq" },
      "b": { "class": "File", "path": "/abs/ref.fa" },
      "c": { "class": "File", "path": { "handle": "h1", "basename": "x.txt" } },
      "d": "reads.fq"
    }));

    let absolute = absolutize(&job, Path::new("/jobs")).unwrap();
    assert_eq!(absolute["a"]["path"], "/jobs/reads.fq");
    assert_eq!(absolute["b"]["path"], "/abs/ref.fa");
    assert_eq!(absolute["c"]["path"]["handle"], "h1");
    assert_eq!(absolute["d"], "reads.fq");
  }

  #[test]
  fn test_parent_dir_of_bare_file_name() {
    assert_eq!(parent_dir(Path::new("job.yml")), PathBuf::from("."));
    assert_eq!(parent_dir(Path::new("/a/job.yml")), PathBuf::from("/a"));
  }
}
