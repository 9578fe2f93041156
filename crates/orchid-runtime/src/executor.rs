//! Local job executor.
//!
//! Runs a [`TaskGraph`] to completion in batches. Each round collects the
//! runnable tasks, runs workflow tasks inline (they add nodes to the graph),
//! then spawns everything else concurrently and waits for the batch.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use orchid_artifact::Store;
use orchid_config::Record;
use orchid_workflow::{JobObject, StepScheduler, TaskGraph, TaskId, TaskKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::TaskError;
use crate::task::{DetachedTask, TaskContext};
use crate::tool::ToolExecutor;

/// Results of completed tasks, shared read-only with the tasks that read them.
pub type TaskResults = HashMap<TaskId, Arc<JobObject>>;

/// Detached tasks of one batch, each reporting its own id.
type Batch = JoinSet<(TaskId, Result<Record, TaskError>)>;

/// Executes task graphs on the local machine.
pub struct LocalExecutor {
  ctx: TaskContext,
}

impl LocalExecutor {
  /// `workdir` holds one scratch directory per running tool task.
  pub fn new(store: Arc<dyn Store>, tools: Arc<dyn ToolExecutor>, workdir: impl Into<PathBuf>) -> Self {
    Self {
      ctx: TaskContext {
        store,
        tools,
        workdir: workdir.into(),
      },
    }
  }

  /// Run every task in `graph`, including tasks added while running.
  ///
  /// Returns the result of every task. The first failing task aborts the
  /// run once its batch has finished.
  #[instrument(name = "execute_graph", skip(self, graph, cancel))]
  pub async fn execute(
    &self,
    graph: &mut TaskGraph,
    cancel: &CancellationToken,
  ) -> Result<TaskResults, TaskError> {
    let mut results = TaskResults::new();
    let mut completed = HashSet::new();
    let mut batches = 0usize;

    while completed.len() < graph.len() {
      if cancel.is_cancelled() {
        warn!("execution cancelled");
        return Err(TaskError::Cancelled);
      }

      // every batch finishes before the next round, so nothing is running
      let ready = graph.ready(&completed, &completed);
      if ready.is_empty() {
        let remaining = graph.len() - completed.len();
        error!(remaining, "no runnable tasks remain");
        return Err(TaskError::Stalled { remaining });
      }
      batches += 1;

      // workflows are scheduled before anything in the batch is spawned
      let mut detached = Vec::new();
      for id in ready {
        let Some(node) = graph.get(id) else {
          continue;
        };
        debug_assert!(node.input.producers().iter().all(|p| completed.contains(p)));
        let input = node.input.resolve(&results)?;

        if let TaskKind::Workflow { name, workflow } = &node.kind {
          let (name, workflow) = (name.clone(), Arc::clone(workflow));
          debug!(task_id = %id, workflow = %name, "scheduling workflow");

          let outputs = StepScheduler::new(&name, &workflow).schedule(graph, id, input)?;
          results.insert(id, Arc::new(JobObject::Indirect(outputs)));
          completed.insert(id);
        } else if let Some(task) = DetachedTask::from_kind(&node.kind) {
          detached.push((id, node.kind.label(), task, input));
        }
      }

      let mut batch = Batch::new();
      for (id, kind, task, input) in detached {
        debug!(task_id = %id, kind, "spawning task");
        let ctx = self.ctx.clone();
        batch.spawn(async move { (id, task.run(ctx, id, input).await) });
      }

      // dropping a JoinSet only requests aborts, so shut it down before
      // returning to be sure no task outlives the run
      let finished = tokio::select! {
        finished = drain(&mut batch) => finished,
        _ = cancel.cancelled() => {
          warn!(running = batch.len(), "execution cancelled during task batch");
          batch.shutdown().await;
          return Err(TaskError::Cancelled);
        }
      };
      let finished = match finished {
        Ok(finished) => finished,
        Err(e) => {
          batch.shutdown().await;
          return Err(e);
        }
      };

      for (id, outcome) in finished {
        let record = outcome.map_err(|e| {
          error!(task_id = %id, error = %e, "task failed");
          e
        })?;
        results.insert(id, Arc::new(JobObject::Plain(record)));
        completed.insert(id);
      }
    }

    info!(tasks = graph.len(), batches, "task graph completed");
    Ok(results)
  }
}

/// Wait for every task in `batch`, returning the outcomes in id order.
async fn drain(batch: &mut Batch) -> Result<Vec<(TaskId, Result<Record, TaskError>)>, TaskError> {
  let mut finished = Vec::with_capacity(batch.len());
  while let Some(joined) = batch.join_next().await {
    finished.push(joined?);
  }
  finished.sort_by_key(|(id, _)| *id);
  Ok(finished)
}
