//! The task graph handed to the job executor.
//!
//! The graph is an append-only arena. Nodes are only ever added after every
//! node they depend on, so a node's parents always have smaller ids and the
//! graph is acyclic by construction.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use orchid_config::{ToolDef, WorkflowDef};

use crate::promise::TaskInput;

/// Identifier of a node in a [`TaskGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl TaskId {
  pub const fn new(index: usize) -> Self {
    Self(index)
  }

  pub fn index(self) -> usize {
    self.0
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "task-{}", self.0)
  }
}

/// What a task node does when it runs.
#[derive(Debug, Clone)]
pub enum TaskKind {
  /// Upload local input files into the store.
  Stage,
  /// Run one atomic tool.
  Tool { name: String, tool: Arc<ToolDef> },
  /// Schedule the steps of a workflow into the graph.
  Workflow {
    name: String,
    workflow: Arc<WorkflowDef>,
  },
  /// Flatten the deferred outputs of a nested workflow.
  ResolveIndirect { name: String },
  /// Download outputs into `outdir` and write the output record.
  Finalize { outdir: PathBuf },
}

impl TaskKind {
  pub fn label(&self) -> &'static str {
    match self {
      TaskKind::Stage => "stage",
      TaskKind::Tool { .. } => "tool",
      TaskKind::Workflow { .. } => "workflow",
      TaskKind::ResolveIndirect { .. } => "resolve_indirect",
      TaskKind::Finalize { .. } => "finalize",
    }
  }
}

/// Ordering constraints of a new node.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
  /// Tasks that must complete before this one runs.
  pub parents: Vec<TaskId>,
  /// A task whose whole subtree (the task plus everything spawned while it
  /// ran, transitively) must complete before this one runs.
  pub follows: Option<TaskId>,
  /// The running task that created this node, if any.
  pub spawned_by: Option<TaskId>,
}

impl Dependencies {
  pub fn after(parents: Vec<TaskId>) -> Self {
    Self {
      parents,
      ..Self::default()
    }
  }

  pub fn follow_on(task: TaskId) -> Self {
    Self {
      follows: Some(task),
      ..Self::default()
    }
  }

  pub fn spawned_by(mut self, owner: TaskId) -> Self {
    self.spawned_by = Some(owner);
    self
  }
}

/// A unit of work with its typed input and ordering constraints.
#[derive(Debug, Clone)]
pub struct TaskNode {
  pub id: TaskId,
  pub kind: TaskKind,
  pub input: TaskInput,
  pub parents: Vec<TaskId>,
  pub follows: Option<TaskId>,
  pub spawned_by: Option<TaskId>,
}

/// Append-only graph of task nodes.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
  nodes: Vec<TaskNode>,
}

impl TaskGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a node. Every dependency must already be in the graph.
  pub fn add_task(&mut self, kind: TaskKind, input: TaskInput, deps: Dependencies) -> TaskId {
    let id = TaskId(self.nodes.len());
    debug_assert!(deps.parents.iter().all(|p| p.0 < id.0));
    debug_assert!(deps.follows.is_none_or(|f| f.0 < id.0));

    self.nodes.push(TaskNode {
      id,
      kind,
      input,
      parents: deps.parents,
      follows: deps.follows,
      spawned_by: deps.spawned_by,
    });
    id
  }

  pub fn get(&self, id: TaskId) -> Option<&TaskNode> {
    self.nodes.get(id.0)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &TaskNode> {
    self.nodes.iter()
  }

  /// Drop every node from `len` onward.
  pub(crate) fn truncate(&mut self, len: usize) {
    self.nodes.truncate(len);
  }

  /// Nodes created while `id` was running.
  pub fn spawned(&self, id: TaskId) -> impl Iterator<Item = &TaskNode> {
    self.nodes.iter().filter(move |n| n.spawned_by == Some(id))
  }

  /// Whether `id` and everything spawned under it have completed.
  pub fn subtree_complete(&self, id: TaskId, completed: &HashSet<TaskId>) -> bool {
    completed.contains(&id)
      && self
        .spawned(id)
        .all(|child| self.subtree_complete(child.id, completed))
  }

  /// Whether `id` may start, given the set of completed tasks.
  pub fn is_runnable(&self, id: TaskId, completed: &HashSet<TaskId>) -> bool {
    let Some(node) = self.get(id) else {
      return false;
    };
    !completed.contains(&id)
      && node.parents.iter().all(|p| completed.contains(p))
      && node
        .follows
        .is_none_or(|f| self.subtree_complete(f, completed))
  }

  /// Runnable tasks not already started, in id order.
  pub fn ready(&self, completed: &HashSet<TaskId>, started: &HashSet<TaskId>) -> Vec<TaskId> {
    self
      .nodes
      .iter()
      .map(|n| n.id)
      .filter(|id| !started.contains(id) && self.is_runnable(*id, completed))
      .collect()
  }
}
