use thiserror::Error;

use crate::graph::TaskId;

/// Invariant violations in the promise mechanism.
///
/// These indicate a graph construction bug rather than bad user input.
#[derive(Debug, Error, PartialEq)]
pub enum PromiseError {
  /// A parameter was bound to a second producer.
  #[error("parameter '{param}' is already bound")]
  DuplicateBinding { param: String },

  /// A producer's result does not contain the key an entry reads.
  #[error("key '{key}' missing from result of {producer}")]
  MissingKey { key: String, producer: TaskId },

  /// A promise was read before its producer completed.
  #[error("result of {producer} read before it completed")]
  NotReady { producer: TaskId },

  /// A promise's producer returned a deferred value where a plain mapping
  /// was required. Only one level of indirection is resolved.
  #[error("result of {producer} is still deferred")]
  Unflattened { producer: TaskId },
}

/// Errors raised while building the task graph for a workflow.
#[derive(Debug, Error)]
pub enum SchedulerError {
  /// The workflow asks for semantics this scheduler does not implement.
  #[error("step '{step}': {feature} is not supported")]
  UnsupportedFeature { step: String, feature: String },

  /// Two steps share an id.
  #[error("duplicate step id: {step}")]
  DuplicateStep { step: String },

  /// A workflow output does not name its source.
  #[error("workflow output '{output}' has no source")]
  MissingOutputSource { output: String },

  /// A pass made no progress while work remained: the references form a
  /// cycle or point at parameters nothing produces.
  #[error(
    "workflow '{workflow}' cannot be scheduled: steps {pending:?} are blocked on unbound references {unbound:?}"
  )]
  Unsatisfiable {
    workflow: String,
    pending: Vec<String>,
    unbound: Vec<String>,
  },

  #[error(transparent)]
  Promise(#[from] PromiseError),
}

/// Errors raised by the requirement validator.
#[derive(Debug, Error, PartialEq)]
pub enum RequirementError {
  /// A requirement class is not in the supported allow-list.
  #[error("unsupported requirement {class}")]
  Unsupported { class: String },

  /// A requirement entry has no class.
  #[error("requirement entry has no class: {entry}")]
  Malformed { entry: serde_json::Value },
}

/// Errors raised while rewriting file references.
#[derive(Debug, Error, PartialEq)]
pub enum FileRefError {
  /// A `File` object's path is neither a local path nor a stored handle.
  #[error("invalid File path: {0}")]
  InvalidPath(serde_json::Value),
}
