//! Promises and deferred job objects.
//!
//! Every task returns a single value, but a step may declare several outputs
//! that feed differently named inputs downstream. A consumer's job object is
//! therefore built as an [`IndirectValue`]: each input key maps to the key to
//! read and the [`Promise`] of the task whose result holds it. Resolving the
//! indirect value once those producers have completed yields the plain
//! mapping the consumer actually runs with.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use orchid_config::Record;
use serde_json::Value;

use crate::error::PromiseError;
use crate::graph::TaskId;

/// Read access to completed task results.
pub trait Results {
  /// The result of `task`, or `None` if it has not completed.
  fn output(&self, task: TaskId) -> Option<&JobObject>;
}

impl Results for HashMap<TaskId, Arc<JobObject>> {
  fn output(&self, task: TaskId) -> Option<&JobObject> {
    self.get(&task).map(Arc::as_ref)
  }
}

/// A reference to a value that exists once its producer has run.
#[derive(Debug, Clone, PartialEq)]
pub enum Promise {
  /// The result of a task in the graph.
  Pending { producer: TaskId },
  /// A value the owning task already holds (its own resolved inputs).
  Held { owner: TaskId, value: Arc<JobObject> },
}

impl Promise {
  pub fn pending(producer: TaskId) -> Self {
    Promise::Pending { producer }
  }

  pub fn held(owner: TaskId, value: Record) -> Self {
    Promise::Held {
      owner,
      value: Arc::new(JobObject::Plain(value)),
    }
  }

  /// The task a consumer of this promise must run after.
  pub fn producer(&self) -> TaskId {
    match self {
      Promise::Pending { producer } => *producer,
      Promise::Held { owner, .. } => *owner,
    }
  }

  /// Read the promised value.
  pub fn read<'a, R>(&'a self, results: &'a R) -> Result<&'a JobObject, PromiseError>
  where
    R: Results + ?Sized,
  {
    match self {
      Promise::Held { value, .. } => Ok(value.as_ref()),
      Promise::Pending { producer } => results
        .output(*producer)
        .ok_or(PromiseError::NotReady {
          producer: *producer,
        }),
    }
  }
}

/// One entry of an [`IndirectValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum IndirectEntry {
  /// Read `source_key` from the promised result.
  Deferred { source_key: String, promise: Promise },
  /// A literal value embedded at construction time (an input default).
  Literal(Value),
}

/// A deferred mapping from output key to a value held by another task.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndirectValue {
  entries: IndexMap<String, IndirectEntry>,
}

impl IndirectValue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an entry reading `source_key` from `promise`'s result.
  pub fn defer(&mut self, key: impl Into<String>, source_key: impl Into<String>, promise: Promise) {
    self.entries.insert(
      key.into(),
      IndirectEntry::Deferred {
        source_key: source_key.into(),
        promise,
      },
    );
  }

  /// Add a literal entry.
  pub fn literal(&mut self, key: impl Into<String>, value: Value) {
    self.entries.insert(key.into(), IndirectEntry::Literal(value));
  }

  pub fn get(&self, key: &str) -> Option<&IndirectEntry> {
    self.entries.get(key)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &IndirectEntry)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v))
  }

  /// Distinct tasks whose results this value reads, in entry order.
  pub fn producers(&self) -> Vec<TaskId> {
    let mut producers = Vec::new();
    for entry in self.entries.values() {
      if let IndirectEntry::Deferred { promise, .. } = entry {
        let producer = promise.producer();
        if !producers.contains(&producer) {
          producers.push(producer);
        }
      }
    }
    producers
  }

  /// Look every entry up in its producer's result.
  ///
  /// Producers must have returned plain mappings; a producer that returned
  /// another indirect value is not flattened.
  pub fn resolve<R>(&self, results: &R) -> Result<Record, PromiseError>
  where
    R: Results + ?Sized,
  {
    let mut record = Record::new();
    for (key, entry) in &self.entries {
      let value = match entry {
        IndirectEntry::Literal(value) => value.clone(),
        IndirectEntry::Deferred { source_key, promise } => {
          let producer = promise.producer();
          match promise.read(results)? {
            JobObject::Plain(result) => {
              result
                .get(source_key)
                .cloned()
                .ok_or_else(|| PromiseError::MissingKey {
                  key: source_key.clone(),
                  producer,
                })?
            }
            JobObject::Indirect(_) => return Err(PromiseError::Unflattened { producer }),
          }
        }
      };
      record.insert(key.clone(), value);
    }
    Ok(record)
  }
}

/// A job object: what a task consumes or returns.
#[derive(Debug, Clone, PartialEq)]
pub enum JobObject {
  Plain(Record),
  Indirect(IndirectValue),
}

impl JobObject {
  /// Resolve one level of indirection. A plain mapping is returned unchanged.
  pub fn resolve<R>(&self, results: &R) -> Result<Record, PromiseError>
  where
    R: Results + ?Sized,
  {
    match self {
      JobObject::Plain(record) => Ok(record.clone()),
      JobObject::Indirect(indirect) => indirect.resolve(results),
    }
  }
}

/// The input a task node is constructed with.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskInput {
  /// A job object built when the task was created.
  Object(JobObject),
  /// The whole result of another task, substituted before resolution.
  Promise(Promise),
}

impl TaskInput {
  /// Substitute a whole-result promise, then resolve one level.
  pub fn resolve<R>(&self, results: &R) -> Result<Record, PromiseError>
  where
    R: Results + ?Sized,
  {
    match self {
      TaskInput::Object(object) => object.resolve(results),
      TaskInput::Promise(promise) => promise.read(results)?.resolve(results),
    }
  }

  /// Tasks this input reads directly, not counting producers reached through
  /// a substituted result.
  pub fn producers(&self) -> Vec<TaskId> {
    match self {
      TaskInput::Object(JobObject::Indirect(indirect)) => indirect.producers(),
      TaskInput::Object(JobObject::Plain(_)) => Vec::new(),
      TaskInput::Promise(promise) => vec![promise.producer()],
    }
  }
}

/// Which promise satisfies each parameter of one workflow invocation.
///
/// Append-only: a parameter has exactly one producer.
#[derive(Debug, Default)]
pub struct PromiseRegistry {
  bindings: HashMap<String, Promise>,
}

impl PromiseRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn bind(&mut self, param: impl Into<String>, promise: Promise) -> Result<(), PromiseError> {
    let param = param.into();
    if self.bindings.contains_key(&param) {
      return Err(PromiseError::DuplicateBinding { param });
    }
    self.bindings.insert(param, promise);
    Ok(())
  }

  pub fn get(&self, param: &str) -> Option<&Promise> {
    self.bindings.get(param)
  }

  pub fn contains(&self, param: &str) -> bool {
    self.bindings.contains_key(param)
  }

  pub fn len(&self) -> usize {
    self.bindings.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bindings.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(value: Value) -> Record {
    match value {
      Value::Object(map) => map,
      _ => panic!("expected object"),
    }
  }

  fn results(entries: Vec<(TaskId, JobObject)>) -> HashMap<TaskId, Arc<JobObject>> {
    entries
      .into_iter()
      .map(|(id, obj)| (id, Arc::new(obj)))
      .collect()
  }

  #[test]
  fn test_resolve_reads_each_source_key() {
    let a = TaskId::new(1);
    let b = TaskId::new(2);
    let done = results(vec![
      (a, JobObject::Plain(record(json!({ "o": 1, "unused": true })))),
      (b, JobObject::Plain(record(json!({ "sum": 7 })))),
    ]);

    let mut job = IndirectValue::new();
    job.defer("left", "o", Promise::pending(a));
    job.defer("right", "sum", Promise::pending(b));
    job.literal("mode", json!("fast"));

    let resolved = job.resolve(&done).unwrap();
    assert_eq!(
      Value::Object(resolved),
      json!({ "left": 1, "right": 7, "mode": "fast" })
    );
  }

  #[test]
  fn test_held_promise_needs_no_result() {
    let owner = TaskId::new(0);
    let mut job = IndirectValue::new();
    job.defer("x", "x", Promise::held(owner, record(json!({ "x": 5 }))));

    let resolved = job.resolve(&results(vec![])).unwrap();
    assert_eq!(resolved["x"], 5);
    assert_eq!(job.producers(), vec![owner]);
  }

  #[test]
  fn test_resolve_is_idempotent() {
    let a = TaskId::new(1);
    let done = results(vec![(a, JobObject::Plain(record(json!({ "o": "v" }))))]);

    let mut indirect = IndirectValue::new();
    indirect.defer("i", "o", Promise::pending(a));

    for x in [
      JobObject::Indirect(indirect),
      JobObject::Plain(record(json!({ "plain": 1 }))),
    ] {
      let once = x.resolve(&done).unwrap();
      let twice = JobObject::Plain(once.clone()).resolve(&done).unwrap();
      assert_eq!(once, twice);
    }
  }

  #[test]
  fn test_missing_key() {
    let a = TaskId::new(3);
    let done = results(vec![(a, JobObject::Plain(Record::new()))]);

    let mut job = IndirectValue::new();
    job.defer("i", "absent", Promise::pending(a));

    assert_eq!(
      job.resolve(&done),
      Err(PromiseError::MissingKey {
        key: "absent".to_string(),
        producer: a,
      })
    );
  }

  #[test]
  fn test_pending_promise_not_ready() {
    let a = TaskId::new(4);
    let mut job = IndirectValue::new();
    job.defer("i", "o", Promise::pending(a));

    assert_eq!(
      job.resolve(&results(vec![])),
      Err(PromiseError::NotReady { producer: a })
    );
  }

  #[test]
  fn test_only_one_level_is_resolved() {
    let inner = TaskId::new(1);
    let outer = TaskId::new(2);

    let mut nested = IndirectValue::new();
    nested.defer("y", "y", Promise::pending(inner));

    let done = results(vec![
      (inner, JobObject::Plain(record(json!({ "y": 10 })))),
      (outer, JobObject::Indirect(nested)),
    ]);

    // reading a key through an entry does not flatten the producer's result
    let mut job = IndirectValue::new();
    job.defer("y", "y", Promise::pending(outer));
    assert_eq!(
      job.resolve(&done),
      Err(PromiseError::Unflattened { producer: outer })
    );

    // substituting the whole result and resolving it is exactly one level
    let input = TaskInput::Promise(Promise::pending(outer));
    assert_eq!(input.resolve(&done).unwrap()["y"], 10);
    assert_eq!(input.producers(), vec![outer]);
  }

  #[test]
  fn test_registry_rejects_second_binding() {
    let mut registry = PromiseRegistry::new();
    registry
      .bind("#a/o", Promise::pending(TaskId::new(1)))
      .unwrap();

    assert!(registry.contains("#a/o"));
    assert_eq!(
      registry.bind("#a/o", Promise::pending(TaskId::new(2))),
      Err(PromiseError::DuplicateBinding {
        param: "#a/o".to_string(),
      })
    );
    assert_eq!(
      registry.get("#a/o").map(Promise::producer),
      Some(TaskId::new(1))
    );
    assert_eq!(registry.len(), 1);
  }
}
