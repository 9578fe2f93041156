//! The step scheduler.
//!
//! Steps only name the parameters they read, so the edges of the task graph
//! are discovered by repeated passes over the steps: a step is scheduled as
//! soon as every parameter it reads has a promise, and scheduling it binds
//! promises for its own outputs. Passes continue until every step is
//! scheduled and every workflow output is bound, or a pass makes no progress.

use std::collections::HashSet;
use std::sync::Arc;

use orchid_config::{InputDef, ProcessDef, Record, StepDef, WorkflowDef, shortname};
use tracing::{debug, info, instrument};

use crate::error::SchedulerError;
use crate::graph::{Dependencies, TaskGraph, TaskId, TaskKind};
use crate::promise::{IndirectValue, JobObject, Promise, PromiseRegistry, TaskInput};

/// Requirement classes asking for semantics the scheduler rejects.
const UNSUPPORTED_STEP_REQUIREMENTS: &[&str] =
  &["ScatterFeatureRequirement", "MultipleInputFeatureRequirement"];

/// Schedules the steps of one workflow invocation into a task graph.
pub struct StepScheduler<'a> {
  name: &'a str,
  workflow: &'a WorkflowDef,
}

impl<'a> StepScheduler<'a> {
  pub fn new(name: &'a str, workflow: &'a WorkflowDef) -> Self {
    Self { name, workflow }
  }

  /// Reject features the scheduler does not implement, in this workflow and
  /// every workflow nested under it.
  pub fn check(&self) -> Result<(), SchedulerError> {
    check_workflow(self.workflow)
  }

  /// Add tasks for every step of the workflow to `graph`.
  ///
  /// `owner` is the running task this invocation belongs to; `inputs` are its
  /// resolved inputs, keyed by shortname. Returns the deferred workflow
  /// outputs. On failure the graph is left exactly as it was.
  #[instrument(name = "schedule_workflow", skip(self, graph, inputs), fields(workflow = %self.name))]
  pub fn schedule(
    &self,
    graph: &mut TaskGraph,
    owner: TaskId,
    inputs: Record,
  ) -> Result<IndirectValue, SchedulerError> {
    self.check()?;

    let mark = graph.len();
    let result = self.schedule_steps(graph, owner, inputs);
    if result.is_err() {
      graph.truncate(mark);
    }
    result
  }

  fn schedule_steps(
    &self,
    graph: &mut TaskGraph,
    owner: TaskId,
    inputs: Record,
  ) -> Result<IndirectValue, SchedulerError> {
    let steps = &self.workflow.steps;
    let mut registry = PromiseRegistry::new();
    let mut scheduled = vec![false; steps.len()];

    let held = Promise::held(owner, inputs);
    for input in &self.workflow.inputs {
      registry.bind(input.id.clone(), held.clone())?;
    }

    let mut passes = 0;
    loop {
      passes += 1;
      let mut progressed = false;

      for (index, step) in steps.iter().enumerate() {
        if scheduled[index] {
          continue;
        }
        let Some((job, parents)) = build_job(step, &registry)? else {
          continue;
        };

        let output_task = self.add_step(graph, owner, step, job, parents);
        for output in &step.outputs {
          registry.bind(output.id.clone(), Promise::pending(output_task))?;
        }

        debug!(step = %step.id, task = %output_task, pass = passes, "scheduled step");
        scheduled[index] = true;
        progressed = true;
      }

      let all_scheduled = scheduled.iter().all(|s| *s);
      if all_scheduled && self.unbound_outputs(&registry).is_empty() {
        break;
      }
      if !progressed {
        return Err(self.unsatisfiable(&registry, &scheduled));
      }
    }

    let mut outputs = IndirectValue::new();
    for output in &self.workflow.outputs {
      let source = output_source(output.id.as_str(), output.source.as_ref())?;
      let promise = registry
        .get(source)
        .ok_or_else(|| self.unsatisfiable(&registry, &scheduled))?;
      outputs.defer(shortname(&output.id), shortname(source), promise.clone());
    }

    info!(
      steps = steps.len(),
      bindings = registry.len(),
      passes,
      tasks = graph.len(),
      "workflow scheduled"
    );
    Ok(outputs)
  }

  /// Create the node(s) for a ready step and return the one its outputs are
  /// read from.
  fn add_step(
    &self,
    graph: &mut TaskGraph,
    owner: TaskId,
    step: &StepDef,
    job: IndirectValue,
    parents: Vec<TaskId>,
  ) -> TaskId {
    // a step reading nothing still runs inside this invocation
    let parents = if parents.is_empty() {
      vec![owner]
    } else {
      parents
    };
    let input = TaskInput::Object(JobObject::Indirect(job));
    let deps = Dependencies::after(parents).spawned_by(owner);

    match step.run.as_ref() {
      ProcessDef::Tool(tool) => graph.add_task(
        TaskKind::Tool {
          name: step.id.clone(),
          tool: Arc::new(tool.clone()),
        },
        input,
        deps,
      ),
      ProcessDef::Workflow(nested) => {
        let nested_task = graph.add_task(
          TaskKind::Workflow {
            name: step.id.clone(),
            workflow: Arc::new(nested.clone()),
          },
          input,
          deps,
        );
        // the nested outputs may still be promises on its own steps
        graph.add_task(
          TaskKind::ResolveIndirect {
            name: step.id.clone(),
          },
          TaskInput::Promise(Promise::pending(nested_task)),
          Dependencies::follow_on(nested_task).spawned_by(owner),
        )
      }
    }
  }

  fn unbound_outputs(&self, registry: &PromiseRegistry) -> Vec<String> {
    self
      .workflow
      .outputs
      .iter()
      .filter_map(|o| o.source.as_ref().and_then(|s| s.single()))
      .filter(|source| !registry.contains(source))
      .map(str::to_string)
      .collect()
  }

  fn unsatisfiable(&self, registry: &PromiseRegistry, scheduled: &[bool]) -> SchedulerError {
    let mut pending = Vec::new();
    let mut unbound = Vec::new();
    let mut seen = HashSet::new();

    for (step, done) in self.workflow.steps.iter().zip(scheduled) {
      if *done {
        continue;
      }
      pending.push(step.id.clone());
      for input in &step.inputs {
        if let Some(source) = input.source.as_ref().and_then(|s| s.single())
          && !registry.contains(source)
          && seen.insert(source.to_string())
        {
          unbound.push(source.to_string());
        }
      }
    }
    for source in self.unbound_outputs(registry) {
      if seen.insert(source.clone()) {
        unbound.push(source);
      }
    }

    SchedulerError::Unsatisfiable {
      workflow: self.name.to_string(),
      pending,
      unbound,
    }
  }
}

/// Build a step's job object, or `None` if some source is not bound yet.
///
/// Also returns the distinct producers of the promises read.
fn build_job(
  step: &StepDef,
  registry: &PromiseRegistry,
) -> Result<Option<(IndirectValue, Vec<TaskId>)>, SchedulerError> {
  let mut job = IndirectValue::new();
  let mut parents = Vec::new();

  for input in &step.inputs {
    let key = shortname(&input.id);
    match input_source(step, input)? {
      Some(source) => {
        let Some(promise) = registry.get(source) else {
          return Ok(None);
        };
        let producer = promise.producer();
        if !parents.contains(&producer) {
          parents.push(producer);
        }
        job.defer(key, shortname(source), promise.clone());
      }
      None => {
        if let Some(default) = &input.default {
          job.literal(key, default.clone());
        }
      }
    }
  }

  Ok(Some((job, parents)))
}

fn input_source<'s>(step: &StepDef, input: &'s InputDef) -> Result<Option<&'s str>, SchedulerError> {
  match &input.source {
    None => Ok(None),
    Some(sources) => sources
      .single()
      .map(Some)
      .ok_or_else(|| SchedulerError::UnsupportedFeature {
        step: step.id.clone(),
        feature: format!("multiple sources for input '{}'", input.id),
      }),
  }
}

fn output_source<'s>(
  output: &str,
  source: Option<&'s orchid_config::Sources>,
) -> Result<&'s str, SchedulerError> {
  let sources = source.ok_or_else(|| SchedulerError::MissingOutputSource {
    output: output.to_string(),
  })?;
  sources
    .single()
    .ok_or_else(|| SchedulerError::UnsupportedFeature {
      step: output.to_string(),
      feature: "multiple sources for a workflow output".to_string(),
    })
}

fn check_workflow(workflow: &WorkflowDef) -> Result<(), SchedulerError> {
  let mut ids = HashSet::new();

  for step in &workflow.steps {
    if !ids.insert(step.id.as_str()) {
      return Err(SchedulerError::DuplicateStep {
        step: step.id.clone(),
      });
    }
    if step.scatter.is_some() {
      return Err(SchedulerError::UnsupportedFeature {
        step: step.id.clone(),
        feature: "scatter".to_string(),
      });
    }
    if let Some(req) = step
      .requirements
      .iter()
      .find(|r| UNSUPPORTED_STEP_REQUIREMENTS.contains(&r.class.as_str()))
    {
      return Err(SchedulerError::UnsupportedFeature {
        step: step.id.clone(),
        feature: req.class.clone(),
      });
    }
    for input in &step.inputs {
      input_source(step, input)?;
    }
    if let ProcessDef::Workflow(nested) = step.run.as_ref() {
      check_workflow(nested)?;
    }
  }

  for output in &workflow.outputs {
    output_source(&output.id, output.source.as_ref())?;
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::PromiseError;
  use crate::promise::IndirectEntry;
  use orchid_config::ToolDef;
  use serde_json::{Value, json};
  use std::collections::HashMap;

  fn workflow(doc: Value) -> WorkflowDef {
    serde_json::from_value(doc).unwrap()
  }

  fn record(value: Value) -> Record {
    match value {
      Value::Object(map) => map,
      _ => panic!("expected object"),
    }
  }

  fn tool() -> Value {
    json!({ "class": "CommandLineTool" })
  }

  /// A graph holding only the running workflow task, as the executor sees it.
  fn owner_graph() -> (TaskGraph, TaskId) {
    let mut graph = TaskGraph::new();
    let owner = graph.add_task(
      TaskKind::Stage,
      TaskInput::Object(JobObject::Plain(Record::new())),
      Dependencies::default(),
    );
    (graph, owner)
  }

  fn tool_names(graph: &TaskGraph) -> Vec<String> {
    graph
      .iter()
      .filter_map(|n| match &n.kind {
        TaskKind::Tool { name, .. } => Some(name.clone()),
        _ => None,
      })
      .collect()
  }

  #[test]
  fn test_single_step_reads_workflow_input() {
    let wf = workflow(json!({
      "inputs": [{ "id": "#x" }],
      "outputs": [{ "id": "#y", "source": "#double/y" }],
      "steps": [{
        "id": "#double",
        "inputs": [{ "id": "#double/x", "source": "#x" }],
        "outputs": [{ "id": "#double/y" }],
        "run": tool()
      }]
    }));

    let (mut graph, owner) = owner_graph();
    let outputs = StepScheduler::new("main", &wf)
      .schedule(&mut graph, owner, record(json!({ "x": 5 })))
      .unwrap();

    assert_eq!(graph.len(), 2);
    let task = graph.get(TaskId::new(1)).unwrap();
    assert_eq!(task.parents, vec![owner]);
    assert_eq!(task.spawned_by, Some(owner));

    // the job reads `x` from the owner's held inputs
    let TaskInput::Object(JobObject::Indirect(job)) = &task.input else {
      panic!("expected indirect job");
    };
    let done: HashMap<TaskId, Arc<JobObject>> = HashMap::new();
    let resolved = job.resolve(&done).unwrap();
    assert_eq!(resolved["x"], 5);

    match outputs.get("y") {
      Some(IndirectEntry::Deferred { source_key, promise }) => {
        assert_eq!(source_key, "y");
        assert_eq!(promise.producer(), task.id);
      }
      other => panic!("unexpected output entry: {:?}", other),
    }
  }

  #[test]
  fn test_downstream_step_waits_for_producer_pass() {
    // B is declared first, so it can only be scheduled on the pass after A
    let wf = workflow(json!({
      "outputs": [{ "id": "#out", "source": "#b/r" }],
      "steps": [
        {
          "id": "#b",
          "inputs": [{ "id": "#b/i", "source": "#a/o" }],
          "outputs": [{ "id": "#b/r" }],
          "run": tool()
        },
        { "id": "#a", "outputs": [{ "id": "#a/o" }], "run": tool() }
      ]
    }));

    let (mut graph, owner) = owner_graph();
    StepScheduler::new("main", &wf)
      .schedule(&mut graph, owner, Record::new())
      .unwrap();

    assert_eq!(tool_names(&graph), vec!["#a", "#b"]);
    let a = graph.get(TaskId::new(1)).unwrap();
    let b = graph.get(TaskId::new(2)).unwrap();
    assert_eq!(a.parents, vec![owner]);
    assert_eq!(b.parents, vec![a.id]);
  }

  #[test]
  fn test_defaults_are_embedded_literally() {
    let wf = workflow(json!({
      "outputs": [{ "id": "#o", "source": "#s/o" }],
      "steps": [{
        "id": "#s",
        "inputs": [
          { "id": "#s/n", "default": 3 },
          { "id": "#s/unset" }
        ],
        "outputs": [{ "id": "#s/o" }],
        "run": tool()
      }]
    }));

    let (mut graph, owner) = owner_graph();
    StepScheduler::new("main", &wf)
      .schedule(&mut graph, owner, Record::new())
      .unwrap();

    let TaskInput::Object(JobObject::Indirect(job)) = &graph.get(TaskId::new(1)).unwrap().input
    else {
      panic!("expected indirect job");
    };
    assert_eq!(job.get("n"), Some(&IndirectEntry::Literal(json!(3))));
    assert!(job.get("unset").is_none());
  }

  #[test]
  fn test_nested_workflow_gets_resolve_indirect_follow_on() {
    let wf = workflow(json!({
      "inputs": [{ "id": "#x" }],
      "outputs": [{ "id": "#z", "source": "#after/z" }],
      "steps": [
        {
          "id": "#inner",
          "inputs": [{ "id": "#inner/x", "source": "#x" }],
          "outputs": [{ "id": "#inner/y" }],
          "run": {
            "class": "Workflow",
            "inputs": [{ "id": "#x" }],
            "outputs": [{ "id": "#y", "source": "#two/y" }],
            "steps": [
              {
                "id": "#one",
                "inputs": [{ "id": "#one/x", "source": "#x" }],
                "outputs": [{ "id": "#one/m" }],
                "run": tool()
              },
              {
                "id": "#two",
                "inputs": [{ "id": "#two/m", "source": "#one/m" }],
                "outputs": [{ "id": "#two/y" }],
                "run": tool()
              }
            ]
          }
        },
        {
          "id": "#after",
          "inputs": [{ "id": "#after/y", "source": "#inner/y" }],
          "outputs": [{ "id": "#after/z" }],
          "run": tool()
        }
      ]
    }));

    let (mut graph, owner) = owner_graph();
    StepScheduler::new("main", &wf)
      .schedule(&mut graph, owner, record(json!({ "x": 1 })))
      .unwrap();

    let nested = graph.get(TaskId::new(1)).unwrap();
    assert!(matches!(nested.kind, TaskKind::Workflow { .. }));

    let flatten = graph.get(TaskId::new(2)).unwrap();
    assert!(matches!(flatten.kind, TaskKind::ResolveIndirect { .. }));
    assert_eq!(flatten.follows, Some(nested.id));
    assert_eq!(flatten.input, TaskInput::Promise(Promise::pending(nested.id)));

    // the consumer reads from the flattening task, not the nested workflow
    let after = graph.get(TaskId::new(3)).unwrap();
    assert_eq!(after.parents, vec![flatten.id]);
  }

  #[test]
  fn test_cycle_is_unsatisfiable_and_rolled_back() {
    let wf = workflow(json!({
      "inputs": [{ "id": "#x" }],
      "outputs": [{ "id": "#o", "source": "#b/o" }],
      "steps": [
        {
          "id": "#ok",
          "inputs": [{ "id": "#ok/x", "source": "#x" }],
          "outputs": [{ "id": "#ok/o" }],
          "run": tool()
        },
        {
          "id": "#a",
          "inputs": [{ "id": "#a/i", "source": "#b/o" }],
          "outputs": [{ "id": "#a/o" }],
          "run": tool()
        },
        {
          "id": "#b",
          "inputs": [{ "id": "#b/i", "source": "#a/o" }],
          "outputs": [{ "id": "#b/o" }],
          "run": tool()
        }
      ]
    }));

    let (mut graph, owner) = owner_graph();
    let err = StepScheduler::new("main", &wf)
      .schedule(&mut graph, owner, record(json!({ "x": 1 })))
      .unwrap_err();

    match err {
      SchedulerError::Unsatisfiable {
        pending, unbound, ..
      } => {
        assert_eq!(pending, vec!["#a", "#b"]);
        assert_eq!(unbound, vec!["#b/o", "#a/o"]);
      }
      other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(graph.len(), 1);
  }

  #[test]
  fn test_dangling_output_source_is_unsatisfiable() {
    let wf = workflow(json!({
      "outputs": [{ "id": "#o", "source": "#typo/o" }],
      "steps": [{ "id": "#s", "outputs": [{ "id": "#s/o" }], "run": tool() }]
    }));

    let (mut graph, owner) = owner_graph();
    let err = StepScheduler::new("main", &wf)
      .schedule(&mut graph, owner, Record::new())
      .unwrap_err();

    match err {
      SchedulerError::Unsatisfiable {
        pending, unbound, ..
      } => {
        assert!(pending.is_empty());
        assert_eq!(unbound, vec!["#typo/o"]);
      }
      other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(graph.len(), 1);
  }

  #[test]
  fn test_multiple_sources_rejected_before_any_task() {
    let wf = workflow(json!({
      "inputs": [{ "id": "#x" }, { "id": "#y" }],
      "outputs": [],
      "steps": [
        { "id": "#first", "outputs": [{ "id": "#first/o" }], "run": tool() },
        {
          "id": "#merge",
          "inputs": [{ "id": "#merge/i", "source": ["#x", "#y"] }],
          "run": tool()
        }
      ]
    }));

    let (mut graph, owner) = owner_graph();
    let err = StepScheduler::new("main", &wf)
      .schedule(&mut graph, owner, Record::new())
      .unwrap_err();

    assert!(matches!(err, SchedulerError::UnsupportedFeature { ref step, .. } if step == "#merge"));
    assert_eq!(graph.len(), 1);
  }

  #[test]
  fn test_scatter_rejected_in_nested_workflow() {
    let wf = workflow(json!({
      "steps": [{
        "id": "#outer",
        "run": {
          "class": "Workflow",
          "steps": [{ "id": "#inner", "scatter": "#inner/x", "run": tool() }]
        }
      }]
    }));

    let err = StepScheduler::new("main", &wf).check().unwrap_err();
    assert!(matches!(
      err,
      SchedulerError::UnsupportedFeature { ref feature, .. } if feature == "scatter"
    ));
  }

  #[test]
  fn test_duplicate_output_binding() {
    let wf = workflow(json!({
      "steps": [
        { "id": "#a", "outputs": [{ "id": "#shared" }], "run": tool() },
        { "id": "#b", "outputs": [{ "id": "#shared" }], "run": tool() }
      ]
    }));

    let (mut graph, owner) = owner_graph();
    let err = StepScheduler::new("main", &wf)
      .schedule(&mut graph, owner, Record::new())
      .unwrap_err();

    assert!(matches!(
      err,
      SchedulerError::Promise(PromiseError::DuplicateBinding { .. })
    ));
    assert_eq!(graph.len(), 1);
  }

  #[test]
  fn test_scheduling_is_deterministic() {
    let wf = workflow(json!({
      "inputs": [{ "id": "#x" }],
      "outputs": [{ "id": "#o", "source": "#c/o" }],
      "steps": [
        {
          "id": "#c",
          "inputs": [
            { "id": "#c/a", "source": "#a/o" },
            { "id": "#c/b", "source": "#b/o" }
          ],
          "outputs": [{ "id": "#c/o" }],
          "run": tool()
        },
        {
          "id": "#b",
          "inputs": [{ "id": "#b/x", "source": "#x" }],
          "outputs": [{ "id": "#b/o" }],
          "run": tool()
        },
        {
          "id": "#a",
          "inputs": [{ "id": "#a/x", "source": "#x" }],
          "outputs": [{ "id": "#a/o" }],
          "run": tool()
        }
      ]
    }));

    let run = || {
      let (mut graph, owner) = owner_graph();
      StepScheduler::new("main", &wf)
        .schedule(&mut graph, owner, record(json!({ "x": 0 })))
        .unwrap();
      (tool_names(&graph), graph.get(TaskId::new(3)).unwrap().parents.clone())
    };

    let (names, c_parents) = run();
    assert_eq!(names, vec!["#b", "#a", "#c"]);
    assert_eq!(c_parents, vec![TaskId::new(2), TaskId::new(1)]);
    assert_eq!(run().0, names);
  }

  #[test]
  fn test_tool_definition_is_carried_into_task() {
    let wf = workflow(json!({
      "steps": [{
        "id": "#s",
        "run": { "class": "CommandLineTool", "baseCommand": ["sort", "-n"] }
      }]
    }));

    let (mut graph, owner) = owner_graph();
    StepScheduler::new("main", &wf)
      .schedule(&mut graph, owner, Record::new())
      .unwrap();

    match &graph.get(TaskId::new(1)).unwrap().kind {
      TaskKind::Tool { tool, .. } => {
        let expected: ToolDef =
          serde_json::from_value(json!({ "baseCommand": ["sort", "-n"] })).unwrap();
        assert_eq!(**tool, expected);
      }
      other => panic!("unexpected kind: {:?}", other),
    }
  }
}
