use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Record;
use crate::param::Sources;

/// A process description: either an atomic tool or a workflow of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum ProcessDef {
  #[serde(rename = "CommandLineTool", alias = "ExpressionTool")]
  Tool(ToolDef),
  Workflow(WorkflowDef),
}

impl ProcessDef {
  pub fn id(&self) -> Option<&str> {
    match self {
      ProcessDef::Tool(t) => t.id.as_deref(),
      ProcessDef::Workflow(w) => w.id.as_deref(),
    }
  }

  pub fn inputs(&self) -> &[InputDef] {
    match self {
      ProcessDef::Tool(t) => &t.inputs,
      ProcessDef::Workflow(w) => &w.inputs,
    }
  }
}

/// A declared requirement, identified by its class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
  pub class: String,
  #[serde(flatten)]
  pub fields: Record,
}

/// An input parameter declaration.
///
/// On a step, `source` names the parameter that feeds this input. On a tool
/// or workflow, `default` is used when the job does not supply a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDef {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<Sources>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<Value>,
  #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
  pub param_type: Option<Value>,
}

impl InputDef {
  /// Whether the declared type admits `null`.
  pub fn is_optional(&self) -> bool {
    match &self.param_type {
      Some(Value::Array(types)) => types.first().and_then(Value::as_str) == Some("null"),
      Some(Value::String(t)) => t == "null" || t.ends_with('?'),
      _ => false,
    }
  }
}

/// An output parameter declaration.
///
/// Workflow outputs carry the `source` they are copied from; tool and step
/// outputs only need an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<Sources>,
  #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
  pub param_type: Option<Value>,
}

/// An atomic tool. Orchid never interprets the command line itself; the
/// fields here are passed through to the tool executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default)]
  pub inputs: Vec<InputDef>,
  #[serde(default)]
  pub outputs: Vec<OutputDef>,
  #[serde(default, deserialize_with = "requirement_list")]
  pub requirements: Vec<Requirement>,
  #[serde(default, deserialize_with = "hint_list")]
  pub hints: Vec<Value>,
  #[serde(
    default,
    rename = "baseCommand",
    skip_serializing_if = "Option::is_none"
  )]
  pub base_command: Option<Sources>,
  #[serde(default)]
  pub arguments: Vec<String>,
}

impl ToolDef {
  pub fn has_requirement(&self, class: &str) -> bool {
    self.requirements.iter().any(|r| r.class == class)
  }
}

/// A workflow: ordered steps plus workflow-level parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default)]
  pub inputs: Vec<InputDef>,
  #[serde(default)]
  pub outputs: Vec<OutputDef>,
  #[serde(default)]
  pub steps: Vec<StepDef>,
  #[serde(default, deserialize_with = "requirement_list")]
  pub requirements: Vec<Requirement>,
  #[serde(default, deserialize_with = "hint_list")]
  pub hints: Vec<Value>,
}

/// One step of a workflow, wrapping an embedded process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  pub id: String,
  #[serde(default, alias = "in")]
  pub inputs: Vec<InputDef>,
  #[serde(default, alias = "out")]
  pub outputs: Vec<OutputDef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub scatter: Option<Value>,
  #[serde(default, deserialize_with = "requirement_list")]
  pub requirements: Vec<Requirement>,
  pub run: Arc<ProcessDef>,
}

/// Requirements and hints may be written as a list of objects or as a map
/// keyed by class.
#[derive(Deserialize)]
#[serde(untagged)]
enum ClassList {
  List(Vec<Value>),
  Map(Record),
}

impl ClassList {
  fn into_values(self) -> Vec<Value> {
    match self {
      ClassList::List(values) => values,
      ClassList::Map(map) => map
        .into_iter()
        .map(|(class, fields)| {
          let mut entry = match fields {
            Value::Object(fields) => fields,
            _ => Record::new(),
          };
          entry.insert("class".to_string(), Value::String(class));
          Value::Object(entry)
        })
        .collect(),
    }
  }
}

fn requirement_list<'de, D>(deserializer: D) -> Result<Vec<Requirement>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  ClassList::deserialize(deserializer)?
    .into_values()
    .into_iter()
    .map(|value| serde_json::from_value(value).map_err(serde::de::Error::custom))
    .collect()
}

fn hint_list<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  Ok(ClassList::deserialize(deserializer)?.into_values())
}
