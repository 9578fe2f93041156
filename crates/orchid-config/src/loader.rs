//! Loading of description and job documents.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::ConfigError;
use crate::process::ProcessDef;
use crate::Record;

/// Load a description document, inlining every step `run` that refers to
/// another file by path (relative to the referencing file).
pub fn load_document(path: &Path) -> Result<Value, ConfigError> {
  let mut stack = Vec::new();
  load_inlined(path, &mut stack)
}

/// Load a job document: a mapping of input shortnames to values.
pub fn load_job(path: &Path) -> Result<Record, ConfigError> {
  match read_value(path)? {
    Value::Object(map) => Ok(map),
    Value::Null => Ok(Record::new()),
    _ => Err(ConfigError::NotAMapping {
      path: path.to_path_buf(),
    }),
  }
}

/// Parse a raw document into a typed process description.
pub fn parse_process(document: &Value) -> Result<ProcessDef, ConfigError> {
  serde_json::from_value(document.clone()).map_err(ConfigError::InvalidProcess)
}

fn load_inlined(path: &Path, stack: &mut Vec<PathBuf>) -> Result<Value, ConfigError> {
  let canonical = path.canonicalize().map_err(|e| ConfigError::Io {
    path: path.to_path_buf(),
    source: e,
  })?;
  if stack.contains(&canonical) {
    return Err(ConfigError::RecursiveRun { path: canonical });
  }

  let mut document = read_value(&canonical)?;
  let base = canonical
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_default();

  stack.push(canonical);
  inline_runs(&mut document, &base, stack)?;
  stack.pop();

  Ok(document)
}

fn inline_runs(value: &mut Value, base: &Path, stack: &mut Vec<PathBuf>) -> Result<(), ConfigError> {
  match value {
    Value::Object(map) => {
      if let Some(Value::String(target)) = map.get("run") {
        let target = base.join(target.trim_start_matches("file://"));
        let loaded = load_inlined(&target, stack)?;
        map.insert("run".to_string(), loaded);
      }
      // a freshly loaded run has no string references left, so walking it
      // again with this file's base is a no-op
      for child in map.values_mut() {
        inline_runs(child, base, stack)?;
      }
    }
    Value::Array(items) => {
      for item in items {
        inline_runs(item, base, stack)?;
      }
    }
    _ => {}
  }
  Ok(())
}

fn read_value(path: &Path) -> Result<Value, ConfigError> {
  let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
    path: path.to_path_buf(),
    source: e,
  })?;

  let is_json = path.extension().is_some_and(|ext| ext == "json");
  if is_json {
    serde_json::from_str(&content).map_err(|e| ConfigError::Json {
      path: path.to_path_buf(),
      source: e,
    })
  } else {
    serde_yaml::from_str(&content).map_err(|e| ConfigError::Yaml {
      path: path.to_path_buf(),
      source: e,
    })
  }
}
