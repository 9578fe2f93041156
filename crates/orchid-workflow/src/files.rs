//! Rewriting of file references inside job values.
//!
//! A file reference is any JSON object with `"class": "File"`. Its `path` is
//! either a local path string or, once staged, a stored handle object:
//!
//! ```json
//! { "class": "File", "path": "/data/reads.fq" }
//! { "class": "File", "path": { "handle": "6f1c...", "basename": "reads.fq" } }
//! ```
//!
//! The adapters below always work on a private copy of the value, so a task
//! never rewrites data another task can see.

use std::future::Future;

use orchid_artifact::FileHandle;
use serde_json::Value;

use crate::error::FileRefError;

/// The path of a file reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePath {
  Local(String),
  Stored(FileHandle),
}

impl FilePath {
  fn from_value(value: &Value) -> Result<Self, FileRefError> {
    match value {
      Value::String(path) => Ok(FilePath::Local(path.clone())),
      Value::Object(_) => serde_json::from_value(value.clone())
        .map(FilePath::Stored)
        .map_err(|_| FileRefError::InvalidPath(value.clone())),
      other => Err(FileRefError::InvalidPath(other.clone())),
    }
  }

  fn into_value(self) -> Value {
    match self {
      FilePath::Local(path) => Value::String(path),
      FilePath::Stored(handle) => serde_json::json!({
        "handle": handle.handle,
        "basename": handle.basename,
      }),
    }
  }
}

/// Collect mutable references to every `path` slot of every file reference.
///
/// Every element of objects and arrays is visited, including the fields of a
/// file reference itself (for `secondaryFiles` and similar nesting).
fn path_slots<'a>(value: &'a mut Value, slots: &mut Vec<&'a mut Value>) {
  match value {
    Value::Object(map) => {
      let is_file = map.get("class").and_then(Value::as_str) == Some("File");
      for (key, child) in map.iter_mut() {
        if is_file && key == "path" {
          slots.push(child);
        } else {
          path_slots(child, slots);
        }
      }
    }
    Value::Array(items) => {
      for item in items.iter_mut() {
        path_slots(item, slots);
      }
    }
    _ => {}
  }
}

/// List every file path in `value`, in traversal order.
pub fn file_paths(value: &Value) -> Result<Vec<FilePath>, FileRefError> {
  let mut copy = value.clone();
  let mut slots = Vec::new();
  path_slots(&mut copy, &mut slots);
  slots.into_iter().map(|slot| FilePath::from_value(slot)).collect()
}

/// Return a copy of `value` with every file path replaced by `transform(path)`.
pub fn adjust<F, E>(value: &Value, mut transform: F) -> Result<Value, E>
where
  F: FnMut(FilePath) -> Result<FilePath, E>,
  E: From<FileRefError>,
{
  let mut copy = value.clone();
  let mut slots = Vec::new();
  path_slots(&mut copy, &mut slots);

  for slot in slots {
    let path = FilePath::from_value(slot)?;
    *slot = transform(path)?.into_value();
  }

  Ok(copy)
}

/// Async variant of [`adjust`] for transforms that perform I/O.
///
/// Paths are transformed one at a time, in traversal order.
pub async fn adjust_async<F, Fut, E>(value: &Value, mut transform: F) -> Result<Value, E>
where
  F: FnMut(FilePath) -> Fut,
  Fut: Future<Output = Result<FilePath, E>>,
  E: From<FileRefError>,
{
  let mut copy = value.clone();
  let mut slots = Vec::new();
  path_slots(&mut copy, &mut slots);

  for slot in slots {
    let path = FilePath::from_value(slot)?;
    *slot = transform(path).await?.into_value();
  }

  Ok(copy)
}
