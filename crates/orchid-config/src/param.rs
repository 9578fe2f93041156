use serde::{Deserialize, Serialize};

/// Trim the leading namespace to get just the final name part of a parameter.
///
/// `#main/step/out` → `out`, `#step.out` → `out`, `x` → `x`.
pub fn shortname(id: &str) -> &str {
  let name = id.rsplit('#').next().unwrap_or(id);
  let name = name.rsplit('/').next().unwrap_or(name);
  name.rsplit('.').next().unwrap_or(name)
}

/// One or more parameter references feeding a single input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sources {
  One(String),
  Many(Vec<String>),
}

impl Sources {
  pub fn as_slice(&self) -> &[String] {
    match self {
      Sources::One(s) => std::slice::from_ref(s),
      Sources::Many(v) => v.as_slice(),
    }
  }

  /// The single reference, if there is exactly one.
  pub fn single(&self) -> Option<&str> {
    match self.as_slice() {
      [s] => Some(s.as_str()),
      _ => None,
    }
  }
}
