use serde_json::Value;

use crate::error::RequirementError;

/// Requirement classes a description may declare.
pub const SUPPORTED_REQUIREMENTS: &[&str] = &[
  "DockerRequirement",
  "ExpressionEngineRequirement",
  "SchemaDefRequirement",
  "EnvVarRequirement",
  "CreateFileRequirement",
  "SubworkflowFeatureRequirement",
];

/// Check every `requirements` list anywhere in a raw description document.
///
/// Both the list form (`[{"class": ...}]`) and the map form
/// (`{"DockerRequirement": {...}}`) are accepted. `hints` are not checked.
pub fn validate_requirements(document: &Value) -> Result<(), RequirementError> {
  match document {
    Value::Object(map) => {
      match map.get("requirements") {
        Some(Value::Array(entries)) => {
          for entry in entries {
            let class = entry
              .get("class")
              .and_then(Value::as_str)
              .ok_or_else(|| RequirementError::Malformed {
                entry: entry.clone(),
              })?;
            check_class(class)?;
          }
        }
        Some(Value::Object(by_class)) => {
          for class in by_class.keys() {
            check_class(class)?;
          }
        }
        _ => {}
      }
      for (key, child) in map {
        if key != "requirements" {
          validate_requirements(child)?;
        }
      }
    }
    Value::Array(items) => {
      for item in items {
        validate_requirements(item)?;
      }
    }
    _ => {}
  }
  Ok(())
}

fn check_class(class: &str) -> Result<(), RequirementError> {
  if SUPPORTED_REQUIREMENTS.contains(&class) {
    Ok(())
  } else {
    Err(RequirementError::Unsupported {
      class: class.to_string(),
    })
  }
}
