use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading a description or job document.
#[derive(Debug, Error)]
pub enum ConfigError {
  /// The file could not be read.
  #[error("failed to read {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The file is not valid JSON.
  #[error("invalid JSON in {path}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  /// The file is not valid YAML.
  #[error("invalid YAML in {path}")]
  Yaml {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  /// A job document must be a mapping of input names to values.
  #[error("job document {path} is not a mapping")]
  NotAMapping { path: PathBuf },

  /// A step's `run` reference leads back to a file already being loaded.
  #[error("recursive run reference: {path}")]
  RecursiveRun { path: PathBuf },

  /// The document does not describe a supported process.
  #[error("invalid process description: {0}")]
  InvalidProcess(#[source] serde_json::Error),
}
