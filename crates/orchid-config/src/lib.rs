//! Orchid Config
//!
//! This crate contains the serializable workflow description types for Orchid.
//! A description is either a single command-line tool or a workflow whose steps
//! wire their inputs to other steps' outputs by parameter reference.
//!
//! Descriptions can be loaded from:
//! - JSON files
//! - YAML files (anything not ending in `.json`)
//!
//! The loader returns the raw document so that pre-flight checks (such as the
//! requirement validator) can walk it before it is parsed into typed form.

mod error;
mod loader;
mod param;
mod process;

pub use error::ConfigError;
pub use loader::{load_document, load_job, parse_process};
pub use param::{Sources, shortname};
pub use process::{InputDef, OutputDef, ProcessDef, Requirement, StepDef, ToolDef, WorkflowDef};

/// A plain mapping from parameter shortname to value.
pub type Record = serde_json::Map<String, serde_json::Value>;
