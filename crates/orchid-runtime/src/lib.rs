//! Orchid Runtime
//!
//! This crate executes the task graphs built by `orchid-workflow`. It moves
//! files between tasks through an [`orchid_artifact::Store`], runs atomic
//! tools through a [`ToolExecutor`], and drives whole runs from a process
//! description and a job document.
//!
//! - [`Run`]: load, validate, stage, execute and finalize one run
//! - [`LocalExecutor`]: batch executor for a [`orchid_workflow::TaskGraph`]
//! - [`ProcessToolExecutor`]: runs a tool's command line as a child process

mod driver;
mod error;
mod executor;
mod task;
mod tool;

pub use driver::{Run, RunConfig};
pub use error::{RunError, TaskError, ToolError};
pub use executor::{LocalExecutor, TaskResults};
pub use tool::{JOB_ENV, OUTPUT_DOCUMENT, ProcessToolExecutor, ScratchDirs, ToolExecutor};
