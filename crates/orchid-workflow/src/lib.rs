//! Orchid Workflow
//!
//! This crate turns a workflow description into a task graph. Steps declare
//! their dependencies only as parameter references, so the graph is discovered
//! incrementally: a step becomes a task once every reference it reads has a
//! registered [`Promise`], and its outputs are then bound to promises on the
//! new task.
//!
//! Key pieces:
//! - [`StepScheduler`]: the fixpoint loop that wires steps into a [`TaskGraph`]
//! - [`IndirectValue`]: a deferred multi-output view over task results
//! - [`files`]: rewriting of `File` paths inside arbitrary JSON values
//! - [`validate_requirements`]: pre-flight allow-list check
//!
//! Nothing here executes tasks; see `orchid-runtime` for that.

mod error;
pub mod files;
mod graph;
mod promise;
mod requirements;
mod scheduler;

pub use error::{FileRefError, PromiseError, RequirementError, SchedulerError};
pub use files::FilePath;
pub use graph::{Dependencies, TaskGraph, TaskId, TaskKind, TaskNode};
pub use promise::{IndirectEntry, IndirectValue, JobObject, Promise, PromiseRegistry, Results, TaskInput};
pub use requirements::{SUPPORTED_REQUIREMENTS, validate_requirements};
pub use scheduler::StepScheduler;
