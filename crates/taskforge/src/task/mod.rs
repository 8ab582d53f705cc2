//! Task data model
//!
//! This module provides:
//! - [`TaskDocument`] - the persisted unit of schedulable work
//! - [`TaskDefinition`] - the registered contract of a task type
//! - [`TaskContext`] - what a runner sees during one execution

mod context;
mod definition;
mod document;

pub use context::TaskContext;
pub use definition::{
    RetryDirective, TaskCost, TaskDefinition, TaskRunError, TaskRunResult, TaskRunner,
    TaskRunnerFactory,
};
pub use document::{Interval, IntervalParseError, TaskDocument, TaskStatus};
