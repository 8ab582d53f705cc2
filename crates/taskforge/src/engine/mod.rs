//! Task type registry
//!
//! The engine module provides the `TaskTypeRegistry` that the poller and
//! the worker pool consult to turn a task type name into a runnable
//! definition.

mod registry;

pub use registry::{RegistryError, TaskTypeRegistry};
