//! Task type registry
//!
//! The registry maps task type names to their definitions. It is filled
//! once during startup and then shared read-only behind an `Arc`, so
//! lookups need no locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::task::{TaskCost, TaskDefinition};

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Task type registered twice (programmer error, fatal at startup)
    #[error("task type already registered: {0}")]
    DuplicateTaskType(String),

    /// Task type not registered
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
}

/// Registry of task type definitions
#[derive(Default)]
pub struct TaskTypeRegistry {
    definitions: HashMap<String, Arc<TaskDefinition>>,
}

impl TaskTypeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type
    ///
    /// # Example
    ///
    /// ```
    /// use taskforge::{TaskDefinition, TaskRunResult, TaskTypeRegistry};
    ///
    /// let mut registry = TaskTypeRegistry::new();
    /// registry
    ///     .register(TaskDefinition::from_fn("cleanup", |_ctx| async {
    ///         Ok(TaskRunResult::done())
    ///     }))
    ///     .unwrap();
    /// assert!(registry.contains("cleanup"));
    /// ```
    pub fn register(&mut self, definition: TaskDefinition) -> Result<(), RegistryError> {
        if self.definitions.contains_key(&definition.task_type) {
            return Err(RegistryError::DuplicateTaskType(definition.task_type));
        }

        self.definitions
            .insert(definition.task_type.clone(), Arc::new(definition));
        Ok(())
    }

    /// Look up a task type
    pub fn get(&self, task_type: &str) -> Result<Arc<TaskDefinition>, RegistryError> {
        self.definitions
            .get(task_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTaskType(task_type.to_string()))
    }

    /// Check if a task type is registered
    pub fn contains(&self, task_type: &str) -> bool {
        self.definitions.contains_key(task_type)
    }

    /// Cheapest registered cost; sizes claim queries
    pub fn min_cost(&self) -> TaskCost {
        self.definitions
            .values()
            .map(|d| d.cost)
            .min()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Get all registered task type names
    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(|s| s.as_str())
    }

    pub fn definitions(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.definitions.values().map(|d| d.as_ref())
    }
}

impl fmt::Debug for TaskTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTypeRegistry")
            .field("task_types", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRunResult;

    fn noop(task_type: &str) -> TaskDefinition {
        TaskDefinition::from_fn(task_type, |_ctx| async { Ok(TaskRunResult::done()) })
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = TaskTypeRegistry::new();
        registry.register(noop("a")).unwrap();

        assert!(registry.contains("a"));
        assert_eq!(registry.get("a").unwrap().task_type, "a");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = TaskTypeRegistry::new();
        registry.register(noop("a")).unwrap();

        let result = registry.register(noop("a"));
        assert_eq!(result, Err(RegistryError::DuplicateTaskType("a".into())));
    }

    #[test]
    fn test_unknown_task_type() {
        let registry = TaskTypeRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(RegistryError::UnknownTaskType(_))
        ));
    }

    #[test]
    fn test_min_cost() {
        let mut registry = TaskTypeRegistry::new();
        assert_eq!(registry.min_cost(), TaskCost::NORMAL);

        registry
            .register(noop("big").with_cost(TaskCost::EXTRA_LARGE))
            .unwrap();
        registry.register(noop("small").with_cost(TaskCost::TINY)).unwrap();
        assert_eq!(registry.min_cost(), TaskCost::TINY);
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = TaskTypeRegistry::new();
        registry.register(noop("visible")).unwrap();
        assert!(format!("{:?}", registry).contains("visible"));
    }
}
