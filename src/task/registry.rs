//! Name-keyed factory map for task types.

use std::collections::HashMap;

use super::task::Task;

type TaskFactory = Box<dyn Fn() -> Box<dyn Task> + Send + Sync>;

/// Registry of task types.
///
/// Task records only carry a type name; the registry turns that name back
/// into a fresh task instance whose state is then loaded from a blob.
#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any earlier entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.insert(name.clone(), Box::new(factory)).is_some() {
            tracing::warn!("Task type {} registered twice; keeping the latest", name);
        }
        self
    }

    /// Register a task type that starts from its `Default` state.
    pub fn register_default<T>(&mut self, name: impl Into<String>) -> &mut Self
    where
        T: Task + Default + 'static,
    {
        self.register(name, || Box::new(T::default()) as Box<dyn Task>)
    }

    /// Create a fresh task of type `name`, or `None` for unknown types.
    pub fn create_task(&self, name: &str) -> Option<Box<dyn Task>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("types", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Noop;

    #[async_trait]
    impl Task for Noop {
        async fn run(&mut self, _ctx: &mut dyn TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
        fn load_state(&mut self, _state: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        fn dump_state(&self) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_create_known_and_unknown() {
        let mut registry = TaskRegistry::new();
        registry.register_default::<Noop>("noop");

        assert!(registry.contains("noop"));
        assert!(registry.create_task("noop").is_some());
        assert!(registry.create_task("missing").is_none());
        assert_eq!(registry.names(), vec!["noop"]);
    }
}
