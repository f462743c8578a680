use dashmap::DashMap;
use std::sync::Arc;

use crate::core::errors::{CoordError, Result};
use crate::taskagent::executor::TaskConfig;

/// Named task configurations, shared cheaply between managers
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<DashMap<String, TaskConfig>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under its own name. Names are unique.
    pub fn register(&self, task: TaskConfig) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.tasks.entry(task.name.clone()) {
            Entry::Occupied(_) => Err(CoordError::configuration_field(
                format!("Task already registered: {}", task.name),
                "name",
            )),
            Entry::Vacant(slot) => {
                slot.insert(task);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<TaskConfig> {
        self.tasks.get(name).map(|t| t.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn unregister(&self, name: &str) -> Option<TaskConfig> {
        self.tasks.remove(name).map(|(_, t)| t)
    }

    /// Registered names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
