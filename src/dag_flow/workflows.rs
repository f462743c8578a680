//! Built-in step graphs, expressed as dependency tables.

use std::sync::Arc;

use crate::core::errors::{CoordError, Result};
use crate::dag_flow::step::StepDefinition;
use crate::taskagent::executor::{TaskCallable, TaskConfig};
use crate::taskagent::registry::TaskRegistry;

/// One row of a workflow table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowStep {
    pub step_id: &'static str,
    pub task_type: &'static str,
    pub progress: u8,
    pub dependencies: &'static [&'static str],
}

/// intent_analysis -> {brand_analysis, complexity_assessment} ->
/// execution_planning -> content_generation -> finalization
pub const CONTENT_GENERATION: &[WorkflowStep] = &[
    WorkflowStep {
        step_id: "intent_analysis",
        task_type: "analysis",
        progress: 10,
        dependencies: &[],
    },
    WorkflowStep {
        step_id: "brand_analysis",
        task_type: "analysis",
        progress: 25,
        dependencies: &["intent_analysis"],
    },
    WorkflowStep {
        step_id: "complexity_assessment",
        task_type: "analysis",
        progress: 40,
        dependencies: &["intent_analysis"],
    },
    WorkflowStep {
        step_id: "execution_planning",
        task_type: "planning",
        progress: 55,
        dependencies: &["brand_analysis", "complexity_assessment"],
    },
    WorkflowStep {
        step_id: "content_generation",
        task_type: "generation",
        progress: 85,
        dependencies: &["execution_planning"],
    },
    WorkflowStep {
        step_id: "finalization",
        task_type: "finalization",
        progress: 100,
        dependencies: &["content_generation"],
    },
];

impl WorkflowStep {
    pub fn definition(&self, callable: Arc<dyn TaskCallable>) -> StepDefinition {
        self.with_task(TaskConfig::new(
            self.step_id,
            self.task_type,
            self.progress,
            callable,
        ))
    }

    pub fn with_task(&self, task: TaskConfig) -> StepDefinition {
        StepDefinition::new(self.step_id, task).depends_on(self.dependencies.iter().copied())
    }
}

/// Content-generation steps, with the callable for each step supplied by `make`.
pub fn content_generation_steps<F>(mut make: F) -> Vec<StepDefinition>
where
    F: FnMut(&WorkflowStep) -> Arc<dyn TaskCallable>,
{
    CONTENT_GENERATION
        .iter()
        .map(|step| step.definition(make(step)))
        .collect()
}

/// Content-generation steps using the tasks registered under each step id.
pub fn content_generation_from_registry(registry: &TaskRegistry) -> Result<Vec<StepDefinition>> {
    CONTENT_GENERATION
        .iter()
        .map(|step| {
            registry
                .get(step.step_id)
                .map(|task| step.with_task(task))
                .ok_or_else(|| {
                    CoordError::configuration_field(
                        format!("No task registered for step {}", step.step_id),
                        step.step_id,
                    )
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_flow::graph::StepGraph;
    use crate::taskagent::executor::task_fn;
    use serde_json::Value;

    fn echo() -> Arc<dyn TaskCallable> {
        task_fn(|v: Value| async move { Ok::<_, anyhow::Error>(v) })
    }

    #[test]
    fn test_table_is_a_dag() {
        let steps = content_generation_steps(|_| echo());
        let graph = StepGraph::build(&steps).unwrap();
        assert!(!graph.is_cyclic());
        assert!(graph.missing_dependencies().is_empty());

        let order = graph.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|s| s == id).unwrap();
        assert!(pos("intent_analysis") < pos("brand_analysis"));
        assert!(pos("complexity_assessment") < pos("execution_planning"));
        assert!(pos("content_generation") < pos("finalization"));
    }

    #[test]
    fn test_progress_is_increasing_along_the_table() {
        let progress: Vec<u8> = CONTENT_GENERATION.iter().map(|s| s.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last(), Some(&100));
    }

    #[test]
    fn test_registry_variant_requires_every_step() {
        let registry = TaskRegistry::new();
        assert!(content_generation_from_registry(&registry).is_err());

        for step in CONTENT_GENERATION {
            registry
                .register(TaskConfig::new(step.step_id, step.task_type, step.progress, echo()))
                .unwrap();
        }
        let steps = content_generation_from_registry(&registry).unwrap();
        assert_eq!(steps.len(), 6);
        assert!(steps[3].dependencies.contains("brand_analysis"));
    }
}
