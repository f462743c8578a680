pub mod graph;
pub mod orchestration;
pub mod step;
pub mod workflows;

pub use graph::{ReadySet, StepGraph, Wave};
pub use orchestration::{OrchestrationManager, OrchestrationResult};
pub use step::{OrchestrationStep, StepDefinition, StepMetadata, StepStatus};
pub use workflows::{
    content_generation_from_registry, content_generation_steps, WorkflowStep, CONTENT_GENERATION,
};
