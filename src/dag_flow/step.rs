use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::warn;

use crate::core::errors::ErrorInfo;
use crate::taskagent::executor::TaskConfig;

/// Step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Forward-only: nothing re-enters `Pending`, terminal states stay put.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Skipped) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetadata {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Always 0; steps are never retried automatically
    pub retry_count: u32,
}

/// Bookkeeping for one step of an orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationStep {
    pub step_id: String,
    pub step_name: String,
    pub step_type: String,
    pub status: StepStatus,
    pub progress: u8,
    pub dependencies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub metadata: StepMetadata,
}

impl OrchestrationStep {
    pub fn from_definition(def: &StepDefinition) -> Self {
        Self {
            step_id: def.step_id.clone(),
            step_name: def.task.name.clone(),
            step_type: def.task.task_type.clone(),
            status: StepStatus::Pending,
            progress: 0,
            dependencies: def.dependencies.clone(),
            result: None,
            error: None,
            metadata: StepMetadata::default(),
        }
    }

    fn transition(&mut self, next: StepStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                step_id = %self.step_id,
                from = ?self.status,
                to = ?next,
                "Refusing backwards step transition"
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn mark_running(&mut self) -> bool {
        if self.transition(StepStatus::Running) {
            self.metadata.started_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    pub fn mark_completed(&mut self, output: Value, progress: u8) -> bool {
        if !self.transition(StepStatus::Completed) {
            return false;
        }
        self.result = Some(output);
        self.progress = progress.min(100);
        self.finish_timing();
        true
    }

    pub fn mark_failed(&mut self, error: ErrorInfo) -> bool {
        if !self.transition(StepStatus::Failed) {
            return false;
        }
        self.error = Some(error);
        self.finish_timing();
        true
    }

    pub fn mark_skipped(&mut self) -> bool {
        self.transition(StepStatus::Skipped)
    }

    fn finish_timing(&mut self) {
        let now = Utc::now();
        self.metadata.completed_at = Some(now);
        self.metadata.duration_ms = self
            .metadata
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }
}

/// What a caller declares for one step: an id, what it waits for, what it runs
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub step_id: String,
    pub dependencies: BTreeSet<String>,
    pub task: TaskConfig,
}

impl StepDefinition {
    pub fn new(step_id: impl Into<String>, task: TaskConfig) -> Self {
        Self {
            step_id: step_id.into(),
            dependencies: BTreeSet::new(),
            task,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }
}
