//! Runs one externally supplied unit of work under validation.
//!
//! The executor knows nothing about individual tasks: a [`TaskConfig`]
//! declares the name, type, progress share and callable, and the executor
//! turns every outcome into a [`TaskResult`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::coord::types::CoordinationRequest;
use crate::core::errors::{CoordError, ErrorInfo, Result};
use crate::taskagent::csi::Csi;
use crate::taskagent::validation::{JsonSchemaValidator, ValidationOutcome, Validator};

/// The work a task wraps. May fail; failures are reported, never retried here.
#[async_trait]
pub trait TaskCallable: Send + Sync {
    async fn call(&self, input: Value) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`TaskCallable`]
pub struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> TaskCallable for FnTask<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, input: Value) -> anyhow::Result<Value> {
        (self.0)(input).await
    }
}

pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskCallable>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnTask(f))
}

/// Declarative description of one unit of work
#[derive(Clone)]
pub struct TaskConfig {
    pub name: String,
    pub task_type: String,
    /// Progress (0-100) the run reaches once this task completes
    pub step_progress: u8,
    pub input_validator: Option<Arc<dyn Validator>>,
    pub output_validator: Option<Arc<dyn Validator>>,
    pub callable: Arc<dyn TaskCallable>,
}

impl TaskConfig {
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        step_progress: u8,
        callable: Arc<dyn TaskCallable>,
    ) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            step_progress: step_progress.min(100),
            input_validator: None,
            output_validator: None,
            callable,
        }
    }

    pub fn with_input_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.input_validator = Some(validator);
        self
    }

    pub fn with_output_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.output_validator = Some(validator);
        self
    }

    pub fn with_input_schema(self, schema: Value) -> Result<Self> {
        Ok(self.with_input_validator(Arc::new(JsonSchemaValidator::new(schema)?)))
    }

    pub fn with_output_schema(self, schema: Value) -> Result<Self> {
        Ok(self.with_output_validator(Arc::new(JsonSchemaValidator::new(schema)?)))
    }
}

impl fmt::Debug for TaskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskConfig")
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("step_progress", &self.step_progress)
            .field("validates_input", &self.input_validator.is_some())
            .field("validates_output", &self.output_validator.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TaskResult {
    Success {
        output: Value,
        #[serde(rename = "updatedCSI")]
        updated_csi: Csi,
    },
    Failure {
        error: ErrorInfo,
    },
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success { .. })
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            TaskResult::Failure { error } => Some(error),
            TaskResult::Success { .. } => None,
        }
    }

    fn failure(err: CoordError) -> Self {
        TaskResult::Failure {
            error: err.to_info(),
        }
    }
}

/// Stateless; one instance can serve any number of concurrent calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskExecutor;

impl TaskExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Validate, run, validate again, fold progress into the request's CSI.
    /// Returned errors are data; only a panic inside the callable escapes.
    pub async fn execute(
        &self,
        request: &CoordinationRequest,
        input: Value,
        task: &TaskConfig,
    ) -> TaskResult {
        let prior = request.csi.clone().unwrap_or_default();

        let input = match &task.input_validator {
            Some(validator) => match validator.validate(&input) {
                ValidationOutcome::Valid(value) => value,
                ValidationOutcome::Invalid(errors) => {
                    warn!(task = %task.name, "Input rejected");
                    return TaskResult::failure(CoordError::validation_stage(
                        format!("Input for task {} failed validation", task.name),
                        "input",
                        errors,
                    ));
                }
            },
            None => input,
        };

        debug!(task = %task.name, task_type = %task.task_type, "Invoking task");
        let output = match task.callable.call(input).await {
            Ok(output) => output,
            Err(e) => {
                warn!(task = %task.name, error = %e, "Task failed");
                return TaskResult::failure(CoordError::task_execution(task.name.clone(), e));
            }
        };

        let output = match &task.output_validator {
            Some(validator) => match validator.validate(&output) {
                ValidationOutcome::Valid(value) => value,
                ValidationOutcome::Invalid(errors) => {
                    warn!(task = %task.name, "Output rejected");
                    return TaskResult::failure(CoordError::validation_stage(
                        format!("Output of task {} failed validation", task.name),
                        "output",
                        errors,
                    ));
                }
            },
            None => output,
        };

        TaskResult::Success {
            output,
            updated_csi: prior.advance(&task.name, task.step_progress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ErrorCode;
    use serde_json::json;

    fn echo(progress: u8) -> TaskConfig {
        TaskConfig::new(
            "echo",
            "utility",
            progress,
            task_fn(|input: Value| async move { Ok::<_, anyhow::Error>(json!({ "echo": input })) }),
        )
    }

    #[tokio::test]
    async fn test_success_merges_progress() {
        let request = CoordinationRequest::new("u", "t").with_csi(Csi::new(4).advance("prev", 40));
        let result = TaskExecutor::new()
            .execute(&request, json!("hi"), &echo(70))
            .await;

        match result {
            TaskResult::Success {
                output,
                updated_csi,
            } => {
                assert_eq!(output, json!({"echo": "hi"}));
                assert_eq!(updated_csi.completed_steps, vec!["prev", "echo"]);
                assert_eq!(updated_csi.current_progress, 70);
                assert_eq!(updated_csi.total_steps, 4);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lower_declared_progress_does_not_regress() {
        let request = CoordinationRequest::new("u", "t").with_csi(Csi::new(4).advance("prev", 80));
        let result = TaskExecutor::new()
            .execute(&request, json!(null), &echo(10))
            .await;
        match result {
            TaskResult::Success { updated_csi, .. } => assert_eq!(updated_csi.current_progress, 80),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_input_validation_failure_skips_callable() {
        let task = TaskConfig::new(
            "strict",
            "utility",
            10,
            task_fn(|_| async { Err::<Value, _>(anyhow::anyhow!("must not run")) }),
        )
        .with_input_schema(json!({"type": "object", "required": ["prompt"]}))
        .unwrap();

        let result = TaskExecutor::new()
            .execute(&CoordinationRequest::new("u", "t"), json!({}), &task)
            .await;
        let error = result.error().unwrap();
        assert_eq!(error.code, ErrorCode::ValidationFailed);
        assert_eq!(error.details.as_ref().unwrap()["stage"], "input");
    }

    #[tokio::test]
    async fn test_callable_error_is_reported() {
        let task = TaskConfig::new(
            "flaky",
            "utility",
            10,
            task_fn(|_| async { Err::<Value, _>(anyhow::anyhow!("upstream 503")) }),
        );
        let result = TaskExecutor::new()
            .execute(&CoordinationRequest::new("u", "t"), json!({}), &task)
            .await;
        let error = result.error().unwrap();
        assert_eq!(error.code, ErrorCode::TaskExecutionFailed);
        assert!(error.message.contains("upstream 503"));
    }

    #[tokio::test]
    async fn test_malformed_output_is_a_validation_failure() {
        let task = echo(10)
            .with_output_schema(json!({"type": "string"}))
            .unwrap();
        let result = TaskExecutor::new()
            .execute(&CoordinationRequest::new("u", "t"), json!(1), &task)
            .await;
        let error = result.error().unwrap();
        assert_eq!(error.code, ErrorCode::ValidationFailed);
        assert_eq!(error.details.as_ref().unwrap()["stage"], "output");
    }
}
