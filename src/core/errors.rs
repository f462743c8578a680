use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// Error codes surfaced to callers inside result records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    LockAcquisitionFailed,
    TaskExecutionFailed,
    ValidationFailed,
    CoordinationError,
    OrchestrationDeadlock,
    OrchestrationStepFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::LockAcquisitionFailed => "LOCK_ACQUISITION_FAILED",
            ErrorCode::TaskExecutionFailed => "TASK_EXECUTION_FAILED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::CoordinationError => "COORDINATION_ERROR",
            ErrorCode::OrchestrationDeadlock => "ORCHESTRATION_DEADLOCK",
            ErrorCode::OrchestrationStepFailed => "ORCHESTRATION_STEP_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field-level validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// JSON pointer of the offending value ("" for the document root)
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Serializable error record carried by every failed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Unified error type for the coordination subsystem
#[derive(Debug, Error)]
pub enum CoordError {
    /// The slot is held by someone else
    #[error("Lock already held: {lock_key}")]
    LockAcquisition {
        lock_key: String,
        holder: Option<Value>,
    },

    /// Malformed input, output or step graph
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        stage: Option<String>,
        errors: Vec<FieldError>,
    },

    /// The task callable returned an error
    #[error("Task execution failed in {task}: {message}")]
    TaskExecution {
        task: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unexpected fault while coordinating a run
    #[error("Coordination failed during {operation}: {message}")]
    Coordination {
        operation: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// KV store failures
    #[error("Store operation failed: {operation}")]
    Store {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// No pending step can become ready
    #[error("Orchestration deadlocked: {} step(s) can never run", pending.len())]
    Deadlock {
        pending: Vec<String>,
        completed: Vec<String>,
        missing_dependencies: Value,
    },

    #[error("Orchestration step {step_id} failed: {}", cause.message)]
    StepFailed { step_id: String, cause: ErrorInfo },
}

impl CoordError {
    pub fn lock_acquisition<S: Into<String>>(lock_key: S, holder: Option<Value>) -> Self {
        Self::LockAcquisition {
            lock_key: lock_key.into(),
            holder,
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            stage: None,
            errors: Vec::new(),
        }
    }

    /// Validation error for one stage ("input", "output", "graph") with field detail
    pub fn validation_stage<S: Into<String>, T: Into<String>>(
        message: S,
        stage: T,
        errors: Vec<FieldError>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            stage: Some(stage.into()),
            errors,
        }
    }

    pub fn task_execution<S: Into<String>>(task: S, source: anyhow::Error) -> Self {
        Self::TaskExecution {
            task: task.into(),
            message: format!("{:#}", source),
            source: Some(source.into()),
        }
    }

    pub fn coordination<S: Into<String>, M: Into<String>>(operation: S, message: M) -> Self {
        Self::Coordination {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn store<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// The code this error is reported under
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LockAcquisition { .. } => ErrorCode::LockAcquisitionFailed,
            Self::Validation { .. } => ErrorCode::ValidationFailed,
            Self::TaskExecution { .. } => ErrorCode::TaskExecutionFailed,
            Self::Coordination { .. }
            | Self::Store { .. }
            | Self::Serialization { .. }
            | Self::Configuration { .. } => ErrorCode::CoordinationError,
            Self::Deadlock { .. } => ErrorCode::OrchestrationDeadlock,
            Self::StepFailed { .. } => ErrorCode::OrchestrationStepFailed,
        }
    }

    /// Contention is the only class a caller should retry as-is.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::LockAcquisition { .. } => true,
            Self::Store { .. } => true,
            Self::TaskExecution { .. } | Self::Coordination { .. } => false,
            Self::Validation { .. } | Self::Configuration { .. } | Self::Serialization { .. } => {
                false
            }
            Self::Deadlock { .. } | Self::StepFailed { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::LockAcquisition { .. } => "contention",
            Self::Validation { .. } => "validation",
            Self::TaskExecution { .. } | Self::Coordination { .. } => "execution",
            Self::Store { .. } => "store",
            Self::Serialization { .. } => "serialization",
            Self::Configuration { .. } => "configuration",
            Self::Deadlock { .. } | Self::StepFailed { .. } => "structural",
        }
    }

    /// Convert into the record handed back to callers, keeping the cause chain.
    pub fn to_info(&self) -> ErrorInfo {
        let details = match self {
            Self::LockAcquisition { lock_key, holder } => Some(json!({
                "lockKey": lock_key,
                "activeLock": holder,
            })),
            Self::Validation { stage, errors, .. } => Some(json!({
                "stage": stage,
                "errors": errors,
            })),
            Self::TaskExecution { task, .. } => Some(json!({
                "task": task,
                "cause": cause_chain(self),
            })),
            Self::Coordination { operation, .. } => Some(json!({
                "operation": operation,
                "cause": cause_chain(self),
            })),
            Self::Store { operation, .. } => Some(json!({
                "operation": operation,
                "cause": cause_chain(self),
            })),
            Self::Serialization { format, .. } => Some(json!({
                "format": format,
                "cause": cause_chain(self),
            })),
            Self::Configuration { field, .. } => field.as_ref().map(|f| json!({ "field": f })),
            Self::Deadlock {
                pending,
                completed,
                missing_dependencies,
            } => Some(json!({
                "pendingSteps": pending,
                "completedSteps": completed,
                "missingDependencies": missing_dependencies,
            })),
            Self::StepFailed { step_id, cause } => Some(json!({
                "stepId": step_id,
                "cause": cause,
            })),
        };

        ErrorInfo {
            code: self.code(),
            message: self.to_string(),
            details,
        }
    }
}

fn cause_chain(err: &dyn std::error::Error) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        chain.push(cause.to_string());
        current = cause.source();
    }
    chain
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CoordError>;

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for CoordError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for CoordError {
    fn from(err: sled::Error) -> Self {
        Self::store("sled_operation", err)
    }
}

impl From<anyhow::Error> for CoordError {
    fn from(err: anyhow::Error) -> Self {
        Self::Coordination {
            operation: "internal".to_string(),
            message: format!("{:#}", err),
            source: Some(err.into()),
        }
    }
}
