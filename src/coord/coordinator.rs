//! Coordination manager: acquire, run one task, release.
//!
//! Release is attempted on every exit path once the lock was taken,
//! including a panic inside the task callable. Every public call returns a
//! result record; nothing is raised past this boundary.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::coord::hooks::{EventHook, ExecutionEvent};
use crate::coord::lock::LockManager;
use crate::coord::types::{
    AcquireOutcome, CoordinationRequest, CoordinationResult, ExecutionReport, LockKey,
    LockMetadata, LockOptions, LockReport,
};
use crate::core::config::CoordinationConfig;
use crate::core::errors::{CoordError, ErrorInfo, Result};
use crate::storage::KvStore;
use crate::taskagent::csi::Csi;
use crate::taskagent::executor::{TaskConfig, TaskExecutor, TaskResult};
use crate::taskagent::registry::TaskRegistry;

/// One entry of a strictly ordered task sequence
#[derive(Debug, Clone)]
pub struct SequenceStep {
    pub task: TaskConfig,
    pub input: Value,
    pub lock_options: Option<LockOptions>,
    /// Recorded for callers; this layer never retries
    pub max_retries: u32,
}

impl SequenceStep {
    pub fn new(task: TaskConfig, input: Value) -> Self {
        Self {
            task,
            input,
            lock_options: None,
            max_retries: 0,
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = Some(options);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceResult {
    pub success: bool,
    /// One entry per step that was attempted, in order
    pub results: Vec<CoordinationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub csi: Csi,
}

/// Administrative view of a slot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub lock_key: LockKey,
    pub metadata: LockMetadata,
    pub remaining_seconds: i64,
}

#[derive(Clone)]
pub struct CoordinationManager {
    locks: LockManager,
    executor: TaskExecutor,
    registry: TaskRegistry,
    config: Arc<CoordinationConfig>,
    hooks: Vec<Arc<dyn EventHook>>,
}

impl CoordinationManager {
    pub fn new(store: Arc<dyn KvStore>, config: CoordinationConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            locks: LockManager::new(store, config.clone()),
            executor: TaskExecutor::new(),
            registry: TaskRegistry::new(),
            config,
            hooks: Vec::new(),
        })
    }

    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn EventHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub(crate) async fn emit(&self, event: ExecutionEvent) {
        for hook in &self.hooks {
            hook.on_event(&event).await;
        }
    }

    /// Run `task` inside the request's slot.
    #[instrument(
        skip(self, request, input, task, lock_options),
        fields(user_id = %request.user_id, thread_id = %request.thread_id, task = %task.name)
    )]
    pub async fn execute_task_with_lock(
        &self,
        request: &CoordinationRequest,
        input: Value,
        task: &TaskConfig,
        lock_options: Option<LockOptions>,
    ) -> CoordinationResult {
        let start_time = Utc::now();
        let options = lock_options.unwrap_or_default();
        let lock_key = self.locks.lock_key(
            &request.user_id,
            &request.thread_id,
            options.key_prefix.as_deref(),
        );

        let held = match self
            .locks
            .acquire(&request.user_id, &request.thread_id, &options)
            .await
        {
            Ok(AcquireOutcome::Acquired { metadata }) => metadata,
            Ok(AcquireOutcome::Held { active }) => {
                self.emit(ExecutionEvent::LockContended {
                    lock_key: lock_key.clone(),
                    holder: active.as_ref().map(|m| m.lock_id.clone()),
                })
                .await;
                let holder = active.and_then(|m| serde_json::to_value(m).ok());
                let err = CoordError::lock_acquisition(lock_key.as_str(), holder);
                return Self::not_acquired(lock_key, start_time, err.to_info());
            }
            Err(e) => {
                error!(lock_key = %lock_key, error = %e, "Lock acquisition errored");
                let err = CoordError::Coordination {
                    operation: "acquire".to_string(),
                    message: e.to_string(),
                    source: Some(Box::new(e)),
                };
                return Self::not_acquired(lock_key, start_time, err.to_info());
            }
        };

        self.emit(ExecutionEvent::LockAcquired {
            lock_key: lock_key.clone(),
            lock_id: held.lock_id.clone(),
        })
        .await;
        let held_since = Instant::now();

        let outcome = AssertUnwindSafe(self.executor.execute(request, input, task))
            .catch_unwind()
            .await;

        let lock_released = match self.locks.release_owned(&lock_key, &held.lock_id).await {
            Ok(released) => released,
            Err(e) => {
                // the TTL still bounds how long the slot stays blocked
                error!(lock_key = %lock_key, error = %e, "Lock release errored");
                false
            }
        };
        let lock_duration_ms = held_since.elapsed().as_millis() as u64;
        self.emit(ExecutionEvent::LockReleased {
            lock_key: lock_key.clone(),
            released: lock_released,
        })
        .await;

        let lock_metadata = LockReport {
            lock_key,
            lock_acquired: true,
            lock_released,
            lock_duration_ms,
        };

        let (result, error, csi) = match outcome {
            Ok(TaskResult::Success {
                output,
                updated_csi,
            }) => (Some(output), None, Some(updated_csi)),
            Ok(TaskResult::Failure { error }) => (None, Some(error), None),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task = %task.name, %message, "Task panicked");
                let err = CoordError::coordination(
                    "execute_task",
                    format!("task {} panicked: {}", task.name, message),
                );
                (None, Some(err.to_info()), None)
            }
        };

        let success = error.is_none();
        info!(success, lock_duration_ms, "Coordinated task finished");
        CoordinationResult {
            success,
            result,
            error,
            csi,
            lock_metadata,
            execution_metadata: ExecutionReport::since(start_time),
        }
    }

    /// Resolve `task_name` in the registry, then run it with the lock.
    pub async fn execute_registered(
        &self,
        request: &CoordinationRequest,
        task_name: &str,
        input: Value,
        lock_options: Option<LockOptions>,
    ) -> CoordinationResult {
        match self.registry.get(task_name) {
            Some(task) => {
                self.execute_task_with_lock(request, input, &task, lock_options)
                    .await
            }
            None => {
                let prefix = lock_options.as_ref().and_then(|o| o.key_prefix.as_deref());
                let lock_key = self
                    .locks
                    .lock_key(&request.user_id, &request.thread_id, prefix);
                let err = CoordError::coordination(
                    "resolve_task",
                    format!("Task not registered: {}", task_name),
                );
                Self::not_acquired(lock_key, Utc::now(), err.to_info())
            }
        }
    }

    /// Run `steps` strictly in order, threading each step's CSI into the
    /// next request. Stops at the first failure.
    pub async fn execute_task_sequence(
        &self,
        request: &CoordinationRequest,
        steps: &[SequenceStep],
    ) -> SequenceResult {
        let mut csi = request
            .csi
            .clone()
            .unwrap_or_else(|| Csi::new(steps.len() as u32));
        let mut results = Vec::with_capacity(steps.len());

        for (position, step) in steps.iter().enumerate() {
            let step_request = CoordinationRequest {
                csi: Some(csi.begin(&step.task.name)),
                ..request.clone()
            };
            let outcome = self
                .execute_task_with_lock(
                    &step_request,
                    step.input.clone(),
                    &step.task,
                    step.lock_options.clone(),
                )
                .await;

            if !outcome.success {
                warn!(
                    position,
                    task = %step.task.name,
                    "Sequence stopped at failed step"
                );
                let error = outcome.error.clone();
                results.push(outcome);
                return SequenceResult {
                    success: false,
                    results,
                    error,
                    csi,
                };
            }

            if let Some(next) = &outcome.csi {
                csi = next.clone();
            }
            results.push(outcome);
        }

        SequenceResult {
            success: true,
            results,
            error: None,
            csi,
        }
    }

    /// Whether some run currently holds the slot. Advisory only.
    pub async fn is_operation_in_progress(&self, user_id: &str, thread_id: &str) -> Result<bool> {
        Ok(self.locks.check(user_id, thread_id).await?.is_some())
    }

    /// Force-release a slot. Does not stop the work its holder is doing.
    pub async fn cancel_operation(&self, user_id: &str, thread_id: &str) -> Result<bool> {
        let released = self.locks.release(user_id, thread_id).await?;
        warn!(user_id, thread_id, released, "Operation cancelled administratively");
        Ok(released)
    }

    pub async fn lock_status(&self, user_id: &str, thread_id: &str) -> Result<Option<LockStatus>> {
        let lock_key = self.locks.lock_key(user_id, thread_id, None);
        Ok(self
            .locks
            .check_key(&lock_key)
            .await?
            .map(|metadata| LockStatus {
                remaining_seconds: metadata.remaining_seconds(Utc::now()),
                lock_key,
                metadata,
            }))
    }

    fn not_acquired(
        lock_key: LockKey,
        start_time: DateTime<Utc>,
        error: ErrorInfo,
    ) -> CoordinationResult {
        CoordinationResult {
            success: false,
            result: None,
            error: Some(error),
            csi: None,
            lock_metadata: LockReport {
                lock_key,
                lock_acquired: false,
                lock_released: false,
                lock_duration_ms: 0,
            },
            execution_metadata: ExecutionReport::since(start_time),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
