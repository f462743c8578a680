//! Event hook system for coordinated runs
//!
//! Hooks observe lock and step lifecycle events. They are notified after the
//! fact and are never consulted for mutual exclusion.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::coord::types::LockKey;
use crate::core::errors::ErrorInfo;

/// Events that occur during coordinated execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    LockAcquired {
        lock_key: LockKey,
        lock_id: String,
    },
    LockContended {
        lock_key: LockKey,
        holder: Option<String>,
    },
    LockReleased {
        lock_key: LockKey,
        released: bool,
    },
    StepStarted {
        step_id: String,
    },
    StepCompleted {
        step_id: String,
        progress: u8,
    },
    StepFailed {
        step_id: String,
        error: ErrorInfo,
    },
    OrchestrationFinished {
        success: bool,
        completed: usize,
        total: usize,
    },
}

#[async_trait]
pub trait EventHook: Send + Sync {
    async fn on_event(&self, event: &ExecutionEvent);
}

/// Writes every event to the tracing log
pub struct LoggingHook;

#[async_trait]
impl EventHook for LoggingHook {
    async fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::LockAcquired { lock_key, lock_id } => {
                tracing::info!("Lock acquired: {} ({})", lock_key, lock_id);
            }
            ExecutionEvent::LockContended { lock_key, holder } => {
                tracing::warn!("Lock contended: {} held by {:?}", lock_key, holder);
            }
            ExecutionEvent::LockReleased { lock_key, released } => {
                tracing::info!("Lock released: {} (deleted: {})", lock_key, released);
            }
            ExecutionEvent::StepStarted { step_id } => {
                tracing::info!("Step started: {}", step_id);
            }
            ExecutionEvent::StepCompleted { step_id, progress } => {
                tracing::info!("Step completed: {} ({}%)", step_id, progress);
            }
            ExecutionEvent::StepFailed { step_id, error } => {
                tracing::error!("Step failed: {} - {}", step_id, error);
            }
            ExecutionEvent::OrchestrationFinished {
                success,
                completed,
                total,
            } => {
                tracing::info!(
                    "Orchestration finished: success={} ({}/{} steps)",
                    success,
                    completed,
                    total
                );
            }
        }
    }
}

/// Fans one event out to several hooks, in registration order
#[derive(Clone, Default)]
pub struct CompositeHook {
    hooks: Vec<Arc<dyn EventHook>>,
}

impl CompositeHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: Arc<dyn EventHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl EventHook for CompositeHook {
    async fn on_event(&self, event: &ExecutionEvent) {
        for hook in &self.hooks {
            hook.on_event(event).await;
        }
    }
}

/// Keeps every event in memory, in arrival order
#[derive(Clone, Default)]
pub struct RecordingHook {
    events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().await.clone()
    }

    /// Ids of steps that reached `StepStarted`, in order
    pub async fn started_steps(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::StepStarted { step_id } => Some(step_id.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventHook for RecordingHook {
    async fn on_event(&self, event: &ExecutionEvent) {
        self.events.lock().await.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_hook_keeps_order() {
        let hook = RecordingHook::new();
        hook.on_event(&ExecutionEvent::StepStarted {
            step_id: "a".into(),
        })
        .await;
        hook.on_event(&ExecutionEvent::StepCompleted {
            step_id: "a".into(),
            progress: 50,
        })
        .await;
        hook.on_event(&ExecutionEvent::StepStarted {
            step_id: "b".into(),
        })
        .await;

        assert_eq!(hook.events().await.len(), 3);
        assert_eq!(hook.started_steps().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_composite_hook_fans_out() {
        let first = RecordingHook::new();
        let second = RecordingHook::new();
        let composite = CompositeHook::new()
            .with(Arc::new(first.clone()))
            .with(Arc::new(second.clone()))
            .with(Arc::new(LoggingHook));
        assert_eq!(composite.len(), 3);

        composite
            .on_event(&ExecutionEvent::StepStarted {
                step_id: "a".into(),
            })
            .await;
        assert_eq!(first.started_steps().await, vec!["a"]);
        assert_eq!(second.started_steps().await, vec!["a"]);
    }

    #[test]
    fn test_event_serialization() {
        let value = serde_json::to_value(ExecutionEvent::StepStarted {
            step_id: "intent_analysis".into(),
        })
        .unwrap();
        assert_eq!(value["event"], "stepStarted");
        assert_eq!(value["stepId"], "intent_analysis");
        assert!(value.get("step_id").is_none());

        let value = serde_json::to_value(ExecutionEvent::LockAcquired {
            lock_key: LockKey::derive("agent_lock", "u", "t"),
            lock_id: "l-1".into(),
        })
        .unwrap();
        assert_eq!(value["event"], "lockAcquired");
        assert_eq!(value["lockKey"], "agent_lock:1:u:1:t");
        assert_eq!(value["lockId"], "l-1");
    }
}
