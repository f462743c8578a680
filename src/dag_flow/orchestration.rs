//! Runs a set of interdependent steps to completion, each under its own
//! coordinated lock acquisition.
//!
//! Ready sets come from [`StepGraph`]; a step starts only after every one of
//! its dependencies completed. The first failing step aborts the run and
//! whatever finished before it is returned.

use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::coord::coordinator::CoordinationManager;
use crate::coord::hooks::ExecutionEvent;
use crate::coord::types::{
    CoordinationRequest, CoordinationResult, ExecutionReport, LockKey, LockOptions, LockReport,
};
use crate::core::config::CoordinationConfig;
use crate::core::errors::{CoordError, ErrorInfo, Result};
use crate::dag_flow::graph::{ReadySet, StepGraph, Wave};
use crate::dag_flow::step::{OrchestrationStep, StepDefinition, StepStatus};
use crate::storage::KvStore;
use crate::taskagent::csi::Csi;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResult {
    pub success: bool,
    /// step id -> output, for every step that completed
    pub result: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Final bookkeeping for every step, in definition order
    pub steps: Vec<OrchestrationStep>,
    pub csi: Csi,
    pub duration_ms: u64,
}

impl OrchestrationResult {
    pub fn step(&self, step_id: &str) -> Option<&OrchestrationStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Ids of steps with `status`, in definition order
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.step_id.as_str())
            .collect()
    }
}

/// Mutable state of one run, owned by `execute_orchestration`
struct RunState {
    steps: Vec<OrchestrationStep>,
    positions: HashMap<String, usize>,
    outputs: BTreeMap<String, Value>,
    csi: Csi,
}

impl RunState {
    fn new(definitions: &[StepDefinition]) -> Self {
        let steps: Vec<OrchestrationStep> = definitions
            .iter()
            .map(OrchestrationStep::from_definition)
            .collect();
        let positions = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.clone(), i))
            .collect();
        Self {
            csi: Csi::new(steps.len() as u32),
            steps,
            positions,
            outputs: BTreeMap::new(),
        }
    }

    fn step_mut(&mut self, step_id: &str) -> Option<&mut OrchestrationStep> {
        let pos = *self.positions.get(step_id)?;
        self.steps.get_mut(pos)
    }

    fn skip_pending(&mut self) {
        for step in self.steps.iter_mut() {
            if step.status == StepStatus::Pending {
                step.mark_skipped();
            }
        }
    }
}

#[derive(Clone)]
pub struct OrchestrationManager {
    coordinator: CoordinationManager,
}

impl OrchestrationManager {
    pub fn new(store: Arc<dyn KvStore>, config: CoordinationConfig) -> Result<Self> {
        Ok(Self {
            coordinator: CoordinationManager::new(store, config)?,
        })
    }

    pub fn from_coordinator(coordinator: CoordinationManager) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &CoordinationManager {
        &self.coordinator
    }

    fn config(&self) -> &CoordinationConfig {
        self.coordinator.config()
    }

    /// Execute `steps` in dependency order.
    #[instrument(
        skip(self, request, steps, shared_data),
        fields(user_id = %request.user_id, thread_id = %request.thread_id, steps = steps.len())
    )]
    pub async fn execute_orchestration(
        &self,
        request: &CoordinationRequest,
        steps: Vec<StepDefinition>,
        shared_data: Value,
    ) -> OrchestrationResult {
        let started = Instant::now();
        let mut state = RunState::new(&steps);

        let graph = match StepGraph::build(&steps) {
            Ok(graph) => graph,
            Err(e) => {
                warn!(error = %e, "Rejected malformed step graph");
                state.skip_pending();
                return self.finish(state, Some(e.to_info()), started).await;
            }
        };
        let definitions: HashMap<&str, &StepDefinition> =
            steps.iter().map(|d| (d.step_id.as_str(), d)).collect();

        info!(total = graph.len(), "Orchestration started");
        let mut scheduler = graph.scheduler();

        loop {
            match scheduler.next_wave() {
                Wave::Ready(ready) => {
                    let wave: Vec<&StepDefinition> = ready
                        .iter()
                        .filter_map(|id| definitions.get(id.as_str()).copied())
                        .collect();

                    let failure = if self.config().parallel_waves && wave.len() > 1 {
                        let outcomes = self
                            .run_parallel(request, &wave, &shared_data, &mut state)
                            .await;
                        self.record_wave(outcomes, &mut state, &mut scheduler).await
                    } else {
                        let mut failure = None;
                        for def in &wave {
                            let outcome = self
                                .run_step(request, def, &shared_data, &mut state)
                                .await;
                            failure = self
                                .record_wave(vec![(*def, outcome)], &mut state, &mut scheduler)
                                .await;
                            if failure.is_some() {
                                break;
                            }
                        }
                        failure
                    };

                    if let Some(err) = failure {
                        error!(error = %err, "Orchestration aborted");
                        state.skip_pending();
                        return self.finish(state, Some(err.to_info()), started).await;
                    }
                }
                Wave::Finished => {
                    info!("Orchestration completed");
                    return self.finish(state, None, started).await;
                }
                Wave::Deadlock {
                    pending,
                    completed,
                    missing_dependencies,
                } => {
                    error!(?pending, ?completed, "Orchestration deadlocked");
                    let err = CoordError::Deadlock {
                        pending,
                        completed,
                        missing_dependencies,
                    };
                    state.skip_pending();
                    return self.finish(state, Some(err.to_info()), started).await;
                }
                Wave::Waiting => {
                    // every wave is drained before the next is requested
                    let err = CoordError::coordination(
                        "schedule",
                        "scheduler reported in-flight steps between waves",
                    );
                    state.skip_pending();
                    return self.finish(state, Some(err.to_info()), started).await;
                }
            }
        }
    }

    /// Run one step in the request's own slot.
    async fn run_step(
        &self,
        request: &CoordinationRequest,
        def: &StepDefinition,
        shared_data: &Value,
        state: &mut RunState,
    ) -> CoordinationResult {
        let input = step_input(shared_data, &def.dependencies, &state.outputs);
        let step_request = self.step_request(request, def, &state.csi, false);
        if let Some(step) = state.step_mut(&def.step_id) {
            step.mark_running();
        }
        self.coordinator
            .emit(ExecutionEvent::StepStarted {
                step_id: def.step_id.clone(),
            })
            .await;

        self.coordinator
            .execute_task_with_lock(
                &step_request,
                input,
                &def.task,
                Some(self.step_lock_options(false)),
            )
            .await
    }

    /// Run a whole ready set at once. Each step gets a slot of its own under
    /// the step key prefix, derived from the request's thread and the step id.
    async fn run_parallel<'d>(
        &self,
        request: &CoordinationRequest,
        wave: &[&'d StepDefinition],
        shared_data: &Value,
        state: &mut RunState,
    ) -> Vec<(&'d StepDefinition, CoordinationResult)> {
        let permits = Arc::new(Semaphore::new(self.config().max_parallel_steps));
        debug!(width = wave.len(), "Running wave in parallel");

        let mut prepared = Vec::with_capacity(wave.len());
        for def in wave {
            let input = step_input(shared_data, &def.dependencies, &state.outputs);
            let step_request = self.step_request(request, def, &state.csi, true);
            if let Some(step) = state.step_mut(&def.step_id) {
                step.mark_running();
            }
            self.coordinator
                .emit(ExecutionEvent::StepStarted {
                    step_id: def.step_id.clone(),
                })
                .await;
            prepared.push((*def, step_request, input));
        }

        let runs = prepared.into_iter().map(|(def, step_request, input)| {
            let permits = permits.clone();
            async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        self.coordinator
                            .execute_task_with_lock(
                                &step_request,
                                input,
                                &def.task,
                                Some(self.step_lock_options(true)),
                            )
                            .await
                    }
                    Err(e) => {
                        let prefix = self.step_key_prefix();
                        let lock_key = self.coordinator.lock_manager().lock_key(
                            &step_request.user_id,
                            &step_request.thread_id,
                            Some(&prefix),
                        );
                        failed_before_lock(
                            lock_key,
                            CoordError::coordination("parallel_wave", e.to_string()).to_info(),
                        )
                    }
                };
                (def, outcome)
            }
        });

        // join_all keeps input order, which is definition order
        join_all(runs).await
    }

    /// Fold step outcomes into the run, in the order given. Returns the
    /// error of the first step that failed.
    async fn record_wave(
        &self,
        outcomes: Vec<(&StepDefinition, CoordinationResult)>,
        state: &mut RunState,
        scheduler: &mut ReadySet<'_>,
    ) -> Option<CoordError> {
        let mut failure = None;
        for (def, outcome) in outcomes {
            match self.record(def, outcome, state).await {
                None => scheduler.complete(&def.step_id),
                Some(cause) if failure.is_none() => {
                    failure = Some(CoordError::StepFailed {
                        step_id: def.step_id.clone(),
                        cause,
                    });
                }
                Some(_) => {}
            }
        }
        failure
    }

    async fn record(
        &self,
        def: &StepDefinition,
        outcome: CoordinationResult,
        state: &mut RunState,
    ) -> Option<ErrorInfo> {
        if outcome.success {
            let output = outcome.result.unwrap_or(Value::Null);
            let completed = state.outputs.len() + 1;
            let progress = Csi::progress_for(completed, state.csi.total_steps)
                .max(def.task.step_progress);
            state.csi = state.csi.advance(&def.step_id, progress);
            state.outputs.insert(def.step_id.clone(), output.clone());
            if let Some(step) = state.step_mut(&def.step_id) {
                step.mark_completed(output, 100);
            }
            self.coordinator
                .emit(ExecutionEvent::StepCompleted {
                    step_id: def.step_id.clone(),
                    progress: state.csi.current_progress,
                })
                .await;
            None
        } else {
            let error = outcome.error.unwrap_or_else(|| {
                CoordError::coordination("execute_step", "step failed without an error").to_info()
            });
            warn!(step_id = %def.step_id, error = %error, "Step failed");
            if let Some(step) = state.step_mut(&def.step_id) {
                step.mark_failed(error.clone());
            }
            self.coordinator
                .emit(ExecutionEvent::StepFailed {
                    step_id: def.step_id.clone(),
                    error: error.clone(),
                })
                .await;
            Some(error)
        }
    }

    fn step_request(
        &self,
        request: &CoordinationRequest,
        def: &StepDefinition,
        csi: &Csi,
        own_slot: bool,
    ) -> CoordinationRequest {
        let thread_id = if own_slot {
            step_slot_thread(&request.thread_id, &def.step_id)
        } else {
            request.thread_id.clone()
        };
        CoordinationRequest {
            user_id: request.user_id.clone(),
            thread_id,
            csi: Some(csi.begin(&def.step_id)),
        }
    }

    fn step_lock_options(&self, own_slot: bool) -> LockOptions {
        let options = LockOptions::new().with_ttl(self.config().orchestration_ttl_seconds);
        if own_slot {
            options.with_key_prefix(self.step_key_prefix())
        } else {
            options
        }
    }

    /// Namespace for per-step slots, disjoint from the configured one
    fn step_key_prefix(&self) -> String {
        format!("{}_step", self.config().key_prefix)
    }

    async fn finish(
        &self,
        state: RunState,
        error: Option<ErrorInfo>,
        started: Instant,
    ) -> OrchestrationResult {
        let success = error.is_none();
        self.coordinator
            .emit(ExecutionEvent::OrchestrationFinished {
                success,
                completed: state.outputs.len(),
                total: state.steps.len(),
            })
            .await;
        OrchestrationResult {
            success,
            result: state.outputs,
            error,
            steps: state.steps,
            csi: state.csi,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Shared data overlaid with each dependency's output under its step id.
/// Non-object shared data is kept under `"shared"`.
fn step_input(
    shared_data: &Value,
    dependencies: &BTreeSet<String>,
    outputs: &BTreeMap<String, Value>,
) -> Value {
    let mut input = match shared_data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("shared".to_string(), other.clone());
            map
        }
    };
    for dep in dependencies {
        if let Some(output) = outputs.get(dep) {
            input.insert(dep.clone(), output.clone());
        }
    }
    Value::Object(input)
}

/// Thread component of a per-step slot. Both parts are length-prefixed so
/// distinct (thread, step) pairs never share a slot.
fn step_slot_thread(thread_id: &str, step_id: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        thread_id.len(),
        thread_id,
        step_id.len(),
        step_id
    )
}

fn failed_before_lock(lock_key: LockKey, error: ErrorInfo) -> CoordinationResult {
    let now = chrono::Utc::now();
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
        execution_metadata: ExecutionReport::since(now),
    }
}
