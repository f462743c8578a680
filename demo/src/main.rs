use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use stepgate::{
    content_generation_steps, task_fn, CoordinationConfig, CoordinationManager,
    CoordinationRequest, LoggingHook, MemoryKvStore, OrchestrationManager, TaskCallable,
    WorkflowStep,
};

// Stand-in for a model call: echoes what it was given plus a short note
fn stub_step(step: &WorkflowStep) -> Arc<dyn TaskCallable> {
    let step_id = step.step_id;
    task_fn(move |input: Value| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen: Vec<String> = input
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        Ok::<_, anyhow::Error>(json!({
            "step": step_id,
            "inputs_seen": seen,
        }))
    })
}

fn failing_brand_step(step: &WorkflowStep) -> Arc<dyn TaskCallable> {
    if step.step_id == "brand_analysis" {
        task_fn(|_| async { Err::<Value, _>(anyhow!("brand profile not found")) })
    } else {
        stub_step(step)
    }
}

fn load_config() -> Result<CoordinationConfig> {
    let config = match std::env::args().nth(1) {
        Some(path) => CoordinationConfig::from_yaml_file(path)?,
        None => CoordinationConfig::default(),
    };
    Ok(config.apply_env_overrides()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let coordinator = CoordinationManager::new(Arc::new(MemoryKvStore::new()), config)?
        .with_hook(Arc::new(LoggingHook));
    let orchestrator = OrchestrationManager::from_coordinator(coordinator);
    let request = CoordinationRequest::new("demo-user", "demo-thread");
    let shared = json!({ "prompt": "Write a launch announcement for our new espresso blend" });

    let run = orchestrator
        .execute_orchestration(&request, content_generation_steps(stub_step), shared.clone())
        .await;
    println!("{}", serde_json::to_string_pretty(&run)?);

    let failed = orchestrator
        .execute_orchestration(&request, content_generation_steps(failing_brand_step), shared)
        .await;
    println!("{}", serde_json::to_string_pretty(&failed)?);

    let busy = orchestrator
        .coordinator()
        .is_operation_in_progress(&request.user_id, &request.thread_id)
        .await?;
    println!("slot still held: {}", busy);

    Ok(())
}
