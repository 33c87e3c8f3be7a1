//! `fabric apply`: admit a plan file and run it to a terminal state.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;

use fabric_core::config::ExecutorConfig;
use fabric_core::lifecycle::LifecycleController;
use fabric_core::plan::Plan;
use fabric_core::state::StateStore;

/// Read, validate, and execute a plan.
pub async fn run_apply(pool: &PgPool, executor: ExecutorConfig, plan_path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(plan_path)
        .with_context(|| format!("failed to read plan file {}", plan_path.display()))?;
    let plan = Plan::from_json(&contents)
        .map_err(|err| anyhow::anyhow!("[{}] invalid plan: {err}", err.code()))?;

    let store = StateStore::new(pool.clone());
    let controller = LifecycleController::with_api_drivers(store, Arc::new(executor));

    let summary = controller.run(&plan).await?;

    let mut output = serde_json::json!({
        "applyID": summary.apply_id,
        "status": summary.status,
    });
    if let Some(rollback_status) = summary.rollback_status {
        output["rollbackStatus"] = serde_json::to_value(rollback_status)?;
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
