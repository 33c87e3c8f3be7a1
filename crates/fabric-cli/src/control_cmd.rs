//! `fabric cancel` / `fabric resume`: control a running or suspended apply.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use fabric_core::config::ExecutorConfig;
use fabric_core::lifecycle::LifecycleController;
use fabric_core::state::StateStore;
use fabric_db::error::StoreError;

fn store_err(err: StoreError) -> anyhow::Error {
    anyhow::anyhow!("[{}] {err}", err.code())
}

/// Request cancellation of an apply.
///
/// With `--rollback`, a rollback plan is derived and executed by the
/// driving process once the cancel lands.
pub async fn run_cancel(pool: &PgPool, apply_id: &str, rollback: bool) -> Result<()> {
    let store = StateStore::new(pool.clone());
    let transition = store
        .cancel_request(apply_id, rollback)
        .await
        .map_err(store_err)?;

    if transition.stale_process {
        // The recorded process no longer exists; the run was abandoned.
        eprintln!("[E40028] the process driving apply {apply_id} has vanished");
    }

    let mut output = serde_json::json!({
        "applyID": apply_id,
        "status": transition.status,
    });
    if let Some(rollback_status) = transition.rollback_status {
        output["rollbackStatus"] = serde_json::to_value(rollback_status)?;
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Resume a suspended apply (or its suspended rollback) in this process.
pub async fn run_resume(pool: &PgPool, executor: ExecutorConfig, apply_id: &str) -> Result<()> {
    let store = StateStore::new(pool.clone());
    let controller = LifecycleController::with_api_drivers(store, Arc::new(executor));

    let summary = controller.resume(apply_id).await?;

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
