//! Lifecycle controller: owns one apply from admission through completion,
//! cancellation, suspension, and resume.
//!
//! The controller registers the apply, records the process liveness triple,
//! runs the scheduler, and persists every phase transition through the
//! state store. A watcher task polls the status row so a cancel request
//! (row moved to CANCELING) trips the scheduler's cancellation token
//! between operations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fabric_db::models::{ApplyRecord, ApplyStatus, RollbackStatus};
use fabric_db::queries::applies::ApplyUpdate;

use crate::config::ExecutorConfig;
use crate::driver::{ApiDrivers, OperationDriver};
use crate::liveness;
use crate::plan::result::OpResult;
use crate::plan::{Operation, Plan};
use crate::resume::plan_resume;
use crate::rollback::plan_rollback;
use crate::scheduler::{self, ScheduleOutcome, ScheduleReport};
use crate::state::{ResumePhase, StateStore};

/// How often the cancel watcher samples the status row.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Builds the driver set for one apply once its id is known.
pub type DriverFactory = dyn Fn(&str) -> Arc<dyn OperationDriver> + Send + Sync;

/// Final state of one apply run.
#[derive(Debug, Clone)]
pub struct ApplySummary {
    pub apply_id: String,
    pub status: ApplyStatus,
    pub rollback_status: Option<RollbackStatus>,
}

/// Runs one apply end-to-end.
pub struct LifecycleController {
    store: StateStore,
    driver_factory: Box<DriverFactory>,
    max_workers: usize,
}

impl LifecycleController {
    pub fn new(store: StateStore, driver_factory: Box<DriverFactory>, max_workers: usize) -> Self {
        Self {
            store,
            driver_factory,
            max_workers,
        }
    }

    /// A controller using the production API drivers.
    pub fn with_api_drivers(store: StateStore, config: Arc<ExecutorConfig>) -> Self {
        let max_workers = config.max_workers;
        let factory = move |apply_id: &str| {
            Arc::new(ApiDrivers::new(Arc::clone(&config), apply_id)) as Arc<dyn OperationDriver>
        };
        Self::new(store, Box::new(factory), max_workers)
    }

    /// Admit and run a plan to a terminal state.
    pub async fn run(&self, plan: &Plan) -> Result<ApplySummary> {
        let apply_id = self.store.register(plan).await?;
        if plan.is_empty() {
            info!(apply_id = %apply_id, "empty plan recorded as completed");
            return Ok(ApplySummary {
                apply_id,
                status: ApplyStatus::Completed,
                rollback_status: None,
            });
        }

        self.store
            .record_process(&apply_id, &liveness::current())
            .await?;

        let driver = (self.driver_factory)(&apply_id);
        let report = self
            .drive_with_watcher(&apply_id, plan, Arc::clone(&driver))
            .await?;

        match report.outcome {
            ScheduleOutcome::Completed => {
                self.store
                    .update(
                        &apply_id,
                        &ApplyUpdate {
                            status: Some(ApplyStatus::Completed),
                            apply_result: Some(report.results_json()),
                            ended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ApplySummary {
                    apply_id,
                    status: ApplyStatus::Completed,
                    rollback_status: None,
                })
            }
            ScheduleOutcome::Failed => {
                self.store
                    .update(
                        &apply_id,
                        &ApplyUpdate {
                            status: Some(ApplyStatus::Failed),
                            apply_result: Some(report.results_json()),
                            ended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ApplySummary {
                    apply_id,
                    status: ApplyStatus::Failed,
                    rollback_status: None,
                })
            }
            ScheduleOutcome::Suspended => {
                let residual = plan_resume(plan, &report.results);
                self.store
                    .update(
                        &apply_id,
                        &ApplyUpdate {
                            status: Some(ApplyStatus::Suspended),
                            apply_result: Some(report.results_json()),
                            resume_procedures: Some(operations_json(&residual)),
                            suspended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(apply_id = %apply_id, remaining = residual.len(), "apply suspended");
                Ok(ApplySummary {
                    apply_id,
                    status: ApplyStatus::Suspended,
                    rollback_status: None,
                })
            }
            ScheduleOutcome::Canceled => {
                self.store
                    .update(
                        &apply_id,
                        &ApplyUpdate {
                            status: Some(ApplyStatus::Canceled),
                            apply_result: Some(report.results_json()),
                            ended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;

                let record = self.store.get(&apply_id).await?;
                if record.execute_rollback {
                    let rollback_status = self
                        .run_rollback_of(&apply_id, plan, driver, &report.results)
                        .await?;
                    return Ok(ApplySummary {
                        apply_id,
                        status: ApplyStatus::Canceled,
                        rollback_status: Some(rollback_status),
                    });
                }
                Ok(ApplySummary {
                    apply_id,
                    status: ApplyStatus::Canceled,
                    rollback_status: None,
                })
            }
        }
    }

    /// Resume a suspended apply (or its suspended rollback).
    pub async fn resume(&self, apply_id: &str) -> Result<ApplySummary> {
        let transition = self.store.resume_request(apply_id).await?;
        let record = transition.record;
        let resume_plan = Plan::new(
            parse_operations(record.resume_procedures.as_ref())
                .context("no resume procedures recorded for suspended apply")?,
        );

        self.store
            .record_process(apply_id, &liveness::current())
            .await?;
        let driver = (self.driver_factory)(apply_id);

        match transition.phase {
            ResumePhase::Apply => {
                self.resume_apply_phase(apply_id, &record, &resume_plan, driver)
                    .await
            }
            ResumePhase::Rollback => {
                let rollback_status = self
                    .run_scheduled_rollback(apply_id, &resume_plan, driver, record.rollback_result.as_ref())
                    .await?;
                Ok(ApplySummary {
                    apply_id: apply_id.to_owned(),
                    status: record.status,
                    rollback_status: Some(rollback_status),
                })
            }
        }
    }

    async fn resume_apply_phase(
        &self,
        apply_id: &str,
        record: &ApplyRecord,
        resume_plan: &Plan,
        driver: Arc<dyn OperationDriver>,
    ) -> Result<ApplySummary> {
        let report = self
            .drive_with_watcher(apply_id, resume_plan, Arc::clone(&driver))
            .await?;

        let mut resume_results = parse_results(record.resume_result.as_ref());
        resume_results.extend(report.results.iter().cloned());
        let resume_results_json = results_json(&resume_results);

        match report.outcome {
            ScheduleOutcome::Completed => {
                self.store
                    .update(
                        apply_id,
                        &ApplyUpdate {
                            status: Some(ApplyStatus::Completed),
                            resume_result: Some(resume_results_json),
                            ended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ApplySummary {
                    apply_id: apply_id.to_owned(),
                    status: ApplyStatus::Completed,
                    rollback_status: None,
                })
            }
            ScheduleOutcome::Failed => {
                self.store
                    .update(
                        apply_id,
                        &ApplyUpdate {
                            status: Some(ApplyStatus::Failed),
                            resume_result: Some(resume_results_json),
                            ended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ApplySummary {
                    apply_id: apply_id.to_owned(),
                    status: ApplyStatus::Failed,
                    rollback_status: None,
                })
            }
            ScheduleOutcome::Suspended => {
                let residual = plan_resume(resume_plan, &report.results);
                self.store
                    .update(
                        apply_id,
                        &ApplyUpdate {
                            status: Some(ApplyStatus::Suspended),
                            resume_result: Some(resume_results_json),
                            resume_procedures: Some(operations_json(&residual)),
                            suspended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ApplySummary {
                    apply_id: apply_id.to_owned(),
                    status: ApplyStatus::Suspended,
                    rollback_status: None,
                })
            }
            ScheduleOutcome::Canceled => {
                self.store
                    .update(
                        apply_id,
                        &ApplyUpdate {
                            status: Some(ApplyStatus::Canceled),
                            resume_result: Some(resume_results_json),
                            ended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;

                let current = self.store.get(apply_id).await?;
                if current.execute_rollback {
                    // Roll back everything done so far: the original apply
                    // results plus every resume result.
                    let full_plan = Plan::new(
                        parse_operations(current.procedures.as_ref())
                            .context("apply has no recorded procedures")?,
                    );
                    let mut all_results = parse_results(current.apply_result.as_ref());
                    all_results.extend(resume_results);
                    let rollback_status = self
                        .run_rollback_of(apply_id, &full_plan, driver, &all_results)
                        .await?;
                    return Ok(ApplySummary {
                        apply_id: apply_id.to_owned(),
                        status: ApplyStatus::Canceled,
                        rollback_status: Some(rollback_status),
                    });
                }
                Ok(ApplySummary {
                    apply_id: apply_id.to_owned(),
                    status: ApplyStatus::Canceled,
                    rollback_status: None,
                })
            }
        }
    }

    /// Derive the inverse plan and run it as the rollback phase.
    async fn run_rollback_of(
        &self,
        apply_id: &str,
        plan: &Plan,
        driver: Arc<dyn OperationDriver>,
        results: &[OpResult],
    ) -> Result<RollbackStatus> {
        let rollback_plan = plan_rollback(plan, results);
        info!(
            apply_id,
            operations = rollback_plan.len(),
            "starting rollback"
        );
        self.store
            .update(
                apply_id,
                &ApplyUpdate {
                    rollback_status: Some(RollbackStatus::InProgress),
                    rollback_procedures: Some(operations_json(&rollback_plan)),
                    rollback_started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        self.run_scheduled_rollback(apply_id, &rollback_plan, driver, None)
            .await
    }

    /// Run an (initial or resumed) rollback plan and persist its outcome.
    ///
    /// Cancel requests arriving while a live rollback runs are no-ops per
    /// the cancel table, so no cancel watcher is attached here.
    async fn run_scheduled_rollback(
        &self,
        apply_id: &str,
        rollback_plan: &Plan,
        driver: Arc<dyn OperationDriver>,
        prior_results: Option<&serde_json::Value>,
    ) -> Result<RollbackStatus> {
        let report = scheduler::run_plan(
            rollback_plan,
            driver,
            self.max_workers,
            CancellationToken::new(),
        )
        .await?;

        let mut results = parse_results(prior_results);
        results.extend(report.results.iter().cloned());
        let results_value = results_json(&results);

        let rollback_status = match report.outcome {
            ScheduleOutcome::Completed => {
                self.store
                    .update(
                        apply_id,
                        &ApplyUpdate {
                            rollback_status: Some(RollbackStatus::Completed),
                            rollback_result: Some(results_value),
                            rollback_ended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                RollbackStatus::Completed
            }
            ScheduleOutcome::Failed | ScheduleOutcome::Canceled => {
                self.store
                    .update(
                        apply_id,
                        &ApplyUpdate {
                            rollback_status: Some(RollbackStatus::Failed),
                            rollback_result: Some(results_value),
                            rollback_ended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                RollbackStatus::Failed
            }
            ScheduleOutcome::Suspended => {
                let residual = plan_resume(rollback_plan, &report.results);
                self.store
                    .update(
                        apply_id,
                        &ApplyUpdate {
                            rollback_status: Some(RollbackStatus::Suspended),
                            rollback_result: Some(results_value),
                            resume_procedures: Some(operations_json(&residual)),
                            suspended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                RollbackStatus::Suspended
            }
        };

        info!(apply_id, rollback_status = %rollback_status, "rollback finished");
        Ok(rollback_status)
    }

    /// Run the scheduler with a watcher that trips the cancellation token
    /// when the status row transitions to CANCELING.
    async fn drive_with_watcher(
        &self,
        apply_id: &str,
        plan: &Plan,
        driver: Arc<dyn OperationDriver>,
    ) -> Result<ScheduleReport> {
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_for_cancel(
            self.store.clone(),
            apply_id.to_owned(),
            cancel.clone(),
        ));

        let report = scheduler::run_plan(plan, driver, self.max_workers, cancel).await;
        watcher.abort();
        report
    }
}

async fn watch_for_cancel(store: StateStore, apply_id: String, cancel: CancellationToken) {
    loop {
        tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        match store.get(&apply_id).await {
            Ok(record) => {
                if record.status == ApplyStatus::Canceling {
                    info!(apply_id = %apply_id, "cancel requested, stopping dispatch");
                    cancel.cancel();
                    return;
                }
                if record.status.is_terminal() {
                    return;
                }
            }
            Err(err) => {
                warn!(apply_id = %apply_id, error = %err, "cancel watcher could not read status");
            }
        }
    }
}

fn operations_json(plan: &Plan) -> serde_json::Value {
    serde_json::to_value(&plan.procedures).unwrap_or_default()
}

fn results_json(results: &[OpResult]) -> serde_json::Value {
    serde_json::to_value(results).unwrap_or_default()
}

fn parse_operations(value: Option<&serde_json::Value>) -> Option<Vec<Operation>> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn parse_results(value: Option<&serde_json::Value>) -> Vec<OpResult> {
    value
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}
