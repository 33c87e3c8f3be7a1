//! Durable apply-state store.
//!
//! Wraps the raw queries in `fabric-db` with the state-machine semantics:
//! single-flight admission, the cancel transition table, resume
//! transitions, and delete protection. All decisions run inside
//! SERIALIZABLE transactions retried on serialization failure.

use chrono::Utc;
use rand::Rng;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

use fabric_db::error::StoreError;
use fabric_db::models::{ApplyRecord, ApplyStatus, ControlRow, RollbackStatus};
use fabric_db::queries::applies::{
    self, ApplyUpdate, ListOptions, ListPage, is_serialization_failure,
    unique_violation_constraint,
};

use crate::liveness::{self, ProcessIdentity};
use crate::plan::Plan;

const APPLY_ID_LENGTH: usize = 10;
const SINGLE_ACTIVE_CONSTRAINT: &str = "applystatus_single_active";
const PRIMARY_KEY_CONSTRAINT: &str = "applystatus_pkey";

/// Generate a candidate apply id: 10 lowercase hex characters.
///
/// Collisions are handled by rejection sampling against the primary key.
fn random_apply_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::rng();
    (0..APPLY_ID_LENGTH)
        .map(|_| HEX[rng.random_range(0..HEX.len())] as char)
        .collect()
}

/// Fields of an apply record addressable by a `get` projection.
pub const RECORD_FIELDS: &[&str] = &[
    "applyID",
    "status",
    "procedures",
    "applyResult",
    "rollbackStatus",
    "rollbackProcedures",
    "rollbackResult",
    "resumeProcedures",
    "resumeResult",
    "executeRollback",
    "startedAt",
    "endedAt",
    "canceledAt",
    "rollbackStartedAt",
    "rollbackEndedAt",
    "suspendedAt",
    "resumedAt",
];

/// A `get` projection named a field that does not exist (E40001).
#[derive(Debug, Error)]
#[error("unknown field: {0}")]
pub struct UnknownFieldError(pub String);

impl UnknownFieldError {
    pub fn code(&self) -> &'static str {
        "E40001"
    }
}

/// Project an apply record onto the requested wire fields.
pub fn project_record(
    record: &ApplyRecord,
    fields: &[String],
) -> Result<serde_json::Value, UnknownFieldError> {
    for field in fields {
        if !RECORD_FIELDS.contains(&field.as_str()) {
            return Err(UnknownFieldError(field.clone()));
        }
    }
    let full = serde_json::to_value(record).unwrap_or_default();
    let mut projected = serde_json::Map::new();
    if let serde_json::Value::Object(map) = full {
        for (key, value) in map {
            if fields.iter().any(|f| f == &key) {
                projected.insert(key, value);
            }
        }
    }
    Ok(serde_json::Value::Object(projected))
}

/// Outcome of a cancel request: the state transition that was applied.
#[derive(Debug, Clone)]
pub struct CancelTransition {
    pub prev_status: ApplyStatus,
    pub status: ApplyStatus,
    pub prev_rollback_status: Option<RollbackStatus>,
    pub rollback_status: Option<RollbackStatus>,
    /// The recorded process no longer exists; the run was abandoned (E40028).
    pub stale_process: bool,
}

/// Which phase a resume request re-activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePhase {
    Apply,
    Rollback,
}

/// Result of a resume request: the apply record (with its persisted resume
/// procedures) plus the phase that moved back to IN_PROGRESS.
#[derive(Debug, Clone)]
pub struct ResumeTransition {
    pub record: ApplyRecord,
    pub phase: ResumePhase,
}

enum CancelDecision {
    MarkCanceling,
    MarkFailedStale,
    MarkRollbackFailedStale,
    MarkSuspendedFailed,
    MarkSuspendedRollbackFailed,
    Noop,
    AlreadyExecuted,
}

fn process_is_alive(row: &ControlRow) -> bool {
    match (&row.process_id, &row.execution_command, &row.process_started_at) {
        (Some(pid), Some(command), Some(started_at)) => {
            liveness::is_alive(*pid, command, started_at)
        }
        _ => false,
    }
}

fn decide_cancel(row: &ControlRow) -> CancelDecision {
    match (row.status, row.rollback_status) {
        (ApplyStatus::InProgress, _) => {
            if process_is_alive(row) {
                CancelDecision::MarkCanceling
            } else {
                CancelDecision::MarkFailedStale
            }
        }
        (ApplyStatus::Canceled, Some(RollbackStatus::InProgress)) => {
            if process_is_alive(row) {
                CancelDecision::Noop
            } else {
                CancelDecision::MarkRollbackFailedStale
            }
        }
        (ApplyStatus::Suspended, _) => CancelDecision::MarkSuspendedFailed,
        (_, Some(RollbackStatus::Suspended)) => CancelDecision::MarkSuspendedRollbackFailed,
        (ApplyStatus::Canceling, _) | (ApplyStatus::Canceled, _) => CancelDecision::Noop,
        (ApplyStatus::Completed, _) | (ApplyStatus::Failed, _) => CancelDecision::AlreadyExecuted,
    }
}

/// The durable per-apply row store.
#[derive(Clone)]
pub struct StateStore {
    pool: PgPool,
}

impl StateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Register a new apply: reserve an id, enforce the single-active
    /// invariant, and persist the plan.
    ///
    /// Empty plans are recorded as COMPLETED immediately.
    pub async fn register(&self, plan: &Plan) -> Result<String, StoreError> {
        let procedures = serde_json::to_value(&plan.procedures)
            .map_err(|err| StoreError::Query(sqlx::Error::Decode(Box::new(err))))?;

        loop {
            let apply_id = random_apply_id();
            let now = Utc::now();
            let mut tx = applies::begin_serializable(&self.pool).await?;

            match applies::fetch_active(&mut tx).await {
                Ok(Some(active)) => {
                    let _ = tx.rollback().await;
                    if matches!(
                        active.status,
                        ApplyStatus::InProgress | ApplyStatus::Canceling
                    ) || active.rollback_status == Some(RollbackStatus::InProgress)
                    {
                        return Err(StoreError::AlreadyRunning);
                    }
                    return Err(StoreError::SuspendedExists(active.apply_id));
                }
                Ok(None) => {}
                Err(err) if is_serialization_failure(&err) => {
                    let _ = tx.rollback().await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            let inserted = if plan.is_empty() {
                applies::insert_empty_apply(&mut tx, &apply_id, now).await
            } else {
                applies::insert_apply(&mut tx, &apply_id, &procedures, now).await
            };

            let commit_err = match inserted {
                Ok(()) => match tx.commit().await {
                    Ok(()) => {
                        info!(apply_id = %apply_id, empty = plan.is_empty(), "registered new apply");
                        return Ok(apply_id);
                    }
                    Err(err) => err,
                },
                Err(err) => {
                    let _ = tx.rollback().await;
                    err
                }
            };

            if is_serialization_failure(&commit_err) {
                continue;
            }
            match unique_violation_constraint(&commit_err) {
                Some(constraint) if constraint == PRIMARY_KEY_CONSTRAINT => {
                    debug!(apply_id = %apply_id, "apply id collision, reissuing");
                    continue;
                }
                Some(constraint) if constraint == SINGLE_ACTIVE_CONSTRAINT => {
                    return Err(StoreError::AlreadyRunning);
                }
                _ => return Err(commit_err.into()),
            }
        }
    }

    /// Partial update of status, results, and timestamps.
    pub async fn update(&self, apply_id: &str, update: &ApplyUpdate) -> Result<(), StoreError> {
        applies::update_apply(&self.pool, apply_id, update).await
    }

    /// Record the liveness triple of the process driving the apply.
    pub async fn record_process(
        &self,
        apply_id: &str,
        identity: &ProcessIdentity,
    ) -> Result<(), StoreError> {
        applies::update_process(
            &self.pool,
            apply_id,
            identity.pid,
            &identity.command,
            &identity.started_at,
        )
        .await
    }

    /// Fetch one apply record.
    pub async fn get(&self, apply_id: &str) -> Result<ApplyRecord, StoreError> {
        applies::get_apply(&self.pool, apply_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(apply_id.to_owned()))
    }

    /// List apply records with filters, sorting, and pagination.
    pub async fn list(&self, options: &ListOptions) -> Result<ListPage, StoreError> {
        applies::list_applies(&self.pool, options).await
    }

    /// Delete a terminal apply record.
    ///
    /// Refused with E40024 while any phase of the apply is non-terminal.
    pub async fn delete(&self, apply_id: &str) -> Result<(), StoreError> {
        loop {
            let mut tx = applies::begin_serializable(&self.pool).await?;

            let row = match applies::fetch_control_row(&mut tx, apply_id).await {
                Ok(Some(row)) => row,
                Ok(None) => {
                    let _ = tx.rollback().await;
                    return Err(StoreError::NotFound(apply_id.to_owned()));
                }
                Err(err) if is_serialization_failure(&err) => {
                    let _ = tx.rollback().await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let in_progress = !row.status.is_terminal()
                || matches!(
                    row.rollback_status,
                    Some(RollbackStatus::InProgress) | Some(RollbackStatus::Suspended)
                );
            if in_progress {
                let _ = tx.rollback().await;
                return Err(StoreError::DeleteConflict(apply_id.to_owned()));
            }

            match applies::delete_apply(&mut tx, apply_id).await {
                Ok(_) => match tx.commit().await {
                    Ok(()) => {
                        info!(apply_id, "deleted apply");
                        return Ok(());
                    }
                    Err(err) if is_serialization_failure(&err) => continue,
                    Err(err) => return Err(err.into()),
                },
                Err(err) if is_serialization_failure(&err) => {
                    let _ = tx.rollback().await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Atomic cancel request per the cancel transition table.
    pub async fn cancel_request(
        &self,
        apply_id: &str,
        rollback: bool,
    ) -> Result<CancelTransition, StoreError> {
        loop {
            let mut tx = applies::begin_serializable(&self.pool).await?;

            let row = match applies::fetch_control_row(&mut tx, apply_id).await {
                Ok(Some(row)) => row,
                Ok(None) => {
                    let _ = tx.rollback().await;
                    return Err(StoreError::NotFound(apply_id.to_owned()));
                }
                Err(err) if is_serialization_failure(&err) => {
                    let _ = tx.rollback().await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let mut transition = CancelTransition {
                prev_status: row.status,
                status: row.status,
                prev_rollback_status: row.rollback_status,
                rollback_status: row.rollback_status,
                stale_process: false,
            };
            let now = Utc::now();

            let updated = match decide_cancel(&row) {
                CancelDecision::MarkCanceling => {
                    transition.status = ApplyStatus::Canceling;
                    applies::mark_canceling(&mut tx, apply_id, now, rollback).await
                }
                CancelDecision::MarkFailedStale => {
                    warn!(code = "E40028", apply_id, "driving process vanished");
                    transition.status = ApplyStatus::Failed;
                    transition.stale_process = true;
                    applies::mark_failed(&mut tx, apply_id).await
                }
                CancelDecision::MarkRollbackFailedStale => {
                    warn!(code = "E40028", apply_id, "rollback process vanished");
                    transition.rollback_status = Some(RollbackStatus::Failed);
                    transition.stale_process = true;
                    applies::mark_rollback_failed(&mut tx, apply_id).await
                }
                CancelDecision::MarkSuspendedFailed => {
                    transition.status = ApplyStatus::Failed;
                    applies::mark_suspended_failed(&mut tx, apply_id, now).await
                }
                CancelDecision::MarkSuspendedRollbackFailed => {
                    transition.rollback_status = Some(RollbackStatus::Failed);
                    applies::mark_suspended_rollback_failed(&mut tx, apply_id, now).await
                }
                CancelDecision::Noop => {
                    let _ = tx.rollback().await;
                    return Ok(transition);
                }
                CancelDecision::AlreadyExecuted => {
                    let _ = tx.rollback().await;
                    return Err(StoreError::AlreadyExecuted(apply_id.to_owned()));
                }
            };

            match updated {
                Ok(_) => match tx.commit().await {
                    Ok(()) => {
                        info!(
                            apply_id,
                            status = %transition.status,
                            stale = transition.stale_process,
                            "cancel request processed"
                        );
                        return Ok(transition);
                    }
                    Err(err) if is_serialization_failure(&err) => continue,
                    Err(err) => return Err(err.into()),
                },
                Err(err) if is_serialization_failure(&err) => {
                    let _ = tx.rollback().await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Atomic SUSPENDED -> IN_PROGRESS transition for whichever phase is
    /// suspended. Errors with E40022 when neither phase is suspended.
    pub async fn resume_request(&self, apply_id: &str) -> Result<ResumeTransition, StoreError> {
        let phase = loop {
            let mut tx = applies::begin_serializable(&self.pool).await?;

            let row = match applies::fetch_control_row(&mut tx, apply_id).await {
                Ok(Some(row)) => row,
                Ok(None) => {
                    let _ = tx.rollback().await;
                    return Err(StoreError::NotFound(apply_id.to_owned()));
                }
                Err(err) if is_serialization_failure(&err) => {
                    let _ = tx.rollback().await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let now = Utc::now();
            let (phase, updated) = if row.status == ApplyStatus::Suspended {
                (
                    ResumePhase::Apply,
                    applies::resume_apply(&mut tx, apply_id, now).await,
                )
            } else if row.rollback_status == Some(RollbackStatus::Suspended) {
                (
                    ResumePhase::Rollback,
                    applies::resume_rollback(&mut tx, apply_id, now).await,
                )
            } else {
                let _ = tx.rollback().await;
                return Err(StoreError::AlreadyExecuted(apply_id.to_owned()));
            };

            match updated {
                Ok(_) => match tx.commit().await {
                    Ok(()) => break phase,
                    Err(err) if is_serialization_failure(&err) => continue,
                    Err(err) => return Err(err.into()),
                },
                Err(err) if is_serialization_failure(&err) => {
                    let _ = tx.rollback().await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        };

        let record = self.get(apply_id).await?;
        info!(apply_id, phase = ?phase, "resume request processed");
        Ok(ResumeTransition { record, phase })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::result::OpStatus;
    use chrono::TimeZone;

    #[test]
    fn apply_id_shape() {
        for _ in 0..100 {
            let id = random_apply_id();
            assert_eq!(id.len(), 10);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        }
    }

    fn sample_record() -> ApplyRecord {
        ApplyRecord {
            apply_id: "0123456789".into(),
            status: ApplyStatus::Completed,
            rollback_status: None,
            procedures: Some(serde_json::json!([])),
            apply_result: Some(serde_json::json!([{
                "operationID": 1,
                "status": OpStatus::Completed,
            }])),
            rollback_procedures: None,
            rollback_result: None,
            resume_procedures: None,
            resume_result: None,
            execute_rollback: false,
            started_at: chrono::Utc.with_ymd_and_hms(2025, 1, 30, 0, 0, 0).unwrap(),
            ended_at: None,
            canceled_at: None,
            rollback_started_at: None,
            rollback_ended_at: None,
            suspended_at: None,
            resumed_at: None,
            process_id: None,
            execution_command: None,
            process_started_at: None,
        }
    }

    #[test]
    fn projection_keeps_requested_fields_only() {
        let record = sample_record();
        let projected =
            project_record(&record, &["status".to_owned(), "applyResult".to_owned()]).unwrap();
        let obj = projected.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["status"], "COMPLETED");
        assert!(obj.contains_key("applyResult"));
    }

    #[test]
    fn projection_rejects_unknown_field() {
        let record = sample_record();
        let err = project_record(&record, &["bogus".to_owned()]).unwrap_err();
        assert_eq!(err.code(), "E40001");
    }

    #[test]
    fn cancel_decision_suspended_fails() {
        let row = ControlRow {
            apply_id: "a".into(),
            status: ApplyStatus::Suspended,
            rollback_status: None,
            process_id: None,
            execution_command: None,
            process_started_at: None,
        };
        assert!(matches!(
            decide_cancel(&row),
            CancelDecision::MarkSuspendedFailed
        ));
    }

    #[test]
    fn cancel_decision_in_progress_without_process_is_stale() {
        let row = ControlRow {
            apply_id: "a".into(),
            status: ApplyStatus::InProgress,
            rollback_status: None,
            process_id: None,
            execution_command: None,
            process_started_at: None,
        };
        assert!(matches!(decide_cancel(&row), CancelDecision::MarkFailedStale));
    }

    #[test]
    fn cancel_decision_terminal_is_already_executed() {
        for status in [ApplyStatus::Completed, ApplyStatus::Failed] {
            let row = ControlRow {
                apply_id: "a".into(),
                status,
                rollback_status: None,
                process_id: None,
                execution_command: None,
                process_started_at: None,
            };
            assert!(matches!(
                decide_cancel(&row),
                CancelDecision::AlreadyExecuted
            ));
        }
    }

    #[test]
    fn cancel_decision_canceling_is_idempotent() {
        let row = ControlRow {
            apply_id: "a".into(),
            status: ApplyStatus::Canceling,
            rollback_status: None,
            process_id: None,
            execution_command: None,
            process_started_at: None,
        };
        assert!(matches!(decide_cancel(&row), CancelDecision::Noop));
    }

    #[test]
    fn cancel_decision_rollback_suspended_fails_rollback() {
        let row = ControlRow {
            apply_id: "a".into(),
            status: ApplyStatus::Canceled,
            rollback_status: Some(RollbackStatus::Suspended),
            process_id: None,
            execution_command: None,
            process_started_at: None,
        };
        assert!(matches!(
            decide_cancel(&row),
            CancelDecision::MarkSuspendedRollbackFailed
        ));
    }

    #[test]
    fn cancel_decision_live_apply_uses_current_process() {
        // The current test process is definitely alive, so an IN_PROGRESS
        // row recorded against it transitions to CANCELING.
        let identity = liveness::current();
        let row = ControlRow {
            apply_id: "a".into(),
            status: ApplyStatus::InProgress,
            rollback_status: None,
            process_id: Some(identity.pid),
            execution_command: Some(identity.command.clone()),
            process_started_at: Some(identity.started_at.clone()),
        };
        assert!(matches!(decide_cancel(&row), CancelDecision::MarkCanceling));
    }

}
