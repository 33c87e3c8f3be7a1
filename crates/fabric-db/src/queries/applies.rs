//! Database query functions for the `applystatus` table.
//!
//! Mutating queries run in SERIALIZABLE transactions and callers (or the
//! wrappers here) retry on serialization failure (SQLSTATE 40001) until the
//! transaction commits. Nothing in this module makes state-machine
//! decisions; that logic lives in `fabric-core::state`.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction};

use crate::error::StoreError;
use crate::models::{ApplyRecord, ApplyStatus, ControlRow, RollbackStatus};

/// SQLSTATE for a serialization failure under SERIALIZABLE isolation.
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for a unique-constraint violation.
const UNIQUE_VIOLATION: &str = "23505";

/// Whether an error is a serialization failure that should be retried.
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(SERIALIZATION_FAILURE)
    )
}

/// Return the violated constraint name if the error is a unique violation.
pub fn unique_violation_constraint(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            db.constraint().map(str::to_owned)
        }
        _ => None,
    }
}

/// Open a transaction at SERIALIZABLE isolation.
pub async fn begin_serializable(
    pool: &PgPool,
) -> Result<Transaction<'static, Postgres>, StoreError> {
    let mut tx = pool.begin().await.map_err(StoreError::from)?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;
    Ok(tx)
}

// -----------------------------------------------------------------------
// Registration
// -----------------------------------------------------------------------

/// Fetch the active row, if any.
///
/// A row is active when its status is IN_PROGRESS, CANCELING, or SUSPENDED,
/// or its rollback status is IN_PROGRESS or SUSPENDED. The partial unique
/// index guarantees at most one such row exists.
pub async fn fetch_active(conn: &mut PgConnection) -> Result<Option<ControlRow>, sqlx::Error> {
    sqlx::query_as::<_, ControlRow>(
        "SELECT apply_id, status, rollback_status, process_id, execution_command, \
                process_started_at \
         FROM applystatus \
         WHERE status IN ('IN_PROGRESS', 'CANCELING', 'SUSPENDED') \
            OR rollback_status IN ('IN_PROGRESS', 'SUSPENDED')",
    )
    .fetch_optional(conn)
    .await
}

/// Insert a new apply row in IN_PROGRESS with its plan.
pub async fn insert_apply(
    conn: &mut PgConnection,
    apply_id: &str,
    procedures: &serde_json::Value,
    started_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO applystatus (apply_id, status, procedures, started_at) \
         VALUES ($1, 'IN_PROGRESS', $2, $3)",
    )
    .bind(apply_id)
    .bind(procedures)
    .bind(started_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Insert a trivially-complete row for an empty plan.
///
/// Records empty procedures and results with matching start/end timestamps.
pub async fn insert_empty_apply(
    conn: &mut PgConnection,
    apply_id: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO applystatus \
            (apply_id, status, procedures, apply_result, started_at, ended_at) \
         VALUES ($1, 'COMPLETED', '[]'::jsonb, '[]'::jsonb, $2, $2)",
    )
    .bind(apply_id)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

// -----------------------------------------------------------------------
// Fetch
// -----------------------------------------------------------------------

/// Fetch a full apply record by id.
pub async fn get_apply(pool: &PgPool, apply_id: &str) -> Result<Option<ApplyRecord>, StoreError> {
    sqlx::query_as::<_, ApplyRecord>("SELECT * FROM applystatus WHERE apply_id = $1")
        .bind(apply_id)
        .fetch_optional(pool)
        .await
        .map_err(StoreError::from)
}

/// Fetch the control slice of a row (status machine + liveness triple).
pub async fn fetch_control_row(
    conn: &mut PgConnection,
    apply_id: &str,
) -> Result<Option<ControlRow>, sqlx::Error> {
    sqlx::query_as::<_, ControlRow>(
        "SELECT apply_id, status, rollback_status, process_id, execution_command, \
                process_started_at \
         FROM applystatus WHERE apply_id = $1",
    )
    .bind(apply_id)
    .fetch_optional(conn)
    .await
}

// -----------------------------------------------------------------------
// Partial update
// -----------------------------------------------------------------------

/// Partial update of an apply row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ApplyUpdate {
    pub status: Option<ApplyStatus>,
    pub rollback_status: Option<RollbackStatus>,
    pub procedures: Option<serde_json::Value>,
    pub apply_result: Option<serde_json::Value>,
    pub rollback_procedures: Option<serde_json::Value>,
    pub rollback_result: Option<serde_json::Value>,
    pub resume_procedures: Option<serde_json::Value>,
    pub resume_result: Option<serde_json::Value>,
    pub ended_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub rollback_started_at: Option<DateTime<Utc>>,
    pub rollback_ended_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
}

impl ApplyUpdate {
    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.rollback_status.is_none()
            && self.procedures.is_none()
            && self.apply_result.is_none()
            && self.rollback_procedures.is_none()
            && self.rollback_result.is_none()
            && self.resume_procedures.is_none()
            && self.resume_result.is_none()
            && self.ended_at.is_none()
            && self.canceled_at.is_none()
            && self.rollback_started_at.is_none()
            && self.rollback_ended_at.is_none()
            && self.suspended_at.is_none()
            && self.resumed_at.is_none()
    }
}

async fn exec_update(
    conn: &mut PgConnection,
    apply_id: &str,
    update: &ApplyUpdate,
) -> Result<u64, sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE applystatus SET ");
    let mut set = qb.separated(", ");
    if let Some(v) = update.status {
        set.push("status = ").push_bind_unseparated(v);
    }
    if let Some(v) = update.rollback_status {
        set.push("rollback_status = ").push_bind_unseparated(v);
    }
    if let Some(v) = &update.procedures {
        set.push("procedures = ").push_bind_unseparated(v);
    }
    if let Some(v) = &update.apply_result {
        set.push("apply_result = ").push_bind_unseparated(v);
    }
    if let Some(v) = &update.rollback_procedures {
        set.push("rollback_procedures = ").push_bind_unseparated(v);
    }
    if let Some(v) = &update.rollback_result {
        set.push("rollback_result = ").push_bind_unseparated(v);
    }
    if let Some(v) = &update.resume_procedures {
        set.push("resume_procedures = ").push_bind_unseparated(v);
    }
    if let Some(v) = &update.resume_result {
        set.push("resume_result = ").push_bind_unseparated(v);
    }
    if let Some(v) = update.ended_at {
        set.push("ended_at = ").push_bind_unseparated(v);
    }
    if let Some(v) = update.canceled_at {
        set.push("canceled_at = ").push_bind_unseparated(v);
    }
    if let Some(v) = update.rollback_started_at {
        set.push("rollback_started_at = ").push_bind_unseparated(v);
    }
    if let Some(v) = update.rollback_ended_at {
        set.push("rollback_ended_at = ").push_bind_unseparated(v);
    }
    if let Some(v) = update.suspended_at {
        set.push("suspended_at = ").push_bind_unseparated(v);
    }
    if let Some(v) = update.resumed_at {
        set.push("resumed_at = ").push_bind_unseparated(v);
    }
    qb.push(" WHERE apply_id = ");
    qb.push_bind(apply_id);

    let result = qb.build().execute(conn).await?;
    Ok(result.rows_affected())
}

/// Apply a partial update, retrying on serialization failure.
///
/// Returns `StoreError::NotFound` when the apply id does not exist.
pub async fn update_apply(
    pool: &PgPool,
    apply_id: &str,
    update: &ApplyUpdate,
) -> Result<(), StoreError> {
    if update.is_empty() {
        return match get_apply(pool, apply_id).await? {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(apply_id.to_owned())),
        };
    }

    loop {
        let mut tx = begin_serializable(pool).await?;
        match exec_update(&mut tx, apply_id, update).await {
            Ok(rows) => match tx.commit().await {
                Ok(()) if rows == 0 => return Err(StoreError::NotFound(apply_id.to_owned())),
                Ok(()) => return Ok(()),
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

/// Record the process liveness triple for an apply.
pub async fn update_process(
    pool: &PgPool,
    apply_id: &str,
    process_id: i64,
    execution_command: &str,
    process_started_at: &str,
) -> Result<(), StoreError> {
    loop {
        let mut tx = begin_serializable(pool).await?;
        let result = sqlx::query(
            "UPDATE applystatus \
             SET process_id = $1, execution_command = $2, process_started_at = $3 \
             WHERE apply_id = $4",
        )
        .bind(process_id)
        .bind(execution_command)
        .bind(process_started_at)
        .bind(apply_id)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(r) => match tx.commit().await {
                Ok(()) if r.rows_affected() == 0 => {
                    return Err(StoreError::NotFound(apply_id.to_owned()));
                }
                Ok(()) => return Ok(()),
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

// -----------------------------------------------------------------------
// Cancel / resume transition statements
// -----------------------------------------------------------------------

/// IN_PROGRESS -> CANCELING with `canceledAt` and the rollback flag.
pub async fn mark_canceling(
    conn: &mut PgConnection,
    apply_id: &str,
    canceled_at: DateTime<Utc>,
    execute_rollback: bool,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE applystatus \
         SET status = 'CANCELING', canceled_at = $1, execute_rollback = $2 \
         WHERE apply_id = $3",
    )
    .bind(canceled_at)
    .bind(execute_rollback)
    .bind(apply_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Force the apply status to FAILED (stale-process path; no timestamp).
pub async fn mark_failed(conn: &mut PgConnection, apply_id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE applystatus SET status = 'FAILED' WHERE apply_id = $1")
        .bind(apply_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

/// SUSPENDED -> FAILED with `canceledAt` (a cancel abandons the run).
pub async fn mark_suspended_failed(
    conn: &mut PgConnection,
    apply_id: &str,
    canceled_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE applystatus SET status = 'FAILED', canceled_at = $1 WHERE apply_id = $2",
    )
    .bind(canceled_at)
    .bind(apply_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Force the rollback status to FAILED (stale rollback process).
pub async fn mark_rollback_failed(
    conn: &mut PgConnection,
    apply_id: &str,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("UPDATE applystatus SET rollback_status = 'FAILED' WHERE apply_id = $1")
            .bind(apply_id)
            .execute(conn)
            .await?;
    Ok(result.rows_affected())
}

/// rollbackStatus SUSPENDED -> FAILED with `canceledAt`.
pub async fn mark_suspended_rollback_failed(
    conn: &mut PgConnection,
    apply_id: &str,
    canceled_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE applystatus SET rollback_status = 'FAILED', canceled_at = $1 \
         WHERE apply_id = $2",
    )
    .bind(canceled_at)
    .bind(apply_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// status SUSPENDED -> IN_PROGRESS with `resumedAt`.
///
/// Optimistically locked on the current SUSPENDED status.
pub async fn resume_apply(
    conn: &mut PgConnection,
    apply_id: &str,
    resumed_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE applystatus SET status = 'IN_PROGRESS', resumed_at = $1 \
         WHERE apply_id = $2 AND status = 'SUSPENDED'",
    )
    .bind(resumed_at)
    .bind(apply_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// rollbackStatus SUSPENDED -> IN_PROGRESS with `resumedAt`.
pub async fn resume_rollback(
    conn: &mut PgConnection,
    apply_id: &str,
    resumed_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE applystatus SET rollback_status = 'IN_PROGRESS', resumed_at = $1 \
         WHERE apply_id = $2 AND rollback_status = 'SUSPENDED'",
    )
    .bind(resumed_at)
    .bind(apply_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Delete an apply row.
pub async fn delete_apply(conn: &mut PgConnection, apply_id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM applystatus WHERE apply_id = $1")
        .bind(apply_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Listing
// -----------------------------------------------------------------------

/// Sortable columns for the apply list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    StartedAt,
    EndedAt,
}

impl SortField {
    fn column(self) -> &'static str {
        match self {
            Self::StartedAt => "started_at",
            Self::EndedAt => "ended_at",
        }
    }
}

impl std::str::FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "startedAt" => Ok(Self::StartedAt),
            "endedAt" => Ok(Self::EndedAt),
            other => Err(format!(
                "invalid sort field {other:?} (expected startedAt or endedAt)"
            )),
        }
    }
}

/// Sort direction for the apply list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Desc,
    Asc,
}

impl SortOrder {
    fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("invalid sort order {other:?} (expected asc or desc)")),
        }
    }
}

/// Filter, sort, and pagination options for the apply list.
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub status: Option<ApplyStatus>,
    pub started_since: Option<DateTime<Utc>>,
    pub started_until: Option<DateTime<Utc>>,
    pub ended_since: Option<DateTime<Utc>>,
    pub ended_until: Option<DateTime<Utc>>,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            status: None,
            started_since: None,
            started_until: None,
            ended_since: None,
            ended_until: None,
            sort_by: SortField::default(),
            order: SortOrder::default(),
            limit: 20,
            offset: 0,
        }
    }
}

/// One page of apply records plus the unpaginated total.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub total_count: i64,
    pub items: Vec<ApplyRecord>,
}

fn push_list_filters<'a>(qb: &mut QueryBuilder<'a, Postgres>, options: &'a ListOptions) {
    let mut has_where = false;
    let and = |qb: &mut QueryBuilder<'a, Postgres>, has_where: &mut bool| {
        qb.push(if *has_where { " AND " } else { " WHERE " });
        *has_where = true;
    };

    if let Some(status) = options.status {
        and(qb, &mut has_where);
        qb.push("status = ").push_bind(status);
    }
    if let Some(ts) = options.started_since {
        and(qb, &mut has_where);
        qb.push("started_at >= ").push_bind(ts);
    }
    if let Some(ts) = options.started_until {
        and(qb, &mut has_where);
        qb.push("started_at <= ").push_bind(ts);
    }
    if let Some(ts) = options.ended_since {
        and(qb, &mut has_where);
        qb.push("ended_at >= ").push_bind(ts);
    }
    if let Some(ts) = options.ended_until {
        and(qb, &mut has_where);
        qb.push("ended_at <= ").push_bind(ts);
    }
}

/// List apply records with filters, sorting, and pagination.
pub async fn list_applies(pool: &PgPool, options: &ListOptions) -> Result<ListPage, StoreError> {
    let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM applystatus");
    push_list_filters(&mut count_qb, options);
    let total_count: i64 = count_qb
        .build_query_scalar()
        .fetch_one(pool)
        .await
        .map_err(StoreError::from)?;

    let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM applystatus");
    push_list_filters(&mut qb, options);
    qb.push(format!(
        " ORDER BY {} {}",
        options.sort_by.column(),
        options.order.keyword()
    ));
    qb.push(" LIMIT ").push_bind(options.limit);
    qb.push(" OFFSET ").push_bind(options.offset);

    let items = qb
        .build_query_as::<ApplyRecord>()
        .fetch_all(pool)
        .await
        .map_err(StoreError::from)?;

    Ok(ListPage { total_count, items })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_field_parses() {
        assert_eq!("startedAt".parse::<SortField>().unwrap(), SortField::StartedAt);
        assert_eq!("endedAt".parse::<SortField>().unwrap(), SortField::EndedAt);
        assert!("started_at".parse::<SortField>().is_err());
    }

    #[test]
    fn sort_order_parses() {
        assert_eq!("asc".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert_eq!("desc".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("ASC".parse::<SortOrder>().is_err());
    }
}
