//! `fabric get` / `fabric list` / `fabric delete`: inspect and prune the
//! apply status store.

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::PgPool;

use fabric_core::state::{StateStore, project_record};
use fabric_db::error::StoreError;
use fabric_db::models::ApplyStatus;
use fabric_db::queries::applies::{ListOptions, SortField, SortOrder};
use fabric_db::timefmt;

fn store_err(err: StoreError) -> anyhow::Error {
    anyhow::anyhow!("[{}] {err}", err.code())
}

/// Fetch one apply record, optionally projecting fields and writing the
/// output to a file.
pub async fn run_get(
    pool: &PgPool,
    apply_id: &str,
    fields: &[String],
    output: Option<&Path>,
) -> Result<()> {
    let store = StateStore::new(pool.clone());
    let record = store.get(apply_id).await.map_err(store_err)?;

    let value = if fields.is_empty() {
        serde_json::to_value(&record)?
    } else {
        project_record(&record, fields)
            .map_err(|err| anyhow::anyhow!("[{}] {err}", err.code()))?
    };

    let rendered = serde_json::to_string_pretty(&value)?;
    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("failed to write result to {}", path.display()))?;
            println!("result written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

/// Filters accepted by `fabric list`, as raw CLI strings.
#[derive(Debug, Default)]
pub struct ListArgs {
    pub status: Option<String>,
    pub started_since: Option<String>,
    pub started_until: Option<String>,
    pub ended_since: Option<String>,
    pub ended_until: Option<String>,
    pub sort_by: Option<String>,
    pub order_by: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

fn validation_err(message: String) -> anyhow::Error {
    anyhow::anyhow!("[E40001] {message}")
}

fn parse_timestamp(name: &str, value: Option<&str>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    match value {
        Some(raw) => timefmt::from_wire(raw)
            .map(Some)
            .map_err(|_| validation_err(format!("{name} must be an ISO-8601 UTC timestamp"))),
        None => Ok(None),
    }
}

impl ListArgs {
    /// Validate the raw strings into query options.
    pub fn into_options(self) -> Result<ListOptions> {
        if self.limit < 1 {
            return Err(validation_err(format!("limit must be >= 1, got {}", self.limit)));
        }
        if self.offset < 0 {
            return Err(validation_err(format!(
                "offset must be >= 0, got {}",
                self.offset
            )));
        }

        let status = match self.status.as_deref() {
            Some(raw) => Some(
                raw.parse::<ApplyStatus>()
                    .map_err(|err| validation_err(err.to_string()))?,
            ),
            None => None,
        };
        let sort_by = match self.sort_by.as_deref() {
            Some(raw) => raw.parse::<SortField>().map_err(validation_err)?,
            None => SortField::default(),
        };
        let order = match self.order_by.as_deref() {
            Some(raw) => raw.parse::<SortOrder>().map_err(validation_err)?,
            None => SortOrder::default(),
        };

        Ok(ListOptions {
            status,
            started_since: parse_timestamp("startedAtSince", self.started_since.as_deref())?,
            started_until: parse_timestamp("startedAtUntil", self.started_until.as_deref())?,
            ended_since: parse_timestamp("endedAtSince", self.ended_since.as_deref())?,
            ended_until: parse_timestamp("endedAtUntil", self.ended_until.as_deref())?,
            sort_by,
            order,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

/// List apply records with filters, sorting, and pagination.
pub async fn run_list(pool: &PgPool, args: ListArgs) -> Result<()> {
    let options = args.into_options()?;
    let store = StateStore::new(pool.clone());
    let page = store.list(&options).await.map_err(store_err)?;

    let output = serde_json::json!({
        "totalCount": page.total_count,
        "count": page.items.len(),
        "applyResults": page.items,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Delete a terminal apply record.
pub async fn run_delete(pool: &PgPool, apply_id: &str) -> Result<()> {
    let store = StateStore::new(pool.clone());
    store.delete(apply_id).await.map_err(store_err)?;
    println!("apply {apply_id} deleted");
    Ok(())
}
