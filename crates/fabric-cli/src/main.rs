mod apply_cmd;
mod config;
mod control_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use fabric_db::pool;

use config::FabricConfig;

#[derive(Parser)]
#[command(name = "fabric", about = "Executor for composable-hardware layout-change plans")]
struct Cli {
    /// Database URL (overrides FABRIC_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fabric config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/fabric")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the fabric database (requires config file or env vars)
    DbInit,
    /// Execute a layout-change plan from a JSON file
    Apply {
        /// Path to the plan JSON file
        plan: PathBuf,
    },
    /// Request cancellation of a running apply
    Cancel {
        /// Apply ID to cancel
        apply_id: String,
        /// Execute the derived rollback plan after cancellation
        #[arg(long)]
        rollback: bool,
    },
    /// Resume a suspended apply (or its suspended rollback)
    Resume {
        /// Apply ID to resume
        apply_id: String,
    },
    /// Show one apply record
    Get {
        /// Apply ID to fetch
        apply_id: String,
        /// Restrict the output to these fields (repeatable)
        #[arg(long)]
        field: Vec<String>,
        /// Write the result to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List apply records
    List {
        /// Filter by status (e.g. COMPLETED)
        #[arg(long)]
        status: Option<String>,
        /// Only applies started at or after this ISO-8601 UTC timestamp
        #[arg(long)]
        started_since: Option<String>,
        /// Only applies started at or before this timestamp
        #[arg(long)]
        started_until: Option<String>,
        /// Only applies ended at or after this timestamp
        #[arg(long)]
        ended_since: Option<String>,
        /// Only applies ended at or before this timestamp
        #[arg(long)]
        ended_until: Option<String>,
        /// Sort column: startedAt or endedAt
        #[arg(long)]
        sort_by: Option<String>,
        /// Sort order: asc or desc
        #[arg(long)]
        order_by: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Delete a terminal apply record
    Delete {
        /// Apply ID to delete
        apply_id: String,
    },
}

/// Execute the `fabric init` command: write the config template.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    config::save_config(&config::default_config(db_url))?;
    println!("config written to {}", path.display());
    Ok(())
}

/// Execute the `fabric db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = FabricConfig::resolve(cli_db_url)?;

    println!("Initializing fabric database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("fabric db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A failed subscriber install must not kill the apply; events then go
    // to whatever sink was installed first.
    if tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .is_err()
    {
        eprintln!("warning: logging was already initialized, continuing");
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Apply { plan } => {
            let resolved = FabricConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = apply_cmd::run_apply(&db_pool, resolved.executor, &plan).await;
            db_pool.close().await;
            result?;
        }
        Commands::Cancel { apply_id, rollback } => {
            let resolved = FabricConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = control_cmd::run_cancel(&db_pool, &apply_id, rollback).await;
            db_pool.close().await;
            result?;
        }
        Commands::Resume { apply_id } => {
            let resolved = FabricConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = control_cmd::run_resume(&db_pool, resolved.executor, &apply_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Get {
            apply_id,
            field,
            output,
        } => {
            let resolved = FabricConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result =
                status_cmd::run_get(&db_pool, &apply_id, &field, output.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::List {
            status,
            started_since,
            started_until,
            ended_since,
            ended_until,
            sort_by,
            order_by,
            limit,
            offset,
        } => {
            let resolved = FabricConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let args = status_cmd::ListArgs {
                status,
                started_since,
                started_until,
                ended_since,
                ended_until,
                sort_by,
                order_by,
                limit,
                offset,
            };
            let result = status_cmd::run_list(&db_pool, args).await;
            db_pool.close().await;
            result?;
        }
        Commands::Delete { apply_id } => {
            let resolved = FabricConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_delete(&db_pool, &apply_id).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
