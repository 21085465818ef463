use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use orderline_loader::load_from_path;
use orderline_store_sqlite::SqliteStore;
use serde_json::{json, Value};
use time::format_description::FormatItem;
use time::{OffsetDateTime, PrimitiveDateTime};

const REPORT_TIME_FORMAT: &str = "[year]-[month]-[day] [hour]:[minute]:[second]";

#[derive(Debug, Parser)]
#[command(name = "orderline")]
#[command(about = "NDJSON order loader and reporting over SQLite")]
struct Cli {
    /// SQLite database path or sqlite:// URL.
    #[arg(long)]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load an NDJSON order file into the database.
    Load(LoadArgs),
    /// Read-only reports over loaded data.
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
}

#[derive(Debug, Args)]
struct LoadArgs {
    #[arg(long)]
    data_file_path: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    OrdersInRange(OrdersInRangeArgs),
    TopUsers(TopUsersArgs),
}

#[derive(Debug, Args)]
struct OrdersInRangeArgs {
    /// Inclusive range start, `YYYY-MM-DD HH:MM:SS` (UTC).
    #[arg(long)]
    start: String,
    /// Inclusive range end, `YYYY-MM-DD HH:MM:SS` (UTC).
    #[arg(long)]
    end: String,
}

#[derive(Debug, Args)]
struct TopUsersArgs {
    #[arg(long, default_value_t = 5)]
    limit: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut store = SqliteStore::open(&cli.database_url)?;
    store.migrate()?;

    match cli.command {
        Command::Load(args) => run_load(&args, &mut store),
        Command::Report { command } => match command {
            ReportCommand::OrdersInRange(args) => run_orders_in_range(&args, &store),
            ReportCommand::TopUsers(args) => run_top_users(&args, &store),
        },
    }
}

fn run_load(args: &LoadArgs, store: &mut SqliteStore) -> Result<()> {
    let report = load_from_path(store, &args.data_file_path)?;

    for diagnostic in &report.diagnostics {
        eprintln!("{diagnostic}");
    }

    emit_json(&json!({
        "lines_processed": report.lines_processed,
        "users_upserted": report.users_upserted,
        "products_upserted": report.products_upserted,
        "orders_upserted": report.orders_upserted,
        "associations_inserted": report.associations_inserted,
        "diagnostics": report.diagnostics.len(),
    }))?;

    // The summary above still reports the lines processed before the bad
    // line; the failure itself surfaces through the exit status.
    if let Some(fatal) = report.fatal {
        return Err(anyhow!(fatal));
    }
    Ok(())
}

fn run_orders_in_range(args: &OrdersInRangeArgs, store: &SqliteStore) -> Result<()> {
    let format = report_time_format()?;
    let start = parse_report_timestamp(&args.start, &format)?;
    let end = parse_report_timestamp(&args.end, &format)?;

    let mut rows = Vec::new();
    for summary in store.orders_in_range(start, end)? {
        let created = summary
            .created
            .format(&format)
            .context("failed to format created timestamp")?;
        rows.push(json!({
            "id": summary.id,
            "user_id": summary.user_id,
            "product_ids": summary.product_ids,
            "created": created,
        }));
    }

    emit_json(&Value::Array(rows))
}

fn run_top_users(args: &TopUsersArgs, store: &SqliteStore) -> Result<()> {
    let top = store.top_users_by_purchase_count(args.limit)?;
    emit_json(&serde_json::to_value(top).context("failed to serialize top users")?)
}

fn emit_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_time_format() -> Result<Vec<FormatItem<'static>>> {
    time::format_description::parse(REPORT_TIME_FORMAT)
        .context("invalid report time format description")
}

fn parse_report_timestamp(value: &str, format: &[FormatItem<'_>]) -> Result<OffsetDateTime> {
    let parsed = PrimitiveDateTime::parse(value, format)
        .with_context(|| format!("invalid timestamp (expected YYYY-MM-DD HH:MM:SS): {value}"))?;
    Ok(parsed.assume_utc())
}
