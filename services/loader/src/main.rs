//! Loader Service - Incrementally loads customer-churn batches into the
//! star-schema warehouse
//!
//! Responsibilities:
//! - Read a flat churn CSV batch
//! - Clean and transform it (defaults, normalization, derived measures)
//! - Upsert dimension rows (surrogate keys stay stable)
//! - Merge the batch into the fact table: update changed rows, insert
//!   new ones, leave identical ones alone, all in one transaction
//!
//! Usage:
//!   cargo run --bin loader -- --input data/customer_churn_data.csv
//!   cargo run --bin loader -- --input batch.csv --db-url sqlite://churn.db
//!   cargo run --bin loader -- --input batch.csv --dry-run

mod dims;
mod error;
mod facts;
mod model;
mod store;
mod transform;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::fs;

use model::RawRow;
use store::Warehouse;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads churn batches into the warehouse incrementally")]
struct Args {
    /// Path to the source CSV batch
    #[arg(long)]
    input: String,

    /// Database URL (falls back to the DB_URL env var, then a local file)
    #[arg(long)]
    db_url: Option<String>,

    /// Transform only - don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Upper bound on one batch transaction, in seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,
}

/// Parse the raw CSV content. Malformed lines are skipped with a warning,
/// matching how upstream exports tend to carry the odd broken row; rows
/// that parse but are missing required fields are caught by the
/// transform instead.
fn parse_batch(content: &str) -> Vec<RawRow> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for (line_num, result) in reader.deserialize().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => {
                eprintln!("Warning: skipping line {} due to error: {}", line_num + 2, e);
            }
        }
    }
    rows
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let db_url = match args.db_url {
        Some(url) => url,
        None => std::env::var("DB_URL")
            .unwrap_or_else(|_| "sqlite://customer_churn.db".to_string()),
    };

    println!("=== Churn Warehouse Loader ===");
    println!("Input: {}", args.input);
    println!("Database: {}", db_url);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let content = fs::read_to_string(&args.input)
        .await
        .context("Failed to read input CSV")?;
    let raw = parse_batch(&content);
    println!("Read {} rows", raw.len());

    let stamped_at = transform::ist_timestamp();
    let batch = transform::transform_batch(raw, &stamped_at)?;
    println!("Transformed {} rows (load timestamp {})", batch.len(), stamped_at);

    if args.dry_run {
        for (i, row) in batch.iter().take(3).enumerate() {
            println!(
                "  [{}] customer={} tenure={}m monthly={} ltv={} churn={}",
                i + 1,
                row.customer_id,
                row.tenure_months,
                row.monthly_charges,
                row.lifetime_value,
                row.churn_status
            );
        }
        if batch.len() > 3 {
            println!("  ... and {} more", batch.len() - 3);
        }
        println!("\nDry run - nothing written");
        return Ok(());
    }

    let warehouse = Warehouse::open(&db_url, Duration::from_secs(args.timeout_secs))
        .await
        .context("Failed to open warehouse database")?;
    warehouse.ensure_schema().await.context("Failed to create warehouse schema")?;

    warehouse
        .load_dimensions(&batch)
        .await
        .context("Dimension load failed")?;
    println!("Dimensions loaded");

    let outcome = warehouse
        .reconcile_facts(&batch)
        .await
        .context("Fact reconciliation failed")?;

    println!("\n=== Incremental Load Complete ===");
    println!("Updated:  {}", outcome.updated);
    println!("Inserted: {}", outcome.inserted);
    if outcome.dropped > 0 {
        eprintln!(
            "Warning: {} staged rows had no matching dimension row and were dropped",
            outcome.dropped
        );
    }

    for fact in warehouse.recent_facts(3).await? {
        println!(
            "  [fact {}] customer_key={} monthly={} ltv={} churn={} loaded={}",
            fact.fact_key,
            fact.customer_key,
            fact.monthly_charges,
            fact.lifetime_value,
            fact.churn_status,
            fact.load_timestamp
        );
    }

    warehouse.close().await;
    Ok(())
}
