//! Warehouse store handle: connection lifecycle, schema, and the two
//! public batch operations.
//!
//! One `Warehouse` per database file. Batches serialize behind an
//! internal gate: the reconciler classifies rows by reading the fact
//! table and then writing it, so two overlapping batches would race each
//! other into lost updates. Every batch runs as one transaction bounded
//! by a timeout; elapsing rolls back like any other mid-batch failure.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::dims;
use crate::error::{LoadError, Result};
use crate::facts::{self, ReconcileOutcome};
use crate::model::{CleanRow, FactRow};

pub struct Warehouse {
    pool: SqlitePool,
    gate: Mutex<()>,
    batch_timeout: Duration,
}

impl Warehouse {
    /// Open (creating if missing) the warehouse database.
    pub async fn open(url: &str, batch_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Single-writer model: one connection, no concurrent batches.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Warehouse { pool, gate: Mutex::new(()), batch_timeout })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Create dimension and fact tables if they do not exist.
    ///
    /// The fact table's UNIQUE constraint over the five dimension keys is
    /// what makes a duplicate composite tuple an error instead of a
    /// silent second row.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS dim_customer (
                customer_key INTEGER PRIMARY KEY AUTOINCREMENT,
                customer_id INTEGER NOT NULL UNIQUE,
                age INTEGER NOT NULL,
                age_group TEXT,
                gender TEXT NOT NULL,
                valid_from TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                valid_to TEXT NOT NULL DEFAULT '9999-12-31',
                is_current INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS dim_contract (
                contract_key INTEGER PRIMARY KEY AUTOINCREMENT,
                contract_type TEXT NOT NULL UNIQUE,
                duration_months INTEGER NOT NULL,
                is_month_to_month INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS dim_service (
                service_key INTEGER PRIMARY KEY AUTOINCREMENT,
                internet_service TEXT NOT NULL UNIQUE,
                service_category TEXT NOT NULL,
                has_service INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS dim_tech_support (
                support_key INTEGER PRIMARY KEY AUTOINCREMENT,
                tech_support TEXT NOT NULL UNIQUE,
                has_support INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS dim_tenure (
                tenure_key INTEGER PRIMARY KEY,
                tenure_months INTEGER NOT NULL UNIQUE,
                tenure_years INTEGER NOT NULL,
                tenure_category TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS fact_churn (
                fact_key INTEGER PRIMARY KEY AUTOINCREMENT,
                customer_key INTEGER NOT NULL REFERENCES dim_customer(customer_key),
                contract_key INTEGER NOT NULL REFERENCES dim_contract(contract_key),
                service_key INTEGER NOT NULL REFERENCES dim_service(service_key),
                support_key INTEGER NOT NULL REFERENCES dim_tech_support(support_key),
                tenure_key INTEGER NOT NULL REFERENCES dim_tenure(tenure_key),
                monthly_charges REAL NOT NULL,
                total_charges REAL NOT NULL,
                lifetime_value REAL NOT NULL,
                churn_status INTEGER NOT NULL,
                load_timestamp TEXT NOT NULL,
                UNIQUE (customer_key, contract_key, service_key, support_key, tenure_key)
            )",
        ];
        for ddl in statements {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Upsert dimension rows for one batch. Must run before
    /// `reconcile_facts` for the same batch; any failure here aborts the
    /// load before the fact table is touched.
    pub async fn load_dimensions(&self, batch: &[CleanRow]) -> Result<()> {
        let _guard = self.gate.lock().await;
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            dims::load_all(&mut tx, batch).await?;
            tx.commit().await.map_err(LoadError::Transaction)?;
            Ok(())
        })
        .await
    }

    /// Merge one batch into the fact table. Returns counts of rows
    /// updated, inserted, and dropped for lack of a dimension match.
    pub async fn reconcile_facts(&self, batch: &[CleanRow]) -> Result<ReconcileOutcome> {
        let _guard = self.gate.lock().await;
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            let outcome = facts::reconcile(&mut tx, batch).await?;
            tx.commit().await.map_err(LoadError::Transaction)?;
            Ok(outcome)
        })
        .await
    }

    /// Most recently assigned fact rows, for the post-load summary.
    pub async fn recent_facts(&self, limit: i64) -> Result<Vec<FactRow>> {
        let rows = sqlx::query_as(
            "SELECT fact_key, customer_key, contract_key, service_key, support_key, tenure_key,
                    monthly_charges, total_charges, lifetime_value, churn_status, load_timestamp
             FROM fact_churn ORDER BY fact_key DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn bounded<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.batch_timeout, work).await {
            Ok(result) => result,
            // Dropping the in-flight transaction rolls the batch back.
            Err(_) => Err(LoadError::Timeout { seconds: self.batch_timeout.as_secs() }),
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) async fn open_in_memory() -> Warehouse {
    let wh = Warehouse::open("sqlite::memory:", Duration::from_secs(30))
        .await
        .expect("open in-memory warehouse");
    wh.ensure_schema().await.expect("create schema");
    wh
}
