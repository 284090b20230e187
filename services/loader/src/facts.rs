//! Fact Reconciler: merges one batch of staging rows into the fact table.
//!
//! The staging buffer is a TEMP table scoped to the batch transaction.
//! Staged rows join against the five dimension tables to resolve their
//! composite surrogate-key tuple, then a set-based update pass rewrites
//! existing facts whose measures differ and an insert pass adds facts
//! whose tuple does not exist yet. Rows with no measure difference are
//! left untouched, so re-running a batch is a no-op. Everything happens
//! inside the caller's transaction; a failure anywhere rolls the whole
//! batch back.

use std::collections::BTreeMap;

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::error::{LoadError, Result};
use crate::model::{CleanRow, StagingRow};

/// 10 binds per staged row against SQLite's default 999-parameter limit.
const STAGE_CHUNK: usize = 90;

/// Per-batch merge counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Existing fact rows whose measures were overwritten.
    pub updated: u64,
    /// New fact rows inserted.
    pub inserted: u64,
    /// Staged rows with no matching dimension row, excluded from the
    /// merge. Nonzero means a natural key outside the dimension tables
    /// reached reconciliation.
    pub dropped: u64,
}

const UPDATE_PASS_SQL: &str = "
    UPDATE fact_churn SET
        monthly_charges = src.monthly_charges,
        total_charges = src.total_charges,
        lifetime_value = src.lifetime_value,
        churn_status = src.churn_status,
        load_timestamp = src.load_timestamp
    FROM (
        SELECT c.customer_key AS customer_key,
               ct.contract_key AS contract_key,
               s.service_key AS service_key,
               ts.support_key AS support_key,
               t.tenure_key AS tenure_key,
               stg.monthly_charges AS monthly_charges,
               stg.total_charges AS total_charges,
               stg.lifetime_value AS lifetime_value,
               stg.churn_status AS churn_status,
               stg.load_timestamp AS load_timestamp
        FROM stg_fact_churn stg
        JOIN dim_customer c ON c.customer_id = stg.customer_id
        JOIN dim_contract ct ON ct.contract_type = stg.contract_type
        JOIN dim_service s ON s.internet_service = stg.internet_service
        JOIN dim_tech_support ts ON ts.tech_support = stg.tech_support
        JOIN dim_tenure t ON t.tenure_months = stg.tenure_months
    ) AS src
    WHERE fact_churn.customer_key = src.customer_key
      AND fact_churn.contract_key = src.contract_key
      AND fact_churn.service_key = src.service_key
      AND fact_churn.support_key = src.support_key
      AND fact_churn.tenure_key = src.tenure_key
      AND (fact_churn.monthly_charges <> src.monthly_charges
        OR fact_churn.total_charges <> src.total_charges
        OR fact_churn.lifetime_value <> src.lifetime_value
        OR fact_churn.churn_status <> src.churn_status)";

const INSERT_PASS_SQL: &str = "
    INSERT INTO fact_churn (
        customer_key, contract_key, service_key, support_key, tenure_key,
        monthly_charges, total_charges, lifetime_value, churn_status, load_timestamp
    )
    SELECT c.customer_key,
           ct.contract_key,
           s.service_key,
           ts.support_key,
           t.tenure_key,
           stg.monthly_charges,
           stg.total_charges,
           stg.lifetime_value,
           stg.churn_status,
           stg.load_timestamp
    FROM stg_fact_churn stg
    JOIN dim_customer c ON c.customer_id = stg.customer_id
    JOIN dim_contract ct ON ct.contract_type = stg.contract_type
    JOIN dim_service s ON s.internet_service = stg.internet_service
    JOIN dim_tech_support ts ON ts.tech_support = stg.tech_support
    JOIN dim_tenure t ON t.tenure_months = stg.tenure_months
    LEFT JOIN fact_churn fc
        ON fc.customer_key = c.customer_key
       AND fc.contract_key = ct.contract_key
       AND fc.service_key = s.service_key
       AND fc.support_key = ts.support_key
       AND fc.tenure_key = t.tenure_key
    WHERE fc.fact_key IS NULL";

/// Staged rows whose natural key resolves to no dimension row. They are
/// excluded from both passes; the count is surfaced, not swallowed.
const UNRESOLVED_SQL: &str = "
    SELECT COUNT(*)
    FROM stg_fact_churn stg
    LEFT JOIN dim_customer c ON c.customer_id = stg.customer_id
    LEFT JOIN dim_contract ct ON ct.contract_type = stg.contract_type
    LEFT JOIN dim_service s ON s.internet_service = stg.internet_service
    LEFT JOIN dim_tech_support ts ON ts.tech_support = stg.tech_support
    LEFT JOIN dim_tenure t ON t.tenure_months = stg.tenure_months
    WHERE c.customer_key IS NULL
       OR ct.contract_key IS NULL
       OR s.service_key IS NULL
       OR ts.support_key IS NULL
       OR t.tenure_key IS NULL";

/// A composite tuple appearing on more than one fact row can only come
/// from a dimension-resolution bug; the UNIQUE constraint prevents it
/// going forward, this catches a database written before the constraint.
const DUPLICATE_TUPLE_SQL: &str = "
    SELECT COUNT(*) FROM (
        SELECT 1
        FROM fact_churn
        GROUP BY customer_key, contract_key, service_key, support_key, tenure_key
        HAVING COUNT(*) > 1
    )";

/// Collapse duplicate natural keys within the batch, last-seen wins, so
/// one composite tuple can never be both updated and inserted in the
/// same pass.
fn dedupe_staging(batch: &[CleanRow]) -> Vec<StagingRow> {
    let mut by_key: BTreeMap<(i64, String, String, String, i64), StagingRow> = BTreeMap::new();
    for row in batch {
        let staged = row.to_staging();
        by_key.insert(staged.natural_key(), staged);
    }
    by_key.into_values().collect()
}

/// Build the batch's staging buffer. TEMP keeps it off the warehouse
/// schema; it exists only inside this transaction.
async fn create_staging(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DROP TABLE IF EXISTS temp.stg_fact_churn")
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "CREATE TEMP TABLE stg_fact_churn (
            customer_id INTEGER NOT NULL,
            contract_type TEXT NOT NULL,
            internet_service TEXT NOT NULL,
            tech_support TEXT NOT NULL,
            tenure_months INTEGER NOT NULL,
            monthly_charges REAL NOT NULL,
            total_charges REAL NOT NULL,
            lifetime_value REAL NOT NULL,
            churn_status INTEGER NOT NULL,
            load_timestamp TEXT NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn stage_rows(conn: &mut SqliteConnection, rows: &[StagingRow]) -> Result<()> {
    for chunk in rows.chunks(STAGE_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO stg_fact_churn (
                customer_id, contract_type, internet_service, tech_support, tenure_months,
                monthly_charges, total_charges, lifetime_value, churn_status, load_timestamp) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(r.customer_id)
                .push_bind(&r.contract_type)
                .push_bind(&r.internet_service)
                .push_bind(&r.tech_support)
                .push_bind(r.tenure_months)
                .push_bind(r.monthly_charges)
                .push_bind(r.total_charges)
                .push_bind(r.lifetime_value)
                .push_bind(r.churn_status)
                .push_bind(&r.load_timestamp);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn drop_staging(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DROP TABLE temp.stg_fact_churn")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn unresolved_count(conn: &mut SqliteConnection) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as(UNRESOLVED_SQL).fetch_one(&mut *conn).await?;
    Ok(count as u64)
}

async fn check_composite_integrity(conn: &mut SqliteConnection) -> Result<()> {
    let (dupes,): (i64,) = sqlx::query_as(DUPLICATE_TUPLE_SQL)
        .fetch_one(&mut *conn)
        .await?;
    if dupes > 0 {
        return Err(LoadError::Integrity(format!(
            "{dupes} composite surrogate-key tuples appear on more than one fact row"
        )));
    }
    Ok(())
}

/// Overwrite measures and load timestamp on existing fact rows whose
/// staged counterpart differs in at least one measure. Identical rows
/// are untouched, so their timestamps do not move.
async fn run_update_pass(conn: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query(UPDATE_PASS_SQL).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

/// Insert staged rows whose composite tuple has no existing fact row.
async fn run_insert_pass(conn: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query(INSERT_PASS_SQL).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

/// Merge one batch into the fact table inside the caller's transaction.
/// Dimension loading must already have run for this batch.
pub async fn reconcile(conn: &mut SqliteConnection, batch: &[CleanRow]) -> Result<ReconcileOutcome> {
    check_composite_integrity(conn).await?;

    let staged = dedupe_staging(batch);
    create_staging(conn).await?;
    stage_rows(conn, &staged).await?;

    let dropped = unresolved_count(conn).await?;
    let updated = run_update_pass(conn).await?;
    let inserted = run_insert_pass(conn).await?;

    drop_staging(conn).await?;
    Ok(ReconcileOutcome { updated, inserted, dropped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FactRow;
    use crate::store::{open_in_memory, Warehouse};

    fn clean(customer_id: i64, monthly: f64, churn: bool) -> CleanRow {
        CleanRow {
            customer_id,
            age: 34,
            gender: "F".to_string(),
            tenure_months: 5,
            monthly_charges: monthly,
            contract_type: "Month-to-Month".to_string(),
            internet_service: "DSL".to_string(),
            total_charges: 350.0,
            tech_support: "No".to_string(),
            churn_status: churn,
            lifetime_value: monthly * 5.0,
            load_timestamp: "2026-01-01 00:00:00".to_string(),
        }
    }

    async fn fact_rows(wh: &Warehouse) -> Vec<FactRow> {
        sqlx::query_as("SELECT * FROM fact_churn ORDER BY fact_key")
            .fetch_all(wh.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_load_inserts_then_identical_batch_is_noop() {
        let wh = open_in_memory().await;
        let batch = vec![clean(1, 70.0, false)];

        wh.load_dimensions(&batch).await.unwrap();
        let first = wh.reconcile_facts(&batch).await.unwrap();
        assert_eq!(first, ReconcileOutcome { updated: 0, inserted: 1, dropped: 0 });
        assert_eq!(fact_rows(&wh).await.len(), 1);

        let second = wh.reconcile_facts(&batch).await.unwrap();
        assert_eq!(second, ReconcileOutcome { updated: 0, inserted: 0, dropped: 0 });
        assert_eq!(fact_rows(&wh).await.len(), 1);
        wh.close().await;
    }

    #[tokio::test]
    async fn changed_measure_updates_in_place() {
        let wh = open_in_memory().await;
        let batch = vec![clean(1, 70.0, false)];
        wh.load_dimensions(&batch).await.unwrap();
        wh.reconcile_facts(&batch).await.unwrap();

        let mut changed = vec![clean(1, 75.0, false)];
        changed[0].load_timestamp = "2026-01-02 00:00:00".to_string();
        wh.load_dimensions(&changed).await.unwrap();
        let outcome = wh.reconcile_facts(&changed).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome { updated: 1, inserted: 0, dropped: 0 });

        let rows = fact_rows(&wh).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].monthly_charges, 75.0);
        assert_eq!(rows[0].lifetime_value, 375.0);
        assert_eq!(rows[0].load_timestamp, "2026-01-02 00:00:00");
        wh.close().await;
    }

    #[tokio::test]
    async fn unchanged_rows_keep_their_load_timestamp() {
        let wh = open_in_memory().await;
        let batch = vec![clean(1, 70.0, false)];
        wh.load_dimensions(&batch).await.unwrap();
        wh.reconcile_facts(&batch).await.unwrap();

        // Same measures, later batch timestamp: must not touch the row.
        let mut resent = vec![clean(1, 70.0, false)];
        resent[0].load_timestamp = "2026-02-01 00:00:00".to_string();
        let outcome = wh.reconcile_facts(&resent).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome { updated: 0, inserted: 0, dropped: 0 });
        assert_eq!(fact_rows(&wh).await[0].load_timestamp, "2026-01-01 00:00:00");
        wh.close().await;
    }

    #[tokio::test]
    async fn churn_flag_change_counts_as_changed() {
        let wh = open_in_memory().await;
        let batch = vec![clean(1, 70.0, false)];
        wh.load_dimensions(&batch).await.unwrap();
        wh.reconcile_facts(&batch).await.unwrap();

        let flipped = vec![clean(1, 70.0, true)];
        let outcome = wh.reconcile_facts(&flipped).await.unwrap();
        assert_eq!(outcome.updated, 1);
        assert!(fact_rows(&wh).await[0].churn_status);
        wh.close().await;
    }

    #[tokio::test]
    async fn mixed_batch_classifies_each_row() {
        let wh = open_in_memory().await;
        let initial = vec![clean(1, 70.0, false), clean(2, 50.0, false)];
        wh.load_dimensions(&initial).await.unwrap();
        wh.reconcile_facts(&initial).await.unwrap();

        // Row 1 changed, row 2 unchanged, row 3 new.
        let next = vec![clean(1, 80.0, false), clean(2, 50.0, false), clean(3, 60.0, true)];
        wh.load_dimensions(&next).await.unwrap();
        let outcome = wh.reconcile_facts(&next).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome { updated: 1, inserted: 1, dropped: 0 });
        assert_eq!(fact_rows(&wh).await.len(), 3);
        wh.close().await;
    }

    #[tokio::test]
    async fn duplicate_natural_keys_in_batch_collapse_to_one_row() {
        let wh = open_in_memory().await;
        // Same natural key twice with different measures: last-seen wins.
        let batch = vec![clean(1, 70.0, false), clean(1, 90.0, false)];
        wh.load_dimensions(&[clean(1, 70.0, false)]).await.unwrap();
        let outcome = wh.reconcile_facts(&batch).await.unwrap();
        assert_eq!(outcome.inserted, 1);

        let rows = fact_rows(&wh).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].monthly_charges, 90.0);
        wh.close().await;
    }

    #[tokio::test]
    async fn unresolvable_natural_key_is_dropped_and_counted() {
        let wh = open_in_memory().await;
        let mut stray = clean(2, 40.0, false);
        // Not in the closed contract enumeration, so no dimension row.
        stray.contract_type = "Lifetime".to_string();
        let batch = vec![clean(1, 70.0, false), stray];

        wh.load_dimensions(&batch).await.unwrap();
        let outcome = wh.reconcile_facts(&batch).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome { updated: 0, inserted: 1, dropped: 1 });
        assert_eq!(fact_rows(&wh).await.len(), 1);
        wh.close().await;
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let wh = open_in_memory().await;
        wh.load_dimensions(&[]).await.unwrap();
        let outcome = wh.reconcile_facts(&[]).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome { updated: 0, inserted: 0, dropped: 0 });
        wh.close().await;
    }

    #[tokio::test]
    async fn failed_insert_pass_rolls_back_update_pass() {
        let wh = open_in_memory().await;
        let batch = vec![clean(1, 70.0, false)];
        wh.load_dimensions(&batch).await.unwrap();
        wh.reconcile_facts(&batch).await.unwrap();
        let before = fact_rows(&wh).await;

        // Drive the passes by hand so a failure can be injected between
        // them: the update pass lands, then an insert that violates the
        // composite-key constraint fails the batch.
        let changed = vec![clean(1, 75.0, false), clean(2, 60.0, false)];
        let mut tx = wh.pool().begin().await.unwrap();
        create_staging(&mut tx).await.unwrap();
        stage_rows(&mut tx, &dedupe_staging(&changed)).await.unwrap();
        assert_eq!(run_update_pass(&mut tx).await.unwrap(), 1);

        let err: LoadError = sqlx::query(
            "INSERT INTO fact_churn
                (customer_key, contract_key, service_key, support_key, tenure_key,
                 monthly_charges, total_charges, lifetime_value, churn_status, load_timestamp)
             SELECT customer_key, contract_key, service_key, support_key, tenure_key,
                    monthly_charges, total_charges, lifetime_value, churn_status, load_timestamp
             FROM fact_churn",
        )
        .execute(&mut *tx)
        .await
        .unwrap_err()
        .into();
        assert!(matches!(err, LoadError::Integrity(_)));
        tx.rollback().await.unwrap();

        // Neither pass is visible after rollback.
        assert_eq!(fact_rows(&wh).await, before);
        assert_eq!(before[0].monthly_charges, 70.0);
        wh.close().await;
    }

    #[tokio::test]
    async fn preexisting_duplicate_tuples_surface_as_integrity_error() {
        let wh = open_in_memory().await;
        let batch = vec![clean(1, 70.0, false)];
        wh.load_dimensions(&batch).await.unwrap();
        wh.reconcile_facts(&batch).await.unwrap();

        // Simulate a database written before the composite constraint:
        // rebuild the fact table without it (CREATE TABLE .. AS SELECT
        // carries no constraints), then force a duplicate tuple in.
        sqlx::query("ALTER TABLE fact_churn RENAME TO fact_churn_guarded")
            .execute(wh.pool())
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE fact_churn AS SELECT * FROM fact_churn_guarded",
        )
        .execute(wh.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO fact_churn SELECT fact_key + 1, customer_key, contract_key,
                service_key, support_key, tenure_key, monthly_charges, total_charges,
                lifetime_value, churn_status, load_timestamp FROM fact_churn",
        )
        .execute(wh.pool())
        .await
        .unwrap();

        let err = wh.reconcile_facts(&batch).await.unwrap_err();
        assert!(matches!(err, LoadError::Integrity(_)));
        wh.close().await;
    }
}
