//! Dimension Resolver: upserts dimension rows for one batch.
//!
//! Surrogate keys are stable: an upsert on an existing natural key
//! rewrites descriptive attributes only. The contract, service, and
//! tech-support dimensions are closed enumerations seeded from static
//! reference lists regardless of what the batch contains; the tenure
//! dimension gets its key arithmetically and is backfilled densely from
//! month 0 up to the batch maximum.

use std::collections::BTreeMap;

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::error::{LoadError, Result};
use crate::model::CleanRow;

/// Bind-count headroom: SQLite's default parameter limit is 999 and the
/// widest statement here binds 4 values per row.
const UPSERT_CHUNK: usize = 100;

/// Static reference list for dim_contract.
const CONTRACT_TYPES: &[(&str, i64, bool)] = &[
    ("Month-to-Month", 1, true),
    ("One-Year", 12, false),
    ("Two-Year", 24, false),
];

/// Static reference list for dim_service.
const SERVICE_TYPES: &[(&str, &str, bool)] = &[
    ("Fiber Optic", "Premium", true),
    ("DSL", "Standard", true),
    ("Unknown", "None", false),
];

/// Static reference list for dim_tech_support.
const SUPPORT_TYPES: &[(&str, bool)] = &[("Yes", true), ("No", false), ("Unknown", false)];

/// Age bucket for dim_customer. Outside 1..=100 there is no bucket.
fn age_group(age: i64) -> Option<&'static str> {
    match age {
        1..=18 => Some("<18"),
        19..=30 => Some("18-30"),
        31..=45 => Some("31-45"),
        46..=60 => Some("46-60"),
        61..=100 => Some("60+"),
        _ => None,
    }
}

/// Tenure bucket for dim_tenure.
fn tenure_category(months: i64) -> &'static str {
    match months {
        i64::MIN..=0 => "New",
        1..=6 => "0-6m",
        7..=12 => "6-12m",
        13..=24 => "1-2y",
        25..=60 => "2-5y",
        _ => "5y+",
    }
}

#[derive(Debug, PartialEq)]
struct CustomerUpsert {
    customer_id: i64,
    age: i64,
    gender: String,
}

/// Collapse duplicate customer ids to one row. Identical duplicates are
/// fine; the same id carrying two different attribute sets would make
/// the upsert result depend on row order, so it is rejected.
fn dedupe_customers(batch: &[CleanRow]) -> Result<Vec<CustomerUpsert>> {
    let mut seen: BTreeMap<i64, CustomerUpsert> = BTreeMap::new();
    for row in batch {
        let candidate = CustomerUpsert {
            customer_id: row.customer_id,
            age: row.age,
            gender: row.gender.clone(),
        };
        match seen.get(&row.customer_id) {
            Some(existing) if *existing != candidate => {
                return Err(LoadError::Integrity(format!(
                    "customer {} appears twice with conflicting attributes",
                    row.customer_id
                )));
            }
            _ => {
                seen.insert(row.customer_id, candidate);
            }
        }
    }
    Ok(seen.into_values().collect())
}

async fn upsert_customers(conn: &mut SqliteConnection, customers: &[CustomerUpsert]) -> Result<()> {
    for chunk in customers.chunks(UPSERT_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO dim_customer (customer_id, age, gender, age_group) ");
        qb.push_values(chunk, |mut b, c| {
            b.push_bind(c.customer_id)
                .push_bind(c.age)
                .push_bind(&c.gender)
                .push_bind(age_group(c.age));
        });
        qb.push(
            " ON CONFLICT(customer_id) DO UPDATE SET
                age = excluded.age,
                gender = excluded.gender,
                age_group = excluded.age_group",
        );
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn seed_contracts(conn: &mut SqliteConnection) -> Result<()> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "INSERT INTO dim_contract (contract_type, duration_months, is_month_to_month) ",
    );
    qb.push_values(CONTRACT_TYPES, |mut b, (kind, months, m2m)| {
        b.push_bind(*kind).push_bind(*months).push_bind(*m2m);
    });
    qb.push(
        " ON CONFLICT(contract_type) DO UPDATE SET
            duration_months = excluded.duration_months,
            is_month_to_month = excluded.is_month_to_month",
    );
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

async fn seed_services(conn: &mut SqliteConnection) -> Result<()> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "INSERT INTO dim_service (internet_service, service_category, has_service) ",
    );
    qb.push_values(SERVICE_TYPES, |mut b, (kind, category, has)| {
        b.push_bind(*kind).push_bind(*category).push_bind(*has);
    });
    qb.push(
        " ON CONFLICT(internet_service) DO UPDATE SET
            service_category = excluded.service_category,
            has_service = excluded.has_service",
    );
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

async fn seed_tech_support(conn: &mut SqliteConnection) -> Result<()> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT INTO dim_tech_support (tech_support, has_support) ");
    qb.push_values(SUPPORT_TYPES, |mut b, (kind, has)| {
        b.push_bind(*kind).push_bind(*has);
    });
    qb.push(" ON CONFLICT(tech_support) DO UPDATE SET has_support = excluded.has_support");
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

/// Densely populate dim_tenure for months 0..=max. The surrogate key is
/// derived from the natural key (month + 1) rather than assigned, so a
/// month's key is the same no matter which batch first observed it.
async fn backfill_tenure(conn: &mut SqliteConnection, max_months: i64) -> Result<()> {
    let months: Vec<i64> = (0..=max_months).collect();
    for chunk in months.chunks(UPSERT_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO dim_tenure (tenure_key, tenure_months, tenure_years, tenure_category) ",
        );
        qb.push_values(chunk, |mut b, m| {
            b.push_bind(m + 1)
                .push_bind(*m)
                .push_bind(m / 12)
                .push_bind(tenure_category(*m));
        });
        qb.push(
            " ON CONFLICT(tenure_months) DO UPDATE SET
                tenure_years = excluded.tenure_years,
                tenure_category = excluded.tenure_category",
        );
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Upsert every dimension implicated by the batch, inside the caller's
/// transaction. The closed enumerations are re-seeded on every load.
pub async fn load_all(conn: &mut SqliteConnection, batch: &[CleanRow]) -> Result<()> {
    seed_contracts(conn).await?;
    seed_services(conn).await?;
    seed_tech_support(conn).await?;

    let customers = dedupe_customers(batch)?;
    if !customers.is_empty() {
        upsert_customers(conn, &customers).await?;
    }
    if let Some(max_months) = batch.iter().map(|r| r.tenure_months).max() {
        backfill_tenure(conn, max_months.max(0)).await?;
    }
    Ok(())
}
