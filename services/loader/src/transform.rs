//! Cleaning rules: raw CSV rows -> fully-typed clean rows.
//!
//! Deterministic given the batch: defaults for the charge columns come
//! from the batch median, everything else is a fixed default.

use std::sync::LazyLock;

use chrono::{FixedOffset, Utc};

use crate::error::{LoadError, Result};
use crate::model::{CleanRow, RawRow};

const DEFAULT_GENDER: &str = "Unknown";
const DEFAULT_CONTRACT: &str = "Unknown";
const DEFAULT_SERVICE: &str = "Unknown";
const DEFAULT_SUPPORT: &str = "Unknown";

/// IST (+05:30). Load timestamps are wall-clock local to this one fixed
/// time zone.
static IST: LazyLock<FixedOffset> =
    LazyLock::new(|| FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("in-range fixed offset"));

/// Current wall-clock time in IST, formatted the way the warehouse
/// stores load timestamps.
pub fn ist_timestamp() -> String {
    Utc::now().with_timezone(&*IST).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Median of the values that are present. Missing charge fields default
/// to this, so a batch with no observed values at all falls back to 0.
fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Churn arrives as "Yes"/"No" text (sometimes "True"/"False" or 0/1).
/// Missing defaults to "No"; anything unrecognized reads as not churned.
fn parse_churn(raw: Option<&str>) -> bool {
    match raw.map(|s| s.trim().to_lowercase()) {
        Some(v) => matches!(v.as_str(), "yes" | "true" | "1"),
        None => false,
    }
}

fn normalize(raw: Option<String>, default: &str) -> String {
    match raw {
        Some(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => default.to_string(),
    }
}

/// Transform a raw batch into clean rows.
///
/// A missing customer id is the one thing with no sensible default: the
/// whole batch is rejected so nothing downstream sees a half-keyed row.
pub fn transform_batch(raw: Vec<RawRow>, load_timestamp: &str) -> Result<Vec<CleanRow>> {
    let monthly_present: Vec<f64> = raw.iter().filter_map(|r| r.monthly_charges).collect();
    let total_present: Vec<f64> = raw.iter().filter_map(|r| r.total_charges).collect();
    let monthly_default = median(&monthly_present);
    let total_default = median(&total_present);

    let mut clean = Vec::with_capacity(raw.len());
    for (idx, row) in raw.into_iter().enumerate() {
        let customer_id = row.customer_id.ok_or_else(|| {
            LoadError::DataShape(format!("row {}: missing customer_id", idx + 1))
        })?;

        let age = row.age.unwrap_or(0);
        let tenure_months = row.tenure.unwrap_or(0);
        let monthly_charges = row.monthly_charges.unwrap_or(monthly_default);
        let total_charges = row.total_charges.unwrap_or(total_default);
        let gender = normalize(row.gender, DEFAULT_GENDER).to_uppercase();
        let contract_type = normalize(row.contract_type, DEFAULT_CONTRACT);
        let internet_service = normalize(row.internet_service, DEFAULT_SERVICE);
        let tech_support = normalize(row.tech_support, DEFAULT_SUPPORT);
        let churn_status = parse_churn(row.churn.as_deref());

        clean.push(CleanRow {
            customer_id,
            age,
            gender,
            tenure_months,
            monthly_charges,
            contract_type,
            internet_service,
            total_charges,
            tech_support,
            churn_status,
            lifetime_value: monthly_charges * tenure_months as f64,
            load_timestamp: load_timestamp.to_string(),
        });
    }

    Ok(clean)
}
