//! Record types for each stage of the pipeline.
//!
//! The source data is a loosely-typed CSV; every stage boundary gets its
//! own explicit shape instead of passing string-keyed rows around:
//! raw (CSV-shaped) -> clean (transformed) -> staging (fact candidate)
//! -> fact (persisted).

use serde::Deserialize;

/// One row as it appears in the source CSV. Everything except the line
/// itself may be missing; defaults are applied during transformation.
#[derive(Debug, Deserialize)]
pub struct RawRow {
    #[serde(alias = "CustomerID", alias = "customer_id")]
    pub customer_id: Option<i64>,
    #[serde(alias = "Age", alias = "age")]
    pub age: Option<i64>,
    #[serde(alias = "Gender", alias = "gender")]
    pub gender: Option<String>,
    #[serde(alias = "Tenure", alias = "tenure_months")]
    pub tenure: Option<i64>,
    #[serde(alias = "MonthlyCharges", alias = "monthly_charges")]
    pub monthly_charges: Option<f64>,
    #[serde(alias = "ContractType", alias = "contract_type")]
    pub contract_type: Option<String>,
    #[serde(alias = "InternetService", alias = "internet_service")]
    pub internet_service: Option<String>,
    #[serde(alias = "TotalCharges", alias = "total_charges")]
    pub total_charges: Option<f64>,
    #[serde(alias = "TechSupport", alias = "tech_support")]
    pub tech_support: Option<String>,
    #[serde(alias = "Churn", alias = "churn_status")]
    pub churn: Option<String>,
}

/// A fully-typed row after cleaning: defaults filled, strings normalized,
/// derived measures computed, batch load timestamp stamped on.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanRow {
    pub customer_id: i64,
    pub age: i64,
    pub gender: String,
    pub tenure_months: i64,
    pub monthly_charges: f64,
    pub contract_type: String,
    pub internet_service: String,
    pub total_charges: f64,
    pub tech_support: String,
    pub churn_status: bool,
    pub lifetime_value: f64,
    pub load_timestamp: String,
}

impl CleanRow {
    /// Project the fact-shaped slice of a clean row for the staging buffer.
    pub fn to_staging(&self) -> StagingRow {
        StagingRow {
            customer_id: self.customer_id,
            contract_type: self.contract_type.clone(),
            internet_service: self.internet_service.clone(),
            tech_support: self.tech_support.clone(),
            tenure_months: self.tenure_months,
            monthly_charges: self.monthly_charges,
            total_charges: self.total_charges,
            lifetime_value: self.lifetime_value,
            churn_status: self.churn_status,
            load_timestamp: self.load_timestamp.clone(),
        }
    }
}

/// A candidate fact row: natural-key attributes (not yet resolved to
/// surrogate keys) plus measures. Lives only for the duration of one
/// batch's reconcile transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRow {
    pub customer_id: i64,
    pub contract_type: String,
    pub internet_service: String,
    pub tech_support: String,
    pub tenure_months: i64,
    pub monthly_charges: f64,
    pub total_charges: f64,
    pub lifetime_value: f64,
    pub churn_status: bool,
    pub load_timestamp: String,
}

impl StagingRow {
    /// The 5-attribute natural key a fact row is deduplicated on.
    pub fn natural_key(&self) -> (i64, String, String, String, i64) {
        (
            self.customer_id,
            self.contract_type.clone(),
            self.internet_service.clone(),
            self.tech_support.clone(),
            self.tenure_months,
        )
    }
}

/// A persisted fact row, read back for verification and reporting.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct FactRow {
    pub fact_key: i64,
    pub customer_key: i64,
    pub contract_key: i64,
    pub service_key: i64,
    pub support_key: i64,
    pub tenure_key: i64,
    pub monthly_charges: f64,
    pub total_charges: f64,
    pub lifetime_value: f64,
    pub churn_status: bool,
    pub load_timestamp: String,
}
