// src/config.rs
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level pipeline configuration, loaded from YAML.
///
/// Every field has a default, so an empty file (or no file at all) runs the
/// pipeline with the stock table names and filter constants.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory of the Parquet warehouse.
    pub warehouse_root: PathBuf,
    pub source_table: String,
    pub filtered_table: String,
    pub transformed_table: String,
    /// When set, the per-month filter report is persisted here (replaced each run).
    pub report_table: Option<String>,
    /// Months computed concurrently; 1 means strictly sequential.
    pub parallel_months: usize,
    pub filter: FilterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            warehouse_root: PathBuf::from("warehouse"),
            source_table: "yellow_taxi_data_raw".to_string(),
            filtered_table: "yellow_taxi_data_filtered".to_string(),
            transformed_table: "yellow_taxi_data_transformed".to_string(),
            report_table: None,
            parallel_months: 1,
            filter: FilterConfig::default(),
        }
    }
}

/// Constants for the funnel rules.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Upper-bound quantile for duration, total amount and distance.
    pub quantile: f64,
    /// Published minimum fare.
    pub min_total_amount: f64,
    /// Pickup zones meaning "unknown" or "outside the city".
    pub invalid_location_ids: Vec<i64>,
    pub min_passenger_count: i64,
    pub max_passenger_count: i64,
    pub threshold_scope: ThresholdScope,
    pub estimator: EstimatorConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            quantile: 0.999,
            min_total_amount: 2.5,
            invalid_location_ids: vec![1, 264, 265],
            min_passenger_count: 1,
            max_passenger_count: 5,
            threshold_scope: ThresholdScope::default(),
            estimator: EstimatorConfig::default(),
        }
    }
}

/// Which record set the dynamic upper bounds are computed over.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdScope {
    /// All three bounds from the set surviving the completeness rule.
    #[default]
    PostCompleteness,
    /// Each bound from the survivors of the rule just before it.
    Sequential,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    #[serde(rename = "tdigest")]
    TDigest,
    Exact,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EstimatorConfig {
    pub kind: EstimatorKind,
    /// t-digest compression; higher is more accurate and uses more centroids.
    pub compression: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            kind: EstimatorKind::TDigest,
            compression: 100.0,
        }
    }
}

impl PipelineConfig {
    /// Read and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|source| PipelineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&text).map_err(|source| PipelineError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let f = &self.filter;
        if !(f.quantile > 0.0 && f.quantile < 1.0) {
            return Err(PipelineError::InvalidQuantile(f.quantile));
        }
        if f.min_passenger_count > f.max_passenger_count {
            return Err(PipelineError::InvalidConfig(format!(
                "min_passenger_count {} exceeds max_passenger_count {}",
                f.min_passenger_count, f.max_passenger_count
            )));
        }
        if !f.min_total_amount.is_finite() {
            return Err(PipelineError::InvalidConfig(
                "min_total_amount must be finite".into(),
            ));
        }
        if !(f.estimator.compression >= 10.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "estimator compression {} is below 10",
                f.estimator.compression
            )));
        }
        if self.parallel_months == 0 {
            return Err(PipelineError::InvalidConfig(
                "parallel_months must be at least 1".into(),
            ));
        }
        let tables = [
            &self.source_table,
            &self.filtered_table,
            &self.transformed_table,
        ];
        if tables.iter().any(|t| t.trim().is_empty()) {
            return Err(PipelineError::InvalidConfig("table names must not be empty".into()));
        }
        if self.source_table == self.filtered_table
            || self.source_table == self.transformed_table
            || self.filtered_table == self.transformed_table
        {
            return Err(PipelineError::InvalidConfig(
                "source, filtered and transformed tables must be distinct".into(),
            ));
        }
        if let Some(report) = &self.report_table {
            if report.trim().is_empty() || tables.contains(&report) {
                return Err(PipelineError::InvalidConfig(format!(
                    "report_table `{}` must be non-empty and distinct from the data tables",
                    report
                )));
            }
        }
        Ok(())
    }
}
