//! Pipeline configuration: TOML file with CLI overrides

use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Default tolerance used when comparing floating ratio metrics.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// Top-level configuration for a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Rank city/category tiers per order year instead of over all time
    pub per_year_tiers: bool,
    /// Fixed calendar span of the generated date dimension
    pub date_dimension: DateRange,
    /// Margin applied to observed revenue for the CLV view
    pub margin_rate: Decimal,
    /// Unit price bucket boundaries
    pub price_buckets: PriceBucketBounds,
    /// RFM scoring and segmentation rules
    pub rfm: RfmConfig,
    /// Order date formats, tried in order; first successful parse wins
    pub date_formats: Vec<String>,
    /// Optional literal row-count gate for the master relation
    pub expected_master_rows: Option<usize>,
    /// Number of values kept in raw frequency breakdowns
    pub top_n: usize,
    /// Number of most recent master rows kept as a spot sample
    pub spot_sample_size: usize,
    /// Absolute tolerance for floating reconciliation checks
    pub reconciliation_tolerance: f64,
    /// Abort the run when a star-schema or view guardrail fails
    pub fail_on_guardrail: bool,
    /// Raw extract file names, relative to the input directory
    pub inputs: InputFiles,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            per_year_tiers: false,
            date_dimension: DateRange::default(),
            margin_rate: Decimal::new(30, 2),
            price_buckets: PriceBucketBounds::default(),
            rfm: RfmConfig::default(),
            date_formats: vec![
                "%Y-%m-%d".to_string(),
                "%Y-%m-%d %H:%M:%S".to_string(),
                "%m/%d/%Y".to_string(),
                "%d-%m-%Y".to_string(),
                "%d.%m.%Y".to_string(),
            ],
            expected_master_rows: None,
            top_n: 10,
            spot_sample_size: 10,
            reconciliation_tolerance: DEFAULT_TOLERANCE,
            fail_on_guardrail: true,
            inputs: InputFiles::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would produce meaningless output.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.date_dimension.start > self.date_dimension.end {
            return Err(PipelineError::Config(format!(
                "date dimension start {} is after end {}",
                self.date_dimension.start, self.date_dimension.end
            )));
        }
        let b = &self.price_buckets;
        if !(b.low > Decimal::ZERO && b.low < b.mid && b.mid < b.high) {
            return Err(PipelineError::Config(format!(
                "price bucket bounds must be positive and increasing, got {}, {}, {}",
                b.low, b.mid, b.high
            )));
        }
        if self.margin_rate < Decimal::ZERO || self.margin_rate > Decimal::ONE {
            return Err(PipelineError::Config(format!(
                "margin rate {} outside [0, 1]",
                self.margin_rate
            )));
        }
        if self.rfm.quantiles == 0 {
            return Err(PipelineError::Config("RFM quantile count must be at least 1".into()));
        }
        if self.date_formats.is_empty() {
            return Err(PipelineError::Config("at least one date format is required".into()));
        }
        if !self.reconciliation_tolerance.is_finite() || self.reconciliation_tolerance < 0.0 {
            return Err(PipelineError::Config(
                "reconciliation tolerance must be a non-negative number".into(),
            ));
        }
        Ok(())
    }
}

/// Inclusive calendar range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Default for DateRange {
    fn default() -> Self {
        Self {
            start: NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or_default(),
            end: NaiveDate::from_ymd_opt(2030, 12, 31).unwrap_or_default(),
        }
    }
}

/// Boundaries of the four unit price buckets:
/// `[0, low)`, `[low, mid)`, `[mid, high)`, `[high, inf)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBucketBounds {
    pub low: Decimal,
    pub mid: Decimal,
    pub high: Decimal,
}

impl Default for PriceBucketBounds {
    fn default() -> Self {
        Self {
            low: Decimal::from(20),
            mid: Decimal::from(50),
            high: Decimal::from(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfmConfig {
    pub quantiles: usize,
    pub thresholds: SegmentThresholds,
}

impl Default for RfmConfig {
    fn default() -> Self {
        Self {
            quantiles: 5,
            thresholds: SegmentThresholds::default(),
        }
    }
}

/// Score thresholds for RFM segments, evaluated in precedence order:
/// Champions, Loyal, New Customers, At Risk, Lost, then Regulars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentThresholds {
    pub champions_min_r: u32,
    pub champions_min_f: u32,
    pub champions_min_m: u32,
    pub loyal_min_r: u32,
    pub loyal_min_f: u32,
    pub new_min_r: u32,
    pub new_max_f: u32,
    pub at_risk_max_r: u32,
    pub at_risk_min_f: u32,
    pub lost_max_r: u32,
    pub lost_max_f: u32,
}

impl Default for SegmentThresholds {
    fn default() -> Self {
        Self {
            champions_min_r: 4,
            champions_min_f: 4,
            champions_min_m: 4,
            loyal_min_r: 3,
            loyal_min_f: 4,
            new_min_r: 4,
            new_max_f: 2,
            at_risk_max_r: 2,
            at_risk_min_f: 3,
            lost_max_r: 2,
            lost_max_f: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputFiles {
    pub customers: String,
    pub products: String,
    pub categories: String,
    pub orders: String,
}

impl Default for InputFiles {
    fn default() -> Self {
        Self {
            customers: "customers.csv".to_string(),
            products: "products.csv".to_string(),
            categories: "categories.csv".to_string(),
            orders: "orders.csv".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.margin_rate, Decimal::new(30, 2));
        assert_eq!(config.rfm.quantiles, 5);
        assert!(!config.per_year_tiers);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let text = r#"
            per_year_tiers = true
            margin_rate = "0.25"

            [date_dimension]
            start = "2020-01-01"
            end = "2022-12-31"
        "#;
        let config = PipelineConfig::from_toml_str(text).unwrap();
        assert!(config.per_year_tiers);
        assert_eq!(config.margin_rate, Decimal::new(25, 2));
        assert_eq!(
            config.date_dimension.start,
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
        );
        assert_eq!(config.price_buckets, PriceBucketBounds::default());
        assert_eq!(config.inputs.orders, "orders.csv");
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let config = PipelineConfig::from_toml_str(include_str!("../salesforge.toml")).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_inverted_date_range_rejected() {
        let mut config = PipelineConfig::default();
        config.date_dimension = DateRange {
            start: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_non_increasing_buckets_rejected() {
        let mut config = PipelineConfig::default();
        config.price_buckets.mid = Decimal::from(20);
        assert!(config.validate().is_err());

        config.price_buckets = PriceBucketBounds::default();
        config.margin_rate = Decimal::from(2);
        assert!(config.validate().is_err());
    }
}
