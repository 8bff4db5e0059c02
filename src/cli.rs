//! Command-line interface definitions and argument parsing

use std::path::Path;

use chrono::NaiveDate;
use clap::Parser;

use crate::config::PipelineConfig;

/// Sales BI pipeline: raw CSV extracts to a star schema and metric views
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory holding the raw CSV extracts
    #[arg(short, long, default_value = "data")]
    pub input: String,

    /// Directory receiving every output relation as CSV
    #[arg(short, long, default_value = "output")]
    pub output: String,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Rank city and category tiers within each year instead of all-time
    #[arg(long)]
    pub per_year_tiers: bool,

    /// First day of the date dimension (YYYY-MM-DD)
    #[arg(long)]
    pub date_start: Option<String>,

    /// Last day of the date dimension (YYYY-MM-DD)
    #[arg(long)]
    pub date_end: Option<String>,

    /// Run the pipeline without writing output relations
    #[arg(long)]
    pub no_write: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_flag_date(flag: &str, value: &str) -> crate::Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("Invalid {} value: {}", flag, value))
}

impl Args {
    /// Configuration from the TOML file (or defaults) with flag overrides
    /// applied on top.
    pub fn load_config(&self) -> crate::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(Path::new(path))?,
            None => PipelineConfig::default(),
        };

        if self.per_year_tiers {
            config.per_year_tiers = true;
        }
        if let Some(start) = &self.date_start {
            config.date_dimension.start = parse_flag_date("date-start", start)?;
        }
        if let Some(end) = &self.date_end {
            config.date_dimension.end = parse_flag_date("date-end", end)?;
        }

        config.validate()?;
        Ok(config)
    }
}
