//! Behavioral enrichment of master sales lines
//!
//! Customer lifecycle attributes are Polars window expressions partitioned
//! by customer; tiers rank one row per (scope, entity) partition and are
//! joined back onto every line of the partition.

use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use rust_decimal::Decimal;
use tracing::{info, info_span};

use crate::config::PriceBucketBounds;
use crate::frame::{
    amount_order, count_values, date_values, decimal_column, decimal_values, left_join, stable_sort,
    stable_sort_desc, str_values, values, ROW,
};
use crate::master::sales_frame;
use crate::model::{quarter_of, year_month_label, EnrichedSalesLine, MasterSalesLine};
use crate::qa::{QaCheck, Stage};
use crate::stats::{ntile, safe_div_decimal};

pub const TIER_COUNT: usize = 3;
pub const CITY_TIER_LABELS: [&str; TIER_COUNT] = ["Tier 1 (Top)", "Tier 2", "Tier 3 (Emerging)"];
pub const CATEGORY_TIER_LABELS: [&str; TIER_COUNT] =
    ["Tier 1 (Core)", "Tier 2", "Tier 3 (Long tail)"];

const TIER_SCOPE: &str = "tier_scope";

/// Unit price bucket: left-inclusive, right-exclusive ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriceBucket {
    Under,
    Low,
    Mid,
    High,
}

impl PriceBucket {
    /// Lowest prices first.
    pub const ALL: [PriceBucket; 4] =
        [PriceBucket::Under, PriceBucket::Low, PriceBucket::Mid, PriceBucket::High];

    /// Position in [`PriceBucket::ALL`].
    pub fn ordinal(&self) -> u32 {
        *self as u32
    }

    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    pub fn classify(price: Decimal, bounds: &PriceBucketBounds) -> Self {
        if price < bounds.low {
            PriceBucket::Under
        } else if price < bounds.mid {
            PriceBucket::Low
        } else if price < bounds.high {
            PriceBucket::Mid
        } else {
            PriceBucket::High
        }
    }

    /// Display label; with default bounds: `Under 20`, `20–49.99`,
    /// `50–99.99`, `100+`.
    pub fn label(&self, bounds: &PriceBucketBounds) -> String {
        let cent = Decimal::new(1, 2);
        match self {
            PriceBucket::Under => format!("Under {}", bounds.low.normalize()),
            PriceBucket::Low => {
                format!("{}–{}", bounds.low.normalize(), (bounds.mid - cent).normalize())
            }
            PriceBucket::Mid => {
                format!("{}–{}", bounds.mid.normalize(), (bounds.high - cent).normalize())
            }
            PriceBucket::High => format!("{}+", bounds.high.normalize()),
        }
    }
}

/// Label for a unit price under the given bounds.
pub fn price_bucket_label(price: Decimal, bounds: &PriceBucketBounds) -> String {
    PriceBucket::classify(price, bounds).label(bounds)
}

/// Whether city/category tiers are ranked over all time or within each year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierGranularity {
    AllTime,
    PerYear,
}

impl TierGranularity {
    pub fn from_toggle(per_year: bool) -> Self {
        if per_year {
            TierGranularity::PerYear
        } else {
            TierGranularity::AllTime
        }
    }

    /// Tier partition of a line: a single scope for all time, the order year
    /// otherwise.
    fn scope(&self) -> Expr {
        match self {
            TierGranularity::AllTime => lit(0i32),
            TierGranularity::PerYear => col("order_year"),
        }
    }
}

/// Weekday number with Sunday = 1 through Saturday = 7.
pub fn weekday_number(date: NaiveDate) -> u32 {
    date.weekday().number_from_sunday()
}

pub fn weekday_name(date: NaiveDate) -> String {
    date.format("%A").to_string()
}

/// ISO 8601 week number.
pub fn week_of_year(date: NaiveDate) -> u32 {
    date.iso_week().week()
}

/// Customer windows, per-customer sequence and tier partition revenue, one
/// row per line in input order.
///
/// Many lines share an order date and there is no order id, so every line
/// column takes part in the sequence order.
fn windowed_frame(
    lines: &[MasterSalesLine],
    granularity: TierGranularity,
) -> PolarsResult<DataFrame> {
    let mut sales = sales_frame(lines)?;
    sales.with_column(Column::new("order_year".into(), values(lines, |l| l.order_date.year())))?;

    let customer = [col("customer_email")];
    let city = [col(TIER_SCOPE), col("customer_city")];
    let category = [col(TIER_SCOPE), col("category_name")];
    sales
        .lazy()
        .with_row_index(ROW, None)
        .with_column(granularity.scope().alias(TIER_SCOPE))
        .with_columns([
            col("order_date").min().over(customer.clone()).alias("first_order_date"),
            col("line_revenue")
                .sum()
                .over(customer.clone())
                .alias("customer_lifetime_revenue"),
            len().over(customer.clone()).alias("customer_line_count"),
            col("line_revenue").sum().over(city.clone()).alias("city_revenue"),
            col("line_revenue").sum().over(category.clone()).alias("category_revenue"),
            col(ROW).min().over(city).alias("city_entity"),
            col(ROW).min().over(category).alias("category_entity"),
        ])
        .sort_by_exprs(
            [
                col("customer_email"),
                col("order_date"),
                col("product_name"),
                col("category_name"),
                amount_order("unit_price"),
                amount_order("line_revenue"),
            ],
            stable_sort(),
        )
        .with_row_index("position", None)
        .with_column(
            (col("position") - col("position").min().over(customer) + lit(1u32))
                .alias("order_sequence_number"),
        )
        .sort_by_exprs([col(ROW)], stable_sort())
        .collect()
}

/// Tier label per entity partition. Entities rank by revenue descending, then
/// name, within their scope; `NTILE(3)` over that order picks the label.
fn tier_labels(
    windowed: &DataFrame,
    entity: &str,
    name: &str,
    revenue: &str,
    labels: &[&str; TIER_COUNT],
    tier: &str,
) -> PolarsResult<DataFrame> {
    let ranked = windowed
        .clone()
        .lazy()
        .filter(col(ROW).eq(col(entity)))
        .select([col(TIER_SCOPE), col(entity), col(name), col(revenue)])
        .sort_by_exprs(
            [col(TIER_SCOPE), amount_order(revenue), col(name)],
            stable_sort_desc([false, true, false]),
        )
        .with_row_index("position", None)
        .with_columns([
            (col("position") - col("position").min().over([col(TIER_SCOPE)]))
                .alias("scope_position"),
            len().over([col(TIER_SCOPE)]).alias("scope_size"),
        ])
        .collect()?;

    let positions = count_values(&ranked, "scope_position")?;
    let sizes = count_values(&ranked, "scope_size")?;
    let tiers: Vec<&str> = positions
        .iter()
        .zip(&sizes)
        .map(|(position, size)| labels[ntile(*position, *size, TIER_COUNT) - 1])
        .collect();
    DataFrame::new(vec![
        ranked.column(entity)?.clone(),
        Column::new(tier.into(), tiers),
    ])
}

/// Enrich master lines with time parts, price bucket, customer lifecycle
/// windows and revenue tiers. Output preserves input order.
pub fn enrich(
    lines: &[MasterSalesLine],
    bounds: &PriceBucketBounds,
    granularity: TierGranularity,
) -> crate::Result<Vec<EnrichedSalesLine>> {
    let _span = info_span!("enrichment_engine", granularity = ?granularity).entered();

    let windowed = windowed_frame(lines, granularity)?;
    let city_tiers = tier_labels(
        &windowed,
        "city_entity",
        "customer_city",
        "city_revenue",
        &CITY_TIER_LABELS,
        "city_tier",
    )?;
    let category_tiers = tier_labels(
        &windowed,
        "category_entity",
        "category_name",
        "category_revenue",
        &CATEGORY_TIER_LABELS,
        "category_tier",
    )?;
    let tiered = left_join(windowed.lazy(), city_tiers.lazy(), "city_entity");
    let tiered = left_join(tiered, category_tiers.lazy(), "category_entity")
        .sort_by_exprs([col(ROW)], stable_sort())
        .collect()?;

    let first_dates = date_values(&tiered, "first_order_date")?;
    let lifetime_revenue = decimal_values(&tiered, "customer_lifetime_revenue")?;
    let line_counts = count_values(&tiered, "customer_line_count")?;
    let sequence = count_values(&tiered, "order_sequence_number")?;
    let city_tiers = str_values(&tiered, "city_tier")?;
    let city_revenue = decimal_values(&tiered, "city_revenue")?;
    let category_tiers = str_values(&tiered, "category_tier")?;
    let category_revenue = decimal_values(&tiered, "category_revenue")?;

    let enriched: Vec<EnrichedSalesLine> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let date = line.order_date;
            EnrichedSalesLine {
                line: line.clone(),
                order_year: date.year(),
                order_month: date.month(),
                order_quarter: quarter_of(date),
                order_year_month: year_month_label(date),
                weekday_name: weekday_name(date),
                weekday_num: weekday_number(date),
                week_of_year: week_of_year(date),
                price_bucket: price_bucket_label(line.unit_price, bounds),
                first_order_date: first_dates[i],
                days_since_first: (date - first_dates[i]).num_days(),
                order_sequence_number: sequence[i],
                is_repeat_customer: sequence[i] > 1,
                customer_lifetime_revenue: lifetime_revenue[i],
                customer_line_count: line_counts[i],
                customer_avg_line_value: safe_div_decimal(
                    lifetime_revenue[i],
                    Decimal::from(line_counts[i]),
                )
                .map(|avg| avg.round_dp(4)),
                city_tier: city_tiers[i].clone(),
                city_revenue: city_revenue[i],
                category_tier: category_tiers[i].clone(),
                category_revenue: category_revenue[i],
            }
        })
        .collect();

    info!(
        lines = enriched.len(),
        customers = sequence.iter().filter(|n| **n == 1).count(),
        "enrichment complete"
    );
    Ok(enriched)
}

/// Consistency checks between the master and enriched relations.
pub fn enrichment_checks(
    master: &[MasterSalesLine],
    enriched: &[EnrichedSalesLine],
) -> PolarsResult<Vec<QaCheck>> {
    let emails = Column::new("customer_email".into(), values(master, |l| l.customer_email.clone()));
    let customers = emails.as_materialized_series().n_unique()?;
    let first_lines = enriched.iter().filter(|e| e.order_sequence_number == 1).count();
    let master_revenue: Decimal = master.iter().map(|l| l.line_revenue).sum();

    // Every line of a customer carries the same lifetime revenue
    let per_customer = DataFrame::new(vec![
        Column::new("customer_email".into(), values(enriched, |e| e.line.customer_email.clone())),
        decimal_column("lifetime", &values(enriched, |e| e.customer_lifetime_revenue))?,
    ])?
    .lazy()
    .group_by([col("customer_email")])
    .agg([col("lifetime").first()])
    .collect()?;
    let lifetime_revenue: Decimal = decimal_values(&per_customer, "lifetime")?.iter().sum();

    Ok(vec![
        QaCheck::equals(Stage::Enrichment, "enriched.row_parity", enriched.len(), master.len()),
        QaCheck::equals(
            Stage::Enrichment,
            "enriched.first_lines_per_customer",
            first_lines,
            customers,
        ),
        QaCheck::equals(
            Stage::Enrichment,
            "enriched.lifetime_revenue_total",
            lifetime_revenue,
            master_revenue,
        ),
    ])
}
