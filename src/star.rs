//! Star schema: conformed date, customer and product dimensions plus a fact
//! relation at order-line grain.
//!
//! Surrogate keys are hashes of normalized business keys, so the fact side
//! recomputes them independently instead of looking them up.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate, Weekday};
use polars::prelude::*;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{info, info_span, warn};

use crate::config::DateRange;
use crate::enrich::{week_of_year, weekday_name, weekday_number};
use crate::frame::{
    count_values, date_column, date_values, decimal_column, decimal_values, duplicate_count,
    i64_values, key_marker, left_join, opt_str_values, scalar_count, stable_sort, str_values,
    values, ROW,
};
use crate::master::monthly_revenue;
use crate::model::{
    quarter_of, year_month_label, DimCustomer, DimDate, DimProduct, FactSales, MasterSalesLine,
};
use crate::qa::{QaCheck, Stage};

/// Delimiter between product name and category name in the product key.
pub const PRODUCT_KEY_DELIMITER: &str = "|";

/// First 8 bytes of the SHA-256 digest, big-endian, as a signed 64-bit key.
pub fn surrogate_key(business_key: &str) -> i64 {
    let digest = Sha256::digest(business_key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Key of a customer: hash of the trimmed, lowercased email.
pub fn customer_key(email: &str) -> i64 {
    surrogate_key(&email.trim().to_lowercase())
}

/// Key of a product: hash of `NAME|CATEGORY`, trimmed and uppercased.
pub fn product_key(product_name: &str, category_name: &str) -> i64 {
    let joined = format!(
        "{}{}{}",
        product_name.trim(),
        PRODUCT_KEY_DELIMITER,
        category_name.trim()
    );
    surrogate_key(&joined.to_uppercase())
}

/// `YYYYMMDD` integer key of a calendar day.
pub fn date_key(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StarSchema {
    pub dim_date: Vec<DimDate>,
    pub dim_customer: Vec<DimCustomer>,
    pub dim_product: Vec<DimProduct>,
    pub fact_sales: Vec<FactSales>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StarReport {
    pub master_rows: usize,
    pub fact_rows: usize,
    /// Fact rows excluded by the inner join, per dimension
    pub unmatched: BTreeMap<&'static str, usize>,
    pub fact_rows_with_unresolved_keys: usize,
    pub master_date_range: Option<(NaiveDate, NaiveDate)>,
    pub fact_date_range: Option<(NaiveDate, NaiveDate)>,
    /// Months whose master and fact revenue disagree
    pub revenue_mismatched_months: Vec<String>,
    /// Months whose master and fact quantity disagree
    pub quantity_mismatched_months: Vec<String>,
    pub customer_key_collisions: usize,
    pub product_key_collisions: usize,
}

fn render_range(range: Option<(NaiveDate, NaiveDate)>) -> String {
    match range {
        Some((min, max)) => format!("{min}..{max}"),
        None => "empty".to_string(),
    }
}

impl StarReport {
    pub fn qa_checks(&self) -> Vec<QaCheck> {
        let stage = Stage::StarSchema;
        let mut checks = vec![
            QaCheck::equals(stage, "star.row_parity", self.fact_rows, self.master_rows),
            QaCheck::equals(
                stage,
                "star.null_surrogate_keys",
                self.fact_rows_with_unresolved_keys,
                0,
            ),
            QaCheck::equals(
                stage,
                "star.date_range",
                render_range(self.fact_date_range),
                render_range(self.master_date_range),
            ),
            QaCheck::equals(stage, "star.monthly_revenue", self.revenue_mismatched_months.len(), 0)
                .with_detail(self.revenue_mismatched_months.join(",")),
            QaCheck::equals(
                stage,
                "star.monthly_quantity",
                self.quantity_mismatched_months.len(),
                0,
            )
            .with_detail(self.quantity_mismatched_months.join(",")),
            QaCheck::equals(stage, "star.customer_key_unique", self.customer_key_collisions, 0),
            QaCheck::equals(stage, "star.product_key_unique", self.product_key_collisions, 0),
        ];
        for (dimension, count) in &self.unmatched {
            checks.push(QaCheck::loss(stage, format!("star.unmatched.{dimension}"), *count));
        }
        checks
    }
}

/// One row per calendar day of the configured range, independent of data.
pub fn build_dim_date(range: &DateRange) -> Vec<DimDate> {
    range
        .start
        .iter_days()
        .take_while(|date| *date <= range.end)
        .map(|date| DimDate {
            date_key: date_key(date),
            date,
            year: date.year(),
            quarter: quarter_of(date),
            month: date.month(),
            month_name: date.format("%B").to_string(),
            day: date.day(),
            weekday_num: weekday_number(date),
            weekday_name: weekday_name(date),
            week_of_year: week_of_year(date),
            is_weekend: matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
            year_month: year_month_label(date),
        })
        .collect()
}

/// One row per normalized email. The city is taken from the customer's most
/// recent line; same-day ties resolve to the greatest city value, with a
/// missing city lowest.
pub fn build_dim_customer(master: &[MasterSalesLine]) -> PolarsResult<Vec<DimCustomer>> {
    let lines = DataFrame::new(vec![
        Column::new(
            "customer_email".into(),
            values(master, |l| l.customer_email.trim().to_lowercase()),
        ),
        date_column("order_date", &values(master, |l| l.order_date))?,
        Column::new("customer_city".into(), values(master, |l| l.customer_city.clone())),
    ])?;

    let latest = lines
        .lazy()
        .sort_by_exprs(
            [col("customer_email"), col("order_date"), col("customer_city")],
            stable_sort(),
        )
        .filter(col("customer_email").is_last_distinct())
        .collect()?;

    let emails = str_values(&latest, "customer_email")?;
    let cities = opt_str_values(&latest, "customer_city")?;
    Ok(emails
        .into_iter()
        .zip(cities)
        .map(|(email, city)| DimCustomer {
            customer_key: customer_key(&email),
            customer_email: email,
            customer_city: city,
        })
        .collect())
}

/// One row per distinct (product name, category name) pair.
pub fn build_dim_product(master: &[MasterSalesLine]) -> PolarsResult<Vec<DimProduct>> {
    let pairs = DataFrame::new(vec![
        Column::new("product_name".into(), values(master, |l| l.product_name.clone())),
        Column::new("category_name".into(), values(master, |l| l.category_name.clone())),
    ])?
    .lazy()
    .group_by([col("product_name"), col("category_name")])
    .agg([len().alias("lines")])
    .sort_by_exprs([col("product_name"), col("category_name")], stable_sort())
    .collect()?;

    let names = str_values(&pairs, "product_name")?;
    let categories = str_values(&pairs, "category_name")?;
    Ok(names
        .into_iter()
        .zip(categories)
        .map(|(name, category)| DimProduct {
            product_key: product_key(&name, &category),
            product_name: name,
            category_name: category,
        })
        .collect())
}

/// Fact rows with a row position, as a lazy frame.
fn fact_frame(facts: &[FactSales]) -> PolarsResult<LazyFrame> {
    Ok(DataFrame::new(vec![
        Column::new("date_key".into(), values(facts, |f| f.date_key)),
        Column::new("customer_key".into(), values(facts, |f| f.customer_key)),
        Column::new("product_key".into(), values(facts, |f| f.product_key)),
        Column::new("quantity".into(), values(facts, |f| f.quantity)),
        decimal_column("line_revenue", &values(facts, |f| f.line_revenue))?,
    ])?
    .lazy()
    .with_row_index(ROW, None))
}

/// Fact keys left-joined to a presence marker per dimension, in fact order.
fn resolve_dimensions(
    facts: LazyFrame,
    dim_date: &[DimDate],
    dim_customer: &[DimCustomer],
    dim_product: &[DimProduct],
) -> PolarsResult<LazyFrame> {
    let date_keys = DataFrame::new(vec![Column::new(
        "date_key".into(),
        values(dim_date, |d| d.date_key),
    )])?;
    let customer_keys = DataFrame::new(vec![Column::new(
        "customer_key".into(),
        values(dim_customer, |c| c.customer_key),
    )])?;
    let product_keys = DataFrame::new(vec![Column::new(
        "product_key".into(),
        values(dim_product, |p| p.product_key),
    )])?;

    let resolved = left_join(
        facts,
        key_marker(date_keys.lazy(), "date_key", "in_dim_date"),
        "date_key",
    );
    let resolved = left_join(
        resolved,
        key_marker(customer_keys.lazy(), "customer_key", "in_dim_customer"),
        "customer_key",
    );
    let resolved = left_join(
        resolved,
        key_marker(product_keys.lazy(), "product_key", "in_dim_product"),
        "product_key",
    );
    Ok(resolved.sort_by_exprs([col(ROW)], stable_sort()))
}

fn all_dimensions_resolve() -> Expr {
    col("in_dim_date")
        .is_not_null()
        .and(col("in_dim_customer").is_not_null())
        .and(col("in_dim_product").is_not_null())
}

/// Fact rows the inner join drops, counted under the first dimension that
/// fails to resolve.
fn unmatched_counts(resolved: LazyFrame) -> PolarsResult<BTreeMap<&'static str, usize>> {
    let has_date = col("in_dim_date").is_not_null();
    let has_customer = col("in_dim_customer").is_not_null();
    let counts = resolved
        .select([
            col("in_dim_date").is_null().sum().alias("dim_date"),
            has_date
                .clone()
                .and(col("in_dim_customer").is_null())
                .sum()
                .alias("dim_customer"),
            has_date
                .and(has_customer)
                .and(col("in_dim_product").is_null())
                .sum()
                .alias("dim_product"),
        ])
        .collect()?;

    let mut unmatched = BTreeMap::new();
    for dimension in ["dim_date", "dim_customer", "dim_product"] {
        let count = scalar_count(&counts, dimension)?;
        if count > 0 {
            unmatched.insert(dimension, count);
        }
    }
    Ok(unmatched)
}

/// Derive dimensions and the fact relation from master lines, then check the
/// fact against master. Guardrail failures are reported, not raised.
pub fn build_star_schema(
    master: &[MasterSalesLine],
    range: &DateRange,
) -> crate::Result<(StarSchema, StarReport)> {
    let _span = info_span!("star_schema_builder").entered();

    let dim_date = build_dim_date(range);
    let dim_customer = build_dim_customer(master)?;
    let dim_product = build_dim_product(master)?;

    let candidates: Vec<FactSales> = master
        .iter()
        .map(|line| FactSales {
            date_key: date_key(line.order_date),
            customer_key: customer_key(&line.customer_email),
            product_key: product_key(&line.product_name, &line.category_name),
            quantity: line.quantity,
            unit_price: line.unit_price,
            line_revenue: line.line_revenue,
        })
        .collect();

    let resolved =
        resolve_dimensions(fact_frame(&candidates)?, &dim_date, &dim_customer, &dim_product)?;
    let unmatched = unmatched_counts(resolved.clone())?;
    let kept = resolved
        .filter(all_dimensions_resolve())
        .select([col(ROW)])
        .collect()?;
    let fact_sales: Vec<FactSales> = count_values(&kept, ROW)?
        .into_iter()
        .filter_map(|row| candidates.get(row).cloned())
        .collect();

    let schema = StarSchema {
        dim_date,
        dim_customer,
        dim_product,
        fact_sales,
    };
    let report = star_report(master, &schema, unmatched)?;

    if report.fact_rows != report.master_rows {
        warn!(
            master = report.master_rows,
            fact = report.fact_rows,
            "fact rows dropped by dimension join"
        );
    }
    info!(
        dim_date = schema.dim_date.len(),
        dim_customer = schema.dim_customer.len(),
        dim_product = schema.dim_product.len(),
        fact = schema.fact_sales.len(),
        "star schema built"
    );
    Ok((schema, report))
}

/// Recompute the guardrail observations for an already built schema.
pub fn star_report(
    master: &[MasterSalesLine],
    schema: &StarSchema,
    unmatched: BTreeMap<&'static str, usize>,
) -> PolarsResult<StarReport> {
    let dates = DataFrame::new(vec![
        Column::new("date_key".into(), values(&schema.dim_date, |d| d.date_key)),
        date_column("date", &values(&schema.dim_date, |d| d.date))?,
        Column::new("year_month".into(), values(&schema.dim_date, |d| d.year_month.clone())),
    ])?
    .lazy()
    .filter(col("date_key").is_first_distinct());

    let facts = resolve_dimensions(
        fact_frame(&schema.fact_sales)?,
        &schema.dim_date,
        &schema.dim_customer,
        &schema.dim_product,
    )?;
    let facts = left_join(facts, dates, "date_key");

    let unresolved = facts
        .clone()
        .filter(all_dimensions_resolve().not())
        .select([len().alias("rows")])
        .collect()?;

    let dated = facts.filter(col("date").is_not_null());
    let fact_dates = dated.clone().select([col("date")]).collect()?;
    let fact_months = dated
        .group_by([col("year_month")])
        .agg([
            col("quantity").sum().alias("quantity"),
            col("line_revenue").sum().alias("revenue"),
        ])
        .sort_by_exprs([col("year_month")], stable_sort())
        .collect()?;

    let fact_totals: BTreeMap<String, (i64, Decimal)> = str_values(&fact_months, "year_month")?
        .into_iter()
        .zip(
            i64_values(&fact_months, "quantity")?
                .into_iter()
                .zip(decimal_values(&fact_months, "revenue")?),
        )
        .collect();
    let master_totals: BTreeMap<String, (i64, Decimal)> = monthly_revenue(master)?
        .into_iter()
        .map(|m| (m.year_month, (m.quantity, m.revenue)))
        .collect();

    let mut revenue_mismatched_months = Vec::new();
    let mut quantity_mismatched_months = Vec::new();
    let months: BTreeSet<&String> = master_totals.keys().chain(fact_totals.keys()).collect();
    for month in months {
        let none = (0, Decimal::ZERO);
        let (master_quantity, master_revenue) =
            master_totals.get(month).copied().unwrap_or(none);
        let (fact_quantity, fact_revenue) = fact_totals.get(month).copied().unwrap_or(none);
        if master_revenue != fact_revenue {
            revenue_mismatched_months.push(month.clone());
        }
        if master_quantity != fact_quantity {
            quantity_mismatched_months.push(month.clone());
        }
    }

    let customer_keys = Column::new(
        "customer_key".into(),
        values(&schema.dim_customer, |c| c.customer_key),
    );
    let product_keys = Column::new(
        "product_key".into(),
        values(&schema.dim_product, |p| p.product_key),
    );
    Ok(StarReport {
        master_rows: master.len(),
        fact_rows: schema.fact_sales.len(),
        unmatched,
        fact_rows_with_unresolved_keys: scalar_count(&unresolved, "rows")?,
        master_date_range: date_span(master.iter().map(|l| l.order_date)),
        fact_date_range: date_span(date_values(&fact_dates, "date")?.into_iter()),
        revenue_mismatched_months,
        quantity_mismatched_months,
        customer_key_collisions: duplicate_count(&customer_keys)?,
        product_key_collisions: duplicate_count(&product_keys)?,
    })
}

fn date_span(dates: impl Iterator<Item = NaiveDate>) -> Option<(NaiveDate, NaiveDate)> {
    dates.fold(None, |span, date| match span {
        None => Some((date, date)),
        Some((min, max)) => Some((min.min(date), max.max(date))),
    })
}
