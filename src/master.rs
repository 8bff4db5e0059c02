//! Master consolidation: one denormalized row per surviving order line

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use rust_decimal::Decimal;
use tracing::{info, info_span, warn};

use crate::error::PipelineError;
use crate::frame::{
    amount_order, count_values, date_column, date_values, decimal_column, decimal_values,
    i64_values, inner_join, key_marker, left_join, opt_str_values, scalar_count, stable_sort,
    stable_sort_desc, str_values, values, ROW,
};
use crate::model::{year_month_label, MasterSalesLine};
use crate::qa::{QaCheck, Stage};
use crate::staging::StagedRelations;
use crate::stats::share;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthRevenue {
    pub year_month: String,
    pub lines: usize,
    pub quantity: i64,
    pub revenue: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryDistribution {
    pub category_name: String,
    pub lines: usize,
    pub quantity: i64,
    pub revenue: Decimal,
    pub revenue_share: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterReport {
    pub staged_orders: usize,
    /// Inner-join cardinality counted independently of the join itself
    pub expected_rows: usize,
    pub joined_rows: usize,
    pub master_rows: usize,
    /// Joined rows excluded by null guards, by missing field
    pub null_guarded: BTreeMap<&'static str, usize>,
    /// Lines whose revenue, or whose contribution to the running quantity or
    /// revenue totals, does not fit the exact numeric types
    pub overflow_dropped: BTreeMap<&'static str, usize>,
    pub null_cities: usize,
    pub months: Vec<MonthRevenue>,
    /// Calendar months inside the observed span with no order lines
    pub missing_months: Vec<String>,
    pub categories: Vec<CategoryDistribution>,
    /// Most recent lines, newest first
    pub sample: Vec<MasterSalesLine>,
}

impl MasterReport {
    pub fn qa_checks(&self) -> Vec<QaCheck> {
        let mut checks = vec![
            QaCheck::equals(
                Stage::Master,
                "master.preflight_cardinality",
                self.joined_rows,
                self.expected_rows,
            ),
            QaCheck::loss(
                Stage::Master,
                "master.unresolved_lines",
                self.staged_orders - self.joined_rows,
            ),
        ];
        for (field, count) in &self.null_guarded {
            checks.push(QaCheck::loss(Stage::Master, format!("master.null_guard.{field}"), *count));
        }
        for (reason, count) in &self.overflow_dropped {
            checks.push(QaCheck::loss(Stage::Master, format!("master.dropped.{reason}"), *count));
        }
        checks.push(QaCheck::loss(Stage::Master, "master.null_city", self.null_cities));
        checks.push(
            QaCheck::loss(Stage::Master, "master.missing_months", self.missing_months.len())
                .with_detail(self.missing_months.join(",")),
        );
        checks
    }
}

/// Join staged orders with customers, products and categories.
///
/// Fails with [`PipelineError::RowCountMismatch`] when the joined row count
/// disagrees with the independently counted cardinality, or with the
/// configured literal expectation.
pub fn build_master(
    staged: &StagedRelations,
    expected_master_rows: Option<usize>,
    spot_sample_size: usize,
) -> crate::Result<(Vec<MasterSalesLine>, MasterReport)> {
    let _span = info_span!("master_consolidator").entered();

    let relations = StagedFrames::new(staged)?;
    let expected_rows = join_cardinality(&relations)?;

    let orders = relations.orders.with_row_index(ROW, None);
    let joined = inner_join(orders, relations.customers, "customer_id");
    let joined = inner_join(joined, relations.products, "product_number");
    let joined = inner_join(joined, relations.categories, "category_id")
        .sort_by_exprs([col(ROW)], stable_sort())
        .collect()?;

    if joined.height() != expected_rows {
        return Err(PipelineError::RowCountMismatch {
            stage: "master".to_string(),
            expected: expected_rows,
            actual: joined.height(),
        }
        .into());
    }

    let null_guarded = null_guard_counts(&joined)?;
    let kept = joined
        .clone()
        .lazy()
        .filter(
            col("customer_email")
                .is_not_null()
                .and(col("product_name").is_not_null())
                .and(col("category_name").is_not_null()),
        )
        .collect()?;
    let (lines, overflow_dropped) = master_lines(&kept)?;

    if let Some(expected) = expected_master_rows {
        if lines.len() != expected {
            return Err(PipelineError::RowCountMismatch {
                stage: "master".to_string(),
                expected,
                actual: lines.len(),
            }
            .into());
        }
    }

    let sales = sales_frame(&lines)?;
    let months = monthly_revenue_of(&sales)?;
    let report = MasterReport {
        staged_orders: staged.orders.len(),
        expected_rows,
        joined_rows: joined.height(),
        master_rows: lines.len(),
        null_cities: lines.iter().filter(|l| l.customer_city.is_none()).count(),
        missing_months: missing_months(&months),
        categories: category_distribution(&sales, &months)?,
        sample: spot_sample(&sales, &lines, spot_sample_size)?,
        months,
        null_guarded,
        overflow_dropped,
    };

    if !report.missing_months.is_empty() {
        warn!(missing = ?report.missing_months, "gaps in monthly revenue sequence");
    }
    if !report.overflow_dropped.is_empty() {
        warn!(dropped = ?report.overflow_dropped, "lines dropped on numeric overflow");
    }
    info!(
        staged_orders = report.staged_orders,
        master_rows = report.master_rows,
        "master sales built"
    );
    Ok((lines, report))
}

/// The staged relations as lazy frames, keyed for the master joins.
struct StagedFrames {
    orders: LazyFrame,
    customers: LazyFrame,
    products: LazyFrame,
    categories: LazyFrame,
}

impl StagedFrames {
    fn new(staged: &StagedRelations) -> PolarsResult<Self> {
        let orders = &staged.orders;
        let customers = &staged.customers;
        let products = &staged.products;
        let categories = &staged.categories;
        let product_numbers = values(products, |p| p.product_number.clone());
        let category_names = values(categories, |c| c.category_name.clone());
        Ok(Self {
            orders: DataFrame::new(vec![
                Column::new("customer_id".into(), values(orders, |o| o.customer_id)),
                Column::new("product_number".into(), values(orders, |o| o.product_number.clone())),
                date_column("order_date", &values(orders, |o| o.order_date))?,
                Column::new("quantity".into(), values(orders, |o| o.quantity)),
            ])?
            .lazy(),
            customers: DataFrame::new(vec![
                Column::new("customer_id".into(), values(customers, |c| c.customer_id)),
                Column::new("customer_email".into(), values(customers, |c| c.email.clone())),
                Column::new("customer_city".into(), values(customers, |c| c.city.clone())),
            ])?
            .lazy(),
            products: DataFrame::new(vec![
                Column::new("product_number".into(), product_numbers),
                Column::new("product_name".into(), values(products, |p| p.product_name.clone())),
                Column::new("category_id".into(), values(products, |p| p.category_id)),
                decimal_column("unit_price", &values(products, |p| p.price))?,
            ])?
            .lazy(),
            categories: DataFrame::new(vec![
                Column::new("category_id".into(), values(categories, |c| c.category_id)),
                Column::new("category_name".into(), category_names),
            ])?
            .lazy(),
        })
    }
}

/// Count orders whose customer, product and product category all resolve,
/// as membership tests rather than the join itself.
fn join_cardinality(relations: &StagedFrames) -> PolarsResult<usize> {
    let resolvable_products = inner_join(
        relations.products.clone().select([col("product_number"), col("category_id")]),
        key_marker(relations.categories.clone(), "category_id", "category_resolves"),
        "category_id",
    );
    let counted = left_join(
        left_join(
            relations.orders.clone(),
            key_marker(relations.customers.clone(), "customer_id", "customer_resolves"),
            "customer_id",
        ),
        key_marker(resolvable_products, "product_number", "product_resolves"),
        "product_number",
    )
    .filter(
        col("customer_resolves")
            .is_not_null()
            .and(col("product_resolves").is_not_null()),
    )
    .select([len().alias("rows")])
    .collect()?;
    scalar_count(&counted, "rows")
}

/// Joined rows excluded per missing field. The guards cascade: a row is
/// counted under the first field it lacks.
fn null_guard_counts(joined: &DataFrame) -> PolarsResult<BTreeMap<&'static str, usize>> {
    let has_email = col("customer_email").is_not_null();
    let has_product = col("product_name").is_not_null();
    let counts = joined
        .clone()
        .lazy()
        .select([
            col("customer_email").is_null().sum().alias("customer_email"),
            has_email
                .clone()
                .and(col("product_name").is_null())
                .sum()
                .alias("product_name"),
            has_email
                .and(has_product)
                .and(col("category_name").is_null())
                .sum()
                .alias("category_name"),
        ])
        .collect()?;

    let mut guarded = BTreeMap::new();
    for field in ["customer_email", "product_name", "category_name"] {
        let count = scalar_count(&counts, field)?;
        if count > 0 {
            guarded.insert(field, count);
        }
    }
    Ok(guarded)
}

/// Typed master lines from the guarded join. Revenue is exact; a line whose
/// revenue or running totals would overflow is dropped and counted, which
/// keeps every downstream sum in range.
fn master_lines(
    kept: &DataFrame,
) -> PolarsResult<(Vec<MasterSalesLine>, BTreeMap<&'static str, usize>)> {
    let emails = str_values(kept, "customer_email")?;
    let cities = opt_str_values(kept, "customer_city")?;
    let dates = date_values(kept, "order_date")?;
    let quantities = i64_values(kept, "quantity")?;
    let products = str_values(kept, "product_name")?;
    let prices = decimal_values(kept, "unit_price")?;
    let categories = str_values(kept, "category_name")?;

    let mut dropped: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut total_quantity: i64 = 0;
    let mut total_revenue = Decimal::ZERO;
    let mut lines = Vec::with_capacity(kept.height());
    let columns = emails.into_iter().zip(cities).zip(dates).zip(quantities);
    let columns = columns.zip(products).zip(prices).zip(categories);
    for ((((((email, city), order_date), quantity), product), price), category) in columns {
        let revenue = Decimal::from(quantity)
            .checked_mul(price)
            .and_then(|line| total_revenue.checked_add(line).map(|total| (line, total)));
        let Some((line_revenue, revenue_total)) = revenue else {
            *dropped.entry("revenue_overflow").or_insert(0) += 1;
            continue;
        };
        let Some(quantity_total) = total_quantity.checked_add(quantity) else {
            *dropped.entry("quantity_overflow").or_insert(0) += 1;
            continue;
        };
        total_revenue = revenue_total;
        total_quantity = quantity_total;

        lines.push(MasterSalesLine {
            customer_email: email,
            customer_city: city,
            order_date,
            quantity,
            product_name: product,
            unit_price: price,
            category_name: category,
            line_revenue,
        });
    }
    Ok((lines, dropped))
}

/// Master lines as a frame, money kept exact.
pub fn sales_frame(lines: &[MasterSalesLine]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Column::new("customer_email".into(), values(lines, |l| l.customer_email.clone())),
        Column::new("customer_city".into(), values(lines, |l| l.customer_city.clone())),
        date_column("order_date", &values(lines, |l| l.order_date))?,
        Column::new("year_month".into(), values(lines, |l| year_month_label(l.order_date))),
        Column::new("quantity".into(), values(lines, |l| l.quantity)),
        Column::new("product_name".into(), values(lines, |l| l.product_name.clone())),
        decimal_column("unit_price", &values(lines, |l| l.unit_price))?,
        Column::new("category_name".into(), values(lines, |l| l.category_name.clone())),
        decimal_column("line_revenue", &values(lines, |l| l.line_revenue))?,
    ])
}

pub fn monthly_revenue(lines: &[MasterSalesLine]) -> PolarsResult<Vec<MonthRevenue>> {
    monthly_revenue_of(&sales_frame(lines)?)
}

fn monthly_revenue_of(sales: &DataFrame) -> PolarsResult<Vec<MonthRevenue>> {
    let months = sales
        .clone()
        .lazy()
        .group_by([col("year_month")])
        .agg([
            len().alias("lines"),
            col("quantity").sum().alias("quantity"),
            col("line_revenue").sum().alias("revenue"),
        ])
        .sort_by_exprs([col("year_month")], stable_sort())
        .collect()?;

    let labels = str_values(&months, "year_month")?;
    let lines = count_values(&months, "lines")?;
    let quantities = i64_values(&months, "quantity")?;
    let revenues = decimal_values(&months, "revenue")?;
    Ok(labels
        .into_iter()
        .zip(lines)
        .zip(quantities.into_iter().zip(revenues))
        .map(|((year_month, lines), (quantity, revenue))| MonthRevenue {
            year_month,
            lines,
            quantity,
            revenue,
        })
        .collect())
}

/// Months between the first and last observed month with no lines.
fn missing_months(months: &[MonthRevenue]) -> Vec<String> {
    let present: HashSet<&str> = months.iter().map(|m| m.year_month.as_str()).collect();
    let parse = |label: &str| -> Option<(i32, u32)> {
        let date = NaiveDate::parse_from_str(&format!("{label}-01"), "%Y-%m-%d").ok()?;
        Some((date.year(), date.month()))
    };
    let (Some(first), Some(last)) = (
        months.first().and_then(|m| parse(&m.year_month)),
        months.last().and_then(|m| parse(&m.year_month)),
    ) else {
        return Vec::new();
    };

    let mut missing = Vec::new();
    let (mut year, mut month) = first;
    while (year, month) < last {
        month += 1;
        if month > 12 {
            month = 1;
            year += 1;
        }
        let label = format!("{year:04}-{month:02}");
        if !present.contains(label.as_str()) {
            missing.push(label);
        }
    }
    missing
}

fn category_distribution(
    sales: &DataFrame,
    months: &[MonthRevenue],
) -> PolarsResult<Vec<CategoryDistribution>> {
    let total: Decimal = months.iter().map(|m| m.revenue).sum();
    let categories = sales
        .clone()
        .lazy()
        .group_by([col("category_name")])
        .agg([
            len().alias("lines"),
            col("quantity").sum().alias("quantity"),
            col("line_revenue").sum().alias("revenue"),
        ])
        .sort_by_exprs(
            [amount_order("revenue"), col("category_name")],
            stable_sort_desc([true, false]),
        )
        .collect()?;

    let names = str_values(&categories, "category_name")?;
    let lines = count_values(&categories, "lines")?;
    let quantities = i64_values(&categories, "quantity")?;
    let revenues = decimal_values(&categories, "revenue")?;
    Ok(names
        .into_iter()
        .zip(lines)
        .zip(quantities.into_iter().zip(revenues))
        .map(|((category_name, lines), (quantity, revenue))| CategoryDistribution {
            category_name,
            lines,
            quantity,
            revenue,
            revenue_share: share(revenue, total),
        })
        .collect())
}

fn spot_sample(
    sales: &DataFrame,
    lines: &[MasterSalesLine],
    size: usize,
) -> PolarsResult<Vec<MasterSalesLine>> {
    let newest = sales
        .clone()
        .lazy()
        .with_row_index(ROW, None)
        .sort_by_exprs(
            [col("order_date"), col("product_name"), col("customer_email")],
            stable_sort_desc([true, false, false]),
        )
        .limit(IdxSize::try_from(size).unwrap_or(IdxSize::MAX))
        .select([col(ROW)])
        .collect()?;
    Ok(count_values(&newest, ROW)?
        .into_iter()
        .filter_map(|row| lines.get(row).cloned())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StagedCategory, StagedCustomer, StagedOrder, StagedProduct};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn staged_fixture() -> StagedRelations {
        let customer = |id: i64, email: Option<&str>, city: &str| StagedCustomer {
            customer_id: id,
            first_name: None,
            last_name: None,
            email: email.map(str::to_string),
            phone: None,
            city: Some(city.to_string()),
            state: None,
            zip: None,
        };
        let order = |id: i64, d: NaiveDate, customer_id: i64, product: &str, quantity: i64| {
            StagedOrder {
                order_id: id,
                order_date: d,
                customer_id,
                product_number: product.to_string(),
                quantity,
                order_year_month: year_month_label(d),
            }
        };
        StagedRelations {
            customers: vec![customer(1, Some("a@x.com"), "Austin"), customer(2, None, "Dallas")],
            categories: vec![StagedCategory {
                category_id: 10,
                category_name: Some("Books".to_string()),
                abbreviation: None,
            }],
            products: vec![
                StagedProduct {
                    product_number: "P1".to_string(),
                    product_name: Some("Atlas".to_string()),
                    category_id: 10,
                    price: Decimal::new(1999, 2),
                },
                StagedProduct {
                    product_number: "P2".to_string(),
                    product_name: Some("Orphan".to_string()),
                    category_id: 99,
                    price: Decimal::new(500, 2),
                },
            ],
            orders: vec![
                order(1, date(2021, 1, 5), 1, "P1", 3),
                order(2, date(2021, 3, 9), 1, "P1", 1),
                order(3, date(2021, 3, 10), 2, "P1", 1),
                order(4, date(2021, 3, 11), 1, "P2", 1),
            ],
        }
    }

    #[test]
    fn test_line_revenue_is_exact() {
        let (lines, report) = build_master(&staged_fixture(), None, 5).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_revenue, Decimal::new(5997, 2));
        for line in &lines {
            assert_eq!(line.line_revenue, Decimal::from(line.quantity) * line.unit_price);
        }
        assert_eq!(report.expected_rows, 3);
        assert_eq!(report.joined_rows, 3);
        assert_eq!(report.null_guarded.get("customer_email"), Some(&1));
    }

    #[test]
    fn test_monthly_continuity_reports_gaps() {
        let (_, report) = build_master(&staged_fixture(), None, 5).unwrap();
        assert_eq!(report.months.len(), 2);
        assert_eq!(report.missing_months, vec!["2021-02".to_string()]);
        assert_eq!(report.sample[0].order_date, date(2021, 3, 9));
        assert_eq!(report.categories[0].revenue_share, Some(1.0));
    }

    #[test]
    fn test_literal_row_gate() {
        let err = build_master(&staged_fixture(), Some(5), 5).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::RowCountMismatch { expected: 5, actual: 2, .. })
        ));
        assert!(build_master(&staged_fixture(), Some(2), 5).is_ok());
    }

    #[test]
    fn test_missing_months_across_year_boundary() {
        let month = |label: &str| MonthRevenue {
            year_month: label.to_string(),
            lines: 1,
            quantity: 1,
            revenue: Decimal::ONE,
        };
        let gaps = missing_months(&[month("2020-11"), month("2021-02")]);
        assert_eq!(gaps, vec!["2020-12".to_string(), "2021-01".to_string()]);
        assert!(missing_months(&[]).is_empty());
    }

    #[test]
    fn test_line_revenue_overflow_is_dropped_and_counted() {
        let mut staged = staged_fixture();
        staged.products[0].price = Decimal::from(100_000_000_000i64);
        staged.orders[0].quantity = i64::MAX;

        let (lines, report) = build_master(&staged, None, 5).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(report.overflow_dropped.get("revenue_overflow"), Some(&1));
        assert_eq!(report.months.len(), 1);
        let check = report
            .qa_checks()
            .into_iter()
            .find(|c| c.check == "master.dropped.revenue_overflow")
            .unwrap();
        assert!(!check.passed());
    }

    #[test]
    fn test_quantity_total_overflow_is_dropped_and_counted() {
        let mut staged = staged_fixture();
        staged.products[0].price = Decimal::ONE;
        staged.orders[0].quantity = 5_000_000_000_000_000_000;
        staged.orders[1].quantity = 5_000_000_000_000_000_000;

        let (lines, report) = build_master(&staged, None, 5).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(report.overflow_dropped.get("quantity_overflow"), Some(&1));
        let total: i64 = report.months.iter().map(|m| m.quantity).sum();
        assert_eq!(total, 5_000_000_000_000_000_000);
    }
}
