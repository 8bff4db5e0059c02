//! Grouped KPI rollups over the base view

use chrono::NaiveDate;
use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::enrich::PriceBucket;
use crate::frame::{
    count_values, date_values, decimal_values, i64_values, opt_str_values, stable_sort,
    str_values, u32_values,
};
use crate::stats::safe_div;

/// Sums and ratios for one group of base rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Rollup<K> {
    pub key: K,
    pub revenue: Decimal,
    pub quantity: i64,
    pub lines: usize,
    /// Distinct customer-day order proxies
    pub orders: usize,
    pub customers: usize,
    /// Average selling price: revenue / quantity
    pub asp: Option<f64>,
    /// Average order value: revenue / order proxies
    pub aov: Option<f64>,
}

/// Group the base frame by `keys`, ordered by key. `read_keys` reads the
/// group key of every output row back from the grouped frame.
pub fn rollup_by<K>(
    base: &DataFrame,
    keys: &[&str],
    read_keys: impl FnOnce(&DataFrame) -> PolarsResult<Vec<K>>,
) -> PolarsResult<Vec<Rollup<K>>> {
    let by: Vec<Expr> = keys.iter().map(|k| col(*k)).collect();
    let groups = base
        .clone()
        .lazy()
        .group_by(by.clone())
        .agg([
            col("line_revenue").sum().alias("revenue"),
            col("quantity").sum().alias("quantity"),
            len().alias("lines"),
            col("order_proxy").n_unique().alias("orders"),
            col("customer_key").n_unique().alias("customers"),
        ])
        .sort_by_exprs(by, stable_sort())
        .collect()?;

    let revenues = decimal_values(&groups, "revenue")?;
    let quantities = i64_values(&groups, "quantity")?;
    let lines = count_values(&groups, "lines")?;
    let orders = count_values(&groups, "orders")?;
    let customers = count_values(&groups, "customers")?;

    let rollups = read_keys(&groups)?
        .into_iter()
        .enumerate()
        .map(|(i, key)| {
            let revenue = revenues[i].to_f64().unwrap_or_default();
            Rollup {
                key,
                revenue: revenues[i],
                quantity: quantities[i],
                lines: lines[i],
                orders: orders[i],
                customers: customers[i],
                asp: safe_div(revenue, quantities[i] as f64),
                aov: safe_div(revenue, orders[i] as f64),
            }
        })
        .collect();
    Ok(rollups)
}

pub fn daily(base: &DataFrame) -> PolarsResult<Vec<Rollup<NaiveDate>>> {
    rollup_by(base, &["order_date"], |g| date_values(g, "order_date"))
}

pub fn monthly(base: &DataFrame) -> PolarsResult<Vec<Rollup<String>>> {
    rollup_by(base, &["year_month"], |g| str_values(g, "year_month"))
}

/// Keyed by (weekday number, weekday name), Sunday first.
pub fn by_weekday(base: &DataFrame) -> PolarsResult<Vec<Rollup<(u32, String)>>> {
    rollup_by(base, &["weekday_num", "weekday_name"], |g| {
        let names = str_values(g, "weekday_name")?;
        Ok(u32_values(g, "weekday_num")?.into_iter().zip(names).collect())
    })
}

/// Customers without a city group together, first.
pub fn by_city(base: &DataFrame) -> PolarsResult<Vec<Rollup<Option<String>>>> {
    rollup_by(base, &["customer_city"], |g| opt_str_values(g, "customer_city"))
}

pub fn by_category(base: &DataFrame) -> PolarsResult<Vec<Rollup<String>>> {
    rollup_by(base, &["category_name"], |g| str_values(g, "category_name"))
}

/// Keyed by (product name, category name).
pub fn by_product(base: &DataFrame) -> PolarsResult<Vec<Rollup<(String, String)>>> {
    rollup_by(base, &["product_name", "category_name"], |g| {
        let categories = str_values(g, "category_name")?;
        Ok(str_values(g, "product_name")?.into_iter().zip(categories).collect())
    })
}

/// Keyed by bucket, lowest prices first.
pub fn by_price_bucket(base: &DataFrame) -> PolarsResult<Vec<Rollup<(PriceBucket, String)>>> {
    rollup_by(base, &["price_bucket", "price_bucket_label"], |g| {
        let labels = str_values(g, "price_bucket_label")?;
        u32_values(g, "price_bucket")?
            .into_iter()
            .zip(labels)
            .map(|(ordinal, label)| {
                let bucket = PriceBucket::from_ordinal(ordinal).ok_or_else(|| {
                    PolarsError::ComputeError(format!("no price bucket {ordinal}").into())
                })?;
                Ok((bucket, label))
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::base::base_frame;
    use crate::metrics::fixtures::{base, date, sale};

    #[test]
    fn test_monthly_rollup_ratios() {
        let base = base(&[
            sale("a@x.com", "Austin", date(2021, 1, 5), "P1", "Books", 1000, 2),
            sale("a@x.com", "Austin", date(2021, 1, 5), "P2", "Books", 500, 1),
            sale("b@x.com", "Boston", date(2021, 1, 9), "P1", "Books", 1000, 1),
            sale("b@x.com", "Boston", date(2021, 2, 1), "P1", "Books", 1000, 3),
        ]);
        let months = monthly(&base).unwrap();
        assert_eq!(months.len(), 2);

        let january = &months[0];
        assert_eq!(january.key, "2021-01");
        assert_eq!(january.revenue, Decimal::from(35));
        assert_eq!(january.quantity, 4);
        assert_eq!(january.lines, 3);
        // a@x.com's two same-day lines are one order
        assert_eq!(january.orders, 2);
        assert_eq!(january.customers, 2);
        assert_eq!(january.asp, Some(8.75));
        assert_eq!(january.aov, Some(17.5));
    }

    #[test]
    fn test_bucket_rollup_is_price_ordered() {
        let base = base(&[
            sale("a@x.com", "Austin", date(2021, 1, 5), "P1", "Books", 15000, 1),
            sale("a@x.com", "Austin", date(2021, 1, 5), "P2", "Books", 999, 1),
            sale("a@x.com", "Austin", date(2021, 1, 5), "P3", "Books", 2000, 1),
        ]);
        let labels: Vec<String> =
            by_price_bucket(&base).unwrap().into_iter().map(|r| r.key.1).collect();
        assert_eq!(labels, vec!["Under 20", "20–49.99", "100+"]);
    }

    #[test]
    fn test_weekday_rollup_starts_sunday() {
        let base = base(&[
            sale("a@x.com", "Austin", date(2021, 1, 9), "P1", "Books", 1000, 1),
            sale("a@x.com", "Austin", date(2021, 1, 3), "P1", "Books", 1000, 1),
        ]);
        let keys: Vec<(u32, String)> =
            by_weekday(&base).unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![(1, "Sunday".to_string()), (7, "Saturday".to_string())]);
    }

    #[test]
    fn test_empty_base_has_no_rollups() {
        let base = base_frame(&[]).unwrap();
        assert!(daily(&base).unwrap().is_empty());
        assert!(by_city(&base).unwrap().is_empty());
    }
}
