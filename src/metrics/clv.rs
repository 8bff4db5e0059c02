//! Simple customer lifetime value over the observed window

use chrono::NaiveDate;
use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::frame::{
    count_values, date_values, decimal_values, i64_values, opt_str_values, stable_sort,
    str_values,
};
use crate::stats::safe_div;

#[derive(Debug, Clone, PartialEq)]
pub struct ClvRow {
    pub customer_key: i64,
    pub customer_email: String,
    pub customer_city: Option<String>,
    pub first_purchase: NaiveDate,
    pub last_purchase: NaiveDate,
    pub lifespan_days: i64,
    pub orders: usize,
    pub lines: usize,
    pub revenue_total: Decimal,
    pub avg_order_value: Option<f64>,
    pub margin_rate: Decimal,
    /// `revenue_total * margin_rate`
    pub clv: Decimal,
}

/// One row per customer, ordered by email. `margin_rate` lies in [0, 1],
/// so the CLV never exceeds the revenue it scales.
pub fn customer_lifetime_value(
    base: &DataFrame,
    margin_rate: Decimal,
) -> PolarsResult<Vec<ClvRow>> {
    let customers = base
        .clone()
        .lazy()
        .group_by([col("customer_email")])
        .agg([
            col("customer_key").first(),
            col("customer_city").first(),
            col("order_date").min().alias("first_purchase"),
            col("order_date").max().alias("last_purchase"),
            col("order_proxy").n_unique().alias("orders"),
            len().alias("lines"),
            col("line_revenue").sum().alias("revenue_total"),
        ])
        .sort_by_exprs([col("customer_email")], stable_sort())
        .collect()?;

    let keys = i64_values(&customers, "customer_key")?;
    let emails = str_values(&customers, "customer_email")?;
    let cities = opt_str_values(&customers, "customer_city")?;
    let firsts = date_values(&customers, "first_purchase")?;
    let lasts = date_values(&customers, "last_purchase")?;
    let orders = count_values(&customers, "orders")?;
    let lines = count_values(&customers, "lines")?;
    let revenues = decimal_values(&customers, "revenue_total")?;

    let rows = emails
        .into_iter()
        .zip(cities)
        .enumerate()
        .map(|(i, (email, city))| ClvRow {
            customer_key: keys[i],
            customer_email: email,
            customer_city: city,
            first_purchase: firsts[i],
            last_purchase: lasts[i],
            lifespan_days: (lasts[i] - firsts[i]).num_days(),
            orders: orders[i],
            lines: lines[i],
            revenue_total: revenues[i],
            avg_order_value: safe_div(revenues[i].to_f64().unwrap_or_default(), orders[i] as f64),
            margin_rate,
            clv: revenues[i] * margin_rate,
        })
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::base::base_frame;
    use crate::metrics::fixtures::{base_rows, date, sale};

    #[test]
    fn test_clv_applies_margin() {
        let rows = base_rows(&[
            sale("a@x.com", "Austin", date(2021, 1, 5), "P1", "Books", 1000, 2),
            sale("a@x.com", "Austin", date(2021, 1, 5), "P2", "Books", 500, 2),
            sale("a@x.com", "Austin", date(2021, 3, 6), "P1", "Books", 1000, 1),
            sale("b@x.com", "Boston", date(2021, 2, 1), "P1", "Books", 1000, 1),
        ]);
        let base = base_frame(&rows).unwrap();
        let clv = customer_lifetime_value(&base, Decimal::new(30, 2)).unwrap();
        assert_eq!(clv.len(), 2);

        let a = &clv[0];
        assert_eq!(a.customer_email, "a@x.com");
        assert_eq!(a.customer_city.as_deref(), Some("Austin"));
        assert_eq!(a.revenue_total, Decimal::from(40));
        assert_eq!(a.clv, Decimal::from(12));
        assert_eq!(a.orders, 2);
        assert_eq!(a.lines, 3);
        assert_eq!(a.lifespan_days, 60);
        assert_eq!(a.avg_order_value, Some(20.0));

        let total: Decimal = clv.iter().map(|c| c.revenue_total).sum();
        let expected: Decimal = rows.iter().map(|r| r.line_revenue).sum();
        assert_eq!(total, expected);
    }
}
