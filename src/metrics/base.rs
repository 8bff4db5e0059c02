//! Canonical base view: fact joined to every dimension
//!
//! Every metric view is a composition over [`BaseRow`]s; none of them
//! re-derives the fact/dimension join. Views aggregate over the
//! [`base_frame`] of those rows.

use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use rust_decimal::Decimal;

use crate::config::PriceBucketBounds;
use crate::enrich::PriceBucket;
use crate::frame::{
    count_values, date_column, decimal_column, inner_join, stable_sort, values, ROW,
};
use crate::star::StarSchema;

#[derive(Debug, Clone, PartialEq)]
pub struct BaseRow {
    pub date_key: i32,
    pub order_date: NaiveDate,
    pub year: i32,
    pub quarter: u32,
    pub month: u32,
    pub year_month: String,
    pub weekday_num: u32,
    pub weekday_name: String,
    pub week_of_year: u32,
    pub is_weekend: bool,
    pub customer_key: i64,
    pub customer_email: String,
    pub customer_city: Option<String>,
    pub product_key: i64,
    pub product_name: String,
    pub category_name: String,
    pub price_bucket: PriceBucket,
    pub price_bucket_label: String,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub line_revenue: Decimal,
}

impl BaseRow {
    /// Order surrogate: no order identifier exists, so one customer on one
    /// day counts as one order.
    pub fn order_proxy(&self) -> String {
        format!("{}|{}", self.customer_key, self.date_key)
    }

    /// Months since year zero, so consecutive months differ by one.
    pub fn month_index(&self) -> i64 {
        i64::from(self.order_date.year()) * 12 + i64::from(self.order_date.month0())
    }
}

/// Dimension keys with their row positions, first row per key.
fn dimension_index(keys: Column, position: &str) -> PolarsResult<LazyFrame> {
    let key = keys.name().clone();
    Ok(DataFrame::new(vec![keys])?
        .lazy()
        .with_row_index(position, None)
        .filter(col(key).is_first_distinct()))
}

/// Inner-join the fact relation to its dimensions, preserving fact order.
pub fn build_base_view(
    schema: &StarSchema,
    bounds: &PriceBucketBounds,
) -> PolarsResult<Vec<BaseRow>> {
    let facts = &schema.fact_sales;
    let fact_keys = DataFrame::new(vec![
        Column::new("date_key".into(), values(facts, |f| f.date_key)),
        Column::new("customer_key".into(), values(facts, |f| f.customer_key)),
        Column::new("product_key".into(), values(facts, |f| f.product_key)),
    ])?
    .lazy()
    .with_row_index(ROW, None);

    let dates = dimension_index(
        Column::new("date_key".into(), values(&schema.dim_date, |d| d.date_key)),
        "date_row",
    )?;
    let customers = dimension_index(
        Column::new("customer_key".into(), values(&schema.dim_customer, |c| c.customer_key)),
        "customer_row",
    )?;
    let products = dimension_index(
        Column::new("product_key".into(), values(&schema.dim_product, |p| p.product_key)),
        "product_row",
    )?;

    let joined = inner_join(fact_keys, dates, "date_key");
    let joined = inner_join(joined, customers, "customer_key");
    let joined = inner_join(joined, products, "product_key")
        .sort_by_exprs([col(ROW)], stable_sort())
        .collect()?;

    let fact_rows = count_values(&joined, ROW)?;
    let date_rows = count_values(&joined, "date_row")?;
    let customer_rows = count_values(&joined, "customer_row")?;
    let product_rows = count_values(&joined, "product_row")?;

    let rows = fact_rows
        .into_iter()
        .zip(date_rows)
        .zip(customer_rows)
        .zip(product_rows)
        .map(|(((f, d), c), p)| {
            let fact = &facts[f];
            let date = &schema.dim_date[d];
            let customer = &schema.dim_customer[c];
            let product = &schema.dim_product[p];
            let bucket = PriceBucket::classify(fact.unit_price, bounds);
            BaseRow {
                date_key: fact.date_key,
                order_date: date.date,
                year: date.year,
                quarter: date.quarter,
                month: date.month,
                year_month: date.year_month.clone(),
                weekday_num: date.weekday_num,
                weekday_name: date.weekday_name.clone(),
                week_of_year: date.week_of_year,
                is_weekend: date.is_weekend,
                customer_key: customer.customer_key,
                customer_email: customer.customer_email.clone(),
                customer_city: customer.customer_city.clone(),
                product_key: product.product_key,
                product_name: product.product_name.clone(),
                category_name: product.category_name.clone(),
                price_bucket: bucket,
                price_bucket_label: bucket.label(bounds),
                quantity: fact.quantity,
                unit_price: fact.unit_price,
                line_revenue: fact.line_revenue,
            }
        })
        .collect();
    Ok(rows)
}

/// The columns the metric views group over. `price_bucket` holds the
/// bucket's position in [`PriceBucket::ALL`].
pub fn base_frame(rows: &[BaseRow]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        date_column("order_date", &values(rows, |r| r.order_date))?,
        Column::new("month_index".into(), values(rows, BaseRow::month_index)),
        Column::new("year_month".into(), values(rows, |r| r.year_month.clone())),
        Column::new("weekday_num".into(), values(rows, |r| r.weekday_num)),
        Column::new("weekday_name".into(), values(rows, |r| r.weekday_name.clone())),
        Column::new("customer_key".into(), values(rows, |r| r.customer_key)),
        Column::new("customer_email".into(), values(rows, |r| r.customer_email.clone())),
        Column::new("customer_city".into(), values(rows, |r| r.customer_city.clone())),
        Column::new("product_name".into(), values(rows, |r| r.product_name.clone())),
        Column::new("category_name".into(), values(rows, |r| r.category_name.clone())),
        Column::new("price_bucket".into(), values(rows, |r| r.price_bucket.ordinal())),
        Column::new(
            "price_bucket_label".into(),
            values(rows, |r| r.price_bucket_label.clone()),
        ),
        Column::new("order_proxy".into(), values(rows, BaseRow::order_proxy)),
        Column::new("quantity".into(), values(rows, |r| r.quantity)),
        decimal_column("line_revenue", &values(rows, |r| r.line_revenue))?,
    ])
}
