//! Relation row types for every pipeline layer

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

/// Raw customer row as ingested; every field is an untyped string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCustomer {
    pub customer_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCategory {
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub category_abbreviation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawProduct {
    pub product_number: Option<String>,
    pub product_name: Option<String>,
    pub category_id: Option<String>,
    pub price: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOrder {
    pub order_id: Option<String>,
    pub order_date: Option<String>,
    pub customer_id: Option<String>,
    pub product_number: Option<String>,
    pub quantity: Option<String>,
}

/// The four raw input relations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRelations {
    pub customers: Vec<RawCustomer>,
    pub categories: Vec<RawCategory>,
    pub products: Vec<RawProduct>,
    pub orders: Vec<RawOrder>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCustomer {
    pub customer_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Lowercased, trimmed, `mailto:` stripped
    pub email: Option<String>,
    /// Digits only
    pub phone: Option<String>,
    pub city: Option<String>,
    /// Uppercased
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCategory {
    pub category_id: i64,
    pub category_name: Option<String>,
    /// Uppercased
    pub abbreviation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedProduct {
    pub product_number: String,
    pub product_name: Option<String>,
    pub category_id: i64,
    /// Strictly positive
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedOrder {
    pub order_id: i64,
    pub order_date: NaiveDate,
    pub customer_id: i64,
    pub product_number: String,
    /// Strictly positive
    pub quantity: i64,
    pub order_year_month: String,
}

/// One order line joined with its customer, product and category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSalesLine {
    pub customer_email: String,
    pub customer_city: Option<String>,
    pub order_date: NaiveDate,
    pub quantity: i64,
    pub product_name: String,
    pub unit_price: Decimal,
    pub category_name: String,
    /// `quantity * unit_price`, exact
    pub line_revenue: Decimal,
}

/// Master line plus time, bucket, customer lifecycle and tier attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedSalesLine {
    pub line: MasterSalesLine,
    pub order_year: i32,
    pub order_month: u32,
    pub order_quarter: u32,
    pub order_year_month: String,
    pub weekday_name: String,
    /// Sunday = 1 .. Saturday = 7
    pub weekday_num: u32,
    pub week_of_year: u32,
    pub price_bucket: String,
    pub first_order_date: NaiveDate,
    pub days_since_first: i64,
    pub order_sequence_number: usize,
    pub is_repeat_customer: bool,
    pub customer_lifetime_revenue: Decimal,
    pub customer_line_count: usize,
    pub customer_avg_line_value: Option<Decimal>,
    pub city_tier: String,
    pub city_revenue: Decimal,
    pub category_tier: String,
    pub category_revenue: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimDate {
    /// `YYYYMMDD`
    pub date_key: i32,
    pub date: NaiveDate,
    pub year: i32,
    pub quarter: u32,
    pub month: u32,
    pub month_name: String,
    pub day: u32,
    pub weekday_num: u32,
    pub weekday_name: String,
    pub week_of_year: u32,
    pub is_weekend: bool,
    pub year_month: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimCustomer {
    pub customer_key: i64,
    pub customer_email: String,
    pub customer_city: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimProduct {
    pub product_key: i64,
    pub product_name: String,
    pub category_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactSales {
    pub date_key: i32,
    pub customer_key: i64,
    pub product_key: i64,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub line_revenue: Decimal,
}

/// `YYYY-MM` label for a date.
pub fn year_month_label(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Quarter (1-4) of a date.
pub fn quarter_of(date: NaiveDate) -> u32 {
    (date.month() - 1) / 3 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_month_label() {
        let date = NaiveDate::from_ymd_opt(2021, 3, 7).unwrap();
        assert_eq!(year_month_label(date), "2021-03");
        assert_eq!(quarter_of(date), 1);
        assert_eq!(quarter_of(NaiveDate::from_ymd_opt(2021, 12, 31).unwrap()), 4);
    }
}
