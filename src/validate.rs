//! Raw relation profiling
//!
//! Read-only diagnostics over the raw extracts. Nothing here fails: every
//! check is a descriptive count, even when it reveals zero usable rows.

use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, info_span, warn};

use crate::cast::{has_padding, is_valid_email, parse_date, parse_int, parse_price};
use crate::frame::{count_values, resolves, scalar_count, stable_sort_desc, str_values};
use crate::model::RawRelations;
use crate::qa::{QaCheck, Stage};
use crate::stats::Summary;

/// Frequency label for a missing value.
const NULL_LABEL: &str = "<null>";

/// How a raw column is expected to cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Decimal,
    Date,
    Email,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Text => "text",
            ColumnKind::Integer => "integer",
            ColumnKind::Decimal => "decimal",
            ColumnKind::Date => "date",
            ColumnKind::Email => "email",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnProfile {
    pub relation: &'static str,
    pub column: &'static str,
    pub kind: ColumnKind,
    pub rows: usize,
    /// Null or blank after trimming
    pub nulls: usize,
    pub whitespace_polluted: usize,
    /// Present but failing the column's cast or format rule
    pub format_violations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyProfile {
    pub relation: &'static str,
    pub key: &'static str,
    pub rows: usize,
    pub null_keys: usize,
    pub distinct_keys: usize,
    /// Rows beyond the first for every repeated key
    pub duplicate_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanProfile {
    pub relation: &'static str,
    pub column: &'static str,
    pub references: &'static str,
    pub null_references: usize,
    pub orphans: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumericProfile {
    pub relation: &'static str,
    pub column: &'static str,
    pub summary: Option<Summary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrequencyEntry {
    pub relation: &'static str,
    pub column: &'static str,
    pub rank: usize,
    pub value: String,
    pub count: usize,
}

/// Everything the raw validator observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawProfile {
    pub row_counts: Vec<(&'static str, usize)>,
    pub columns: Vec<ColumnProfile>,
    pub keys: Vec<KeyProfile>,
    pub orphans: Vec<OrphanProfile>,
    pub numeric: Vec<NumericProfile>,
    pub frequencies: Vec<FrequencyEntry>,
}

impl RawProfile {
    pub fn row_count(&self, relation: &str) -> Option<usize> {
        self.row_counts
            .iter()
            .find(|(name, _)| *name == relation)
            .map(|(_, n)| *n)
    }

    pub fn column(&self, relation: &str, column: &str) -> Option<&ColumnProfile> {
        self.columns
            .iter()
            .find(|c| c.relation == relation && c.column == column)
    }

    pub fn key(&self, relation: &str) -> Option<&KeyProfile> {
        self.keys.iter().find(|k| k.relation == relation)
    }

    pub fn orphan(&self, relation: &str, column: &str) -> Option<&OrphanProfile> {
        self.orphans
            .iter()
            .find(|o| o.relation == relation && o.column == column)
    }

    /// Descriptive QA rows: duplicates and orphans surface as warnings.
    pub fn qa_checks(&self) -> Vec<QaCheck> {
        let keys = self.keys.iter().map(|k| {
            QaCheck::loss(
                Stage::Raw,
                format!("{}.{}.duplicate_rows", k.relation, k.key),
                k.duplicate_rows,
            )
        });
        let orphans = self.orphans.iter().map(|o| {
            QaCheck::loss(
                Stage::Raw,
                format!("{}.{}.orphans", o.relation, o.column),
                o.orphans,
            )
            .with_detail(format!("references {}", o.references))
        });
        keys.chain(orphans).collect()
    }
}

/// Non-blank values of one raw column.
fn texts<'a, T>(
    rows: &'a [T],
    field: impl Fn(&'a T) -> &'a Option<String>,
) -> Vec<Option<&'a str>> {
    rows.iter().map(|row| field(row).as_deref()).collect()
}

type RawColumn<'a> = (&'static str, ColumnKind, Vec<Option<&'a str>>);

/// Profile all raw relations.
pub fn profile_raw(
    raw: &RawRelations,
    date_formats: &[String],
    top_n: usize,
) -> PolarsResult<RawProfile> {
    let _span = info_span!("raw_validator").entered();
    let mut profile = RawProfile {
        row_counts: vec![
            ("customers", raw.customers.len()),
            ("categories", raw.categories.len()),
            ("products", raw.products.len()),
            ("orders", raw.orders.len()),
        ],
        ..Default::default()
    };

    let customers = &raw.customers;
    let customer_columns: [RawColumn<'_>; 8] = [
        ("customer_id", ColumnKind::Integer, texts(customers, |c| &c.customer_id)),
        ("first_name", ColumnKind::Text, texts(customers, |c| &c.first_name)),
        ("last_name", ColumnKind::Text, texts(customers, |c| &c.last_name)),
        ("email", ColumnKind::Email, texts(customers, |c| &c.email)),
        ("phone", ColumnKind::Text, texts(customers, |c| &c.phone)),
        ("city", ColumnKind::Text, texts(customers, |c| &c.city)),
        ("state", ColumnKind::Text, texts(customers, |c| &c.state)),
        ("zip", ColumnKind::Text, texts(customers, |c| &c.zip)),
    ];
    for (column, kind, values) in &customer_columns {
        let profiled = profile_column("customers", *column, *kind, values, date_formats);
        profile.columns.push(profiled);
    }
    profile.keys.push(profile_key("customers", "customer_id", &customer_columns[0].2)?);
    profile.frequencies.extend(top_values("customers", "city", &customer_columns[5].2, top_n)?);
    profile.frequencies.extend(top_values("customers", "state", &customer_columns[6].2, top_n)?);

    let categories = &raw.categories;
    let category_columns: [RawColumn<'_>; 3] = [
        ("category_id", ColumnKind::Integer, texts(categories, |c| &c.category_id)),
        ("category_name", ColumnKind::Text, texts(categories, |c| &c.category_name)),
        (
            "category_abbreviation",
            ColumnKind::Text,
            texts(categories, |c| &c.category_abbreviation),
        ),
    ];
    for (column, kind, values) in &category_columns {
        let profiled = profile_column("categories", *column, *kind, values, date_formats);
        profile.columns.push(profiled);
    }
    profile.keys.push(profile_key("categories", "category_id", &category_columns[0].2)?);

    let products = &raw.products;
    let product_columns: [RawColumn<'_>; 4] = [
        ("product_number", ColumnKind::Text, texts(products, |p| &p.product_number)),
        ("product_name", ColumnKind::Text, texts(products, |p| &p.product_name)),
        ("category_id", ColumnKind::Integer, texts(products, |p| &p.category_id)),
        ("price", ColumnKind::Decimal, texts(products, |p| &p.price)),
    ];
    for (column, kind, values) in &product_columns {
        let profiled = profile_column("products", *column, *kind, values, date_formats);
        profile.columns.push(profiled);
    }
    profile.keys.push(profile_key("products", "product_number", &product_columns[0].2)?);
    profile.orphans.push(profile_orphans(
        "products",
        "category_id",
        "categories.category_id",
        &product_columns[2].2,
        &category_columns[0].2,
    )?);
    profile.numeric.push(profile_numeric(
        "products",
        "price",
        &product_columns[3].2,
        ColumnKind::Decimal,
    )?);
    profile.frequencies.extend(top_values(
        "products",
        "category_id",
        &product_columns[2].2,
        top_n,
    )?);

    let orders = &raw.orders;
    let order_columns: [RawColumn<'_>; 5] = [
        ("order_id", ColumnKind::Integer, texts(orders, |o| &o.order_id)),
        ("order_date", ColumnKind::Date, texts(orders, |o| &o.order_date)),
        ("customer_id", ColumnKind::Integer, texts(orders, |o| &o.customer_id)),
        ("product_number", ColumnKind::Text, texts(orders, |o| &o.product_number)),
        ("quantity", ColumnKind::Integer, texts(orders, |o| &o.quantity)),
    ];
    for (column, kind, values) in &order_columns {
        let profiled = profile_column("orders", *column, *kind, values, date_formats);
        profile.columns.push(profiled);
    }
    profile.keys.push(profile_key("orders", "order_id", &order_columns[0].2)?);
    profile.orphans.push(profile_orphans(
        "orders",
        "customer_id",
        "customers.customer_id",
        &order_columns[2].2,
        &customer_columns[0].2,
    )?);
    profile.orphans.push(profile_orphans(
        "orders",
        "product_number",
        "products.product_number",
        &order_columns[3].2,
        &product_columns[0].2,
    )?);
    profile.numeric.push(profile_numeric(
        "orders",
        "quantity",
        &order_columns[4].2,
        ColumnKind::Integer,
    )?);
    profile.frequencies.extend(top_values(
        "orders",
        "product_number",
        &order_columns[3].2,
        top_n,
    )?);

    for key in profile.keys.iter().filter(|k| k.duplicate_rows > 0) {
        warn!(
            relation = key.relation,
            key = key.key,
            duplicates = key.duplicate_rows,
            "raw duplicate keys"
        );
    }
    for orphan in profile.orphans.iter().filter(|o| o.orphans > 0) {
        warn!(
            relation = orphan.relation,
            column = orphan.column,
            orphans = orphan.orphans,
            "raw orphaned references"
        );
    }
    info!(
        customers = raw.customers.len(),
        categories = raw.categories.len(),
        products = raw.products.len(),
        orders = raw.orders.len(),
        "raw profile complete"
    );
    Ok(profile)
}

fn profile_column(
    relation: &'static str,
    column: &'static str,
    kind: ColumnKind,
    values: &[Option<&str>],
    date_formats: &[String],
) -> ColumnProfile {
    let mut nulls = 0;
    let mut whitespace_polluted = 0;
    let mut format_violations = 0;

    for value in values {
        let Some(raw) = value.filter(|v| !v.trim().is_empty()) else {
            nulls += 1;
            continue;
        };
        if has_padding(raw) {
            whitespace_polluted += 1;
        }
        let valid = match kind {
            ColumnKind::Text => true,
            ColumnKind::Integer => parse_int(Some(raw)).is_some(),
            ColumnKind::Decimal => parse_price(Some(raw)).is_some(),
            ColumnKind::Date => parse_date(Some(raw), date_formats).is_some(),
            ColumnKind::Email => is_valid_email(raw.trim()),
        };
        if !valid {
            format_violations += 1;
        }
    }

    ColumnProfile {
        relation,
        column,
        kind,
        rows: values.len(),
        nulls,
        whitespace_polluted,
        format_violations,
    }
}

/// Trimmed values as a string column; blanks become nulls.
fn trimmed(name: &str, values: &[Option<&str>]) -> Column {
    let values: Vec<Option<&str>> = values
        .iter()
        .map(|v| v.map(str::trim).filter(|v| !v.is_empty()))
        .collect();
    Column::new(name.into(), values)
}

fn profile_key(
    relation: &'static str,
    key: &'static str,
    values: &[Option<&str>],
) -> PolarsResult<KeyProfile> {
    let counts = DataFrame::new(vec![trimmed(key, values)])?
        .lazy()
        .select([
            col(key).is_null().sum().alias("null_keys"),
            col(key).drop_nulls().n_unique().alias("distinct_keys"),
        ])
        .collect()?;
    let null_keys = scalar_count(&counts, "null_keys")?;
    let distinct_keys = scalar_count(&counts, "distinct_keys")?;

    Ok(KeyProfile {
        relation,
        key,
        rows: values.len(),
        null_keys,
        distinct_keys,
        duplicate_rows: values.len() - null_keys - distinct_keys,
    })
}

/// Left-join the referencing column against the referenced keys and count
/// the rows that find no match.
fn profile_orphans(
    relation: &'static str,
    column: &'static str,
    references: &'static str,
    values: &[Option<&str>],
    referenced: &[Option<&str>],
) -> PolarsResult<OrphanProfile> {
    let lookups = trimmed(column, values);
    let null_references = lookups.null_count();
    let found = resolves(lookups, trimmed(references, referenced))?;

    Ok(OrphanProfile {
        relation,
        column,
        references,
        null_references,
        orphans: found.iter().filter(|f| !**f).count() - null_references,
    })
}

fn profile_numeric(
    relation: &'static str,
    column: &'static str,
    values: &[Option<&str>],
    kind: ColumnKind,
) -> PolarsResult<NumericProfile> {
    let numbers: Vec<f64> = values
        .iter()
        .filter_map(|v| match kind {
            ColumnKind::Integer => parse_int(*v).map(|n| n as f64),
            _ => parse_price(*v).and_then(|d| d.to_f64()),
        })
        .collect();

    Ok(NumericProfile {
        relation,
        column,
        summary: Summary::from_values(&numbers)?,
    })
}

/// Most frequent trimmed values, blanks counted as `<null>`. Equal counts
/// order by value.
fn top_values(
    relation: &'static str,
    column: &'static str,
    values: &[Option<&str>],
    top_n: usize,
) -> PolarsResult<Vec<FrequencyEntry>> {
    let ranked = DataFrame::new(vec![trimmed(column, values)])?
        .lazy()
        .select([col(column).fill_null(lit(NULL_LABEL)).alias("value")])
        .group_by([col("value")])
        .agg([len().alias("count")])
        .sort_by_exprs([col("count"), col("value")], stable_sort_desc([true, false]))
        .limit(top_n as IdxSize)
        .collect()?;

    let counts = count_values(&ranked, "count")?;
    let entries = str_values(&ranked, "value")?
        .into_iter()
        .zip(counts)
        .enumerate()
        .map(|(i, (value, count))| FrequencyEntry {
            relation,
            column,
            rank: i + 1,
            value,
            count,
        })
        .collect();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::model::{RawCategory, RawCustomer, RawOrder, RawProduct};

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    fn customer(id: Option<String>, email: &str, city: &str) -> RawCustomer {
        RawCustomer {
            customer_id: id,
            email: s(email),
            city: s(city),
            ..Default::default()
        }
    }

    fn product(number: &str, category_id: &str, price: &str) -> RawProduct {
        RawProduct {
            product_number: s(number),
            category_id: s(category_id),
            price: s(price),
            ..Default::default()
        }
    }

    fn order(
        id: &str,
        date: &str,
        customer_id: Option<String>,
        product: &str,
        quantity: &str,
    ) -> RawOrder {
        RawOrder {
            order_id: s(id),
            order_date: s(date),
            customer_id,
            product_number: s(product),
            quantity: s(quantity),
        }
    }

    fn sample_raw() -> RawRelations {
        RawRelations {
            customers: vec![
                customer(s("1"), " a@x.com", "Austin"),
                customer(s("1"), "not-an-email", "Austin"),
                customer(None, "c@x.com", "Dallas"),
            ],
            categories: vec![RawCategory {
                category_id: s("10"),
                category_name: s("Books"),
                ..Default::default()
            }],
            products: vec![product("P1", "10", "10.00"), product("P2", "99", "x")],
            orders: vec![
                order("1", "2021-01-05", s("1"), "P1", "2"),
                order("2", "bad", s("7"), "P3", "4"),
                order("3", "2021-01-06", None, "P1", "6"),
            ],
        }
    }

    #[test]
    fn test_profile_counts() {
        let config = PipelineConfig::default();
        let profile = profile_raw(&sample_raw(), &config.date_formats, 5).unwrap();

        assert_eq!(profile.row_count("customers"), Some(3));
        let key = profile.key("customers").unwrap();
        assert_eq!(key.null_keys, 1);
        assert_eq!(key.duplicate_rows, 1);

        let email = profile.column("customers", "email").unwrap();
        assert_eq!(email.whitespace_polluted, 1);
        assert_eq!(email.format_violations, 1);

        assert_eq!(profile.column("products", "price").unwrap().format_violations, 1);
        assert_eq!(profile.column("orders", "order_date").unwrap().format_violations, 1);

        assert_eq!(profile.orphan("products", "category_id").unwrap().orphans, 1);
        let customer_orphans = profile.orphan("orders", "customer_id").unwrap();
        assert_eq!(customer_orphans.orphans, 1);
        assert_eq!(customer_orphans.null_references, 1);
        assert_eq!(profile.orphan("orders", "product_number").unwrap().orphans, 1);
    }

    #[test]
    fn test_numeric_and_frequency() {
        let config = PipelineConfig::default();
        let profile = profile_raw(&sample_raw(), &config.date_formats, 5).unwrap();

        let quantity = profile
            .numeric
            .iter()
            .find(|n| n.column == "quantity")
            .and_then(|n| n.summary.clone())
            .unwrap();
        assert_eq!(quantity.count, 3);
        assert_eq!(quantity.median, 4.0);

        let top_city = profile
            .frequencies
            .iter()
            .find(|f| f.column == "city" && f.rank == 1)
            .unwrap();
        assert_eq!(top_city.value, "Austin");
        assert_eq!(top_city.count, 2);
    }

    #[test]
    fn test_empty_relations_never_fail() {
        let config = PipelineConfig::default();
        let profile = profile_raw(&RawRelations::default(), &config.date_formats, 5).unwrap();
        assert_eq!(profile.row_count("orders"), Some(0));
        assert!(profile.numeric.iter().all(|n| n.summary.is_none()));
        assert!(profile.qa_checks().iter().all(|c| c.passed()));
    }
}
