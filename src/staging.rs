//! Staging: typed, cleaned, deduplicated relations with enforced references

use std::collections::BTreeMap;

use polars::prelude::*;
use rust_decimal::Decimal;
use tracing::{debug, info, info_span, warn};

use crate::cast::{clean_text, digits_only, normalize_email, parse_date, parse_int, parse_price};
use crate::frame::{duplicate_count, first_per_key, resolves, values};
use crate::model::{
    year_month_label, RawRelations, StagedCategory, StagedCustomer, StagedOrder, StagedProduct,
};
use crate::qa::{QaCheck, Stage};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedRelations {
    pub customers: Vec<StagedCustomer>,
    pub categories: Vec<StagedCategory>,
    pub products: Vec<StagedProduct>,
    pub orders: Vec<StagedOrder>,
}

/// Raw versus staged row counts for one relation, with drop reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationReport {
    pub relation: &'static str,
    pub raw_rows: usize,
    pub staged_rows: usize,
    pub dropped: BTreeMap<&'static str, usize>,
}

impl RelationReport {
    fn new(relation: &'static str, raw_rows: usize) -> Self {
        Self {
            relation,
            raw_rows,
            staged_rows: 0,
            dropped: BTreeMap::new(),
        }
    }

    fn drop_rows(&mut self, reason: &'static str, count: usize) {
        if count > 0 {
            *self.dropped.entry(reason).or_insert(0) += count;
        }
    }

    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }

    pub fn dropped_for(&self, reason: &str) -> usize {
        self.dropped.get(reason).copied().unwrap_or(0)
    }
}

/// One column of a staged relation, for the schema catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogColumn {
    pub relation: &'static str,
    pub column: &'static str,
    pub data_type: &'static str,
    pub nullable: bool,
    pub key: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagingReport {
    pub relations: Vec<RelationReport>,
    /// Orders whose customer does not resolve after the build; must be zero
    pub orphan_customers: usize,
    /// Orders whose product does not resolve after the build; must be zero
    pub orphan_products: usize,
    pub duplicate_keys: usize,
}

impl StagingReport {
    pub fn relation(&self, name: &str) -> Option<&RelationReport> {
        self.relations.iter().find(|r| r.relation == name)
    }

    pub fn qa_checks(&self) -> Vec<QaCheck> {
        let mut checks = Vec::new();
        for relation in &self.relations {
            for (reason, count) in &relation.dropped {
                checks.push(QaCheck::loss(
                    Stage::Staging,
                    format!("{}.dropped.{}", relation.relation, reason),
                    *count,
                ));
            }
            checks.push(
                QaCheck::equals(
                    Stage::Staging,
                    format!("{}.row_reconciliation", relation.relation),
                    relation.staged_rows + relation.dropped_total(),
                    relation.raw_rows,
                )
                .with_detail(format!(
                    "{} raw, {} staged",
                    relation.raw_rows, relation.staged_rows
                )),
            );
        }
        checks.push(QaCheck::equals(
            Stage::Staging,
            "primary_keys.unique",
            self.duplicate_keys,
            0,
        ));
        checks.push(QaCheck::equals(
            Stage::Staging,
            "orders.customer_id.orphans",
            self.orphan_customers,
            0,
        ));
        checks.push(QaCheck::equals(
            Stage::Staging,
            "orders.product_number.orphans",
            self.orphan_products,
            0,
        ));
        checks
    }
}

/// Build all staged relations from the raw extracts.
pub fn build_staging(
    raw: &RawRelations,
    date_formats: &[String],
) -> crate::Result<(StagedRelations, StagingReport)> {
    let _span = info_span!("staging_builder").entered();

    let (customers, customer_report) = stage_customers(raw)?;
    let (categories, category_report) = stage_categories(raw)?;
    let (products, product_report) = stage_products(raw)?;
    let (orders, order_report) = stage_orders(raw, date_formats, &customers, &products)?;

    let staged = StagedRelations {
        customers,
        categories,
        products,
        orders,
    };

    let customer_found = resolves(
        Column::new("customer_id".into(), values(&staged.orders, |o| o.customer_id)),
        customer_id_column(&staged.customers),
    )?;
    let product_found = resolves(
        Column::new("product_number".into(), values(&staged.orders, |o| o.product_number.clone())),
        product_number_column(&staged.products),
    )?;

    let report = StagingReport {
        relations: vec![customer_report, category_report, product_report, order_report],
        orphan_customers: customer_found.iter().filter(|found| !**found).count(),
        orphan_products: product_found.iter().filter(|found| !**found).count(),
        duplicate_keys: duplicate_count(&customer_id_column(&staged.customers))?
            + duplicate_count(&Column::new(
                "category_id".into(),
                values(&staged.categories, |c| c.category_id),
            ))?
            + duplicate_count(&product_number_column(&staged.products))?
            + duplicate_count(&Column::new(
                "order_id".into(),
                values(&staged.orders, |o| o.order_id),
            ))?,
    };

    for relation in &report.relations {
        if relation.dropped_total() > 0 {
            warn!(
                relation = relation.relation,
                raw = relation.raw_rows,
                staged = relation.staged_rows,
                dropped = ?relation.dropped,
                "rows dropped during staging"
            );
        } else {
            debug!(relation = relation.relation, rows = relation.staged_rows, "relation staged");
        }
    }
    info!(
        customers = staged.customers.len(),
        categories = staged.categories.len(),
        products = staged.products.len(),
        orders = staged.orders.len(),
        "staging complete"
    );

    Ok((staged, report))
}

fn customer_id_column(customers: &[StagedCustomer]) -> Column {
    Column::new("customer_id".into(), values(customers, |c| c.customer_id))
}

fn product_number_column(products: &[StagedProduct]) -> Column {
    Column::new("product_number".into(), values(products, |p| p.product_number.clone()))
}

fn stage_customers(raw: &RawRelations) -> PolarsResult<(Vec<StagedCustomer>, RelationReport)> {
    let mut report = RelationReport::new("customers", raw.customers.len());

    let typed: Vec<(Option<i64>, StagedCustomer)> = raw
        .customers
        .iter()
        .map(|c| {
            let id = parse_int(c.customer_id.as_deref());
            let staged = StagedCustomer {
                customer_id: id.unwrap_or_default(),
                first_name: clean_text(c.first_name.as_deref()),
                last_name: clean_text(c.last_name.as_deref()),
                email: normalize_email(c.email.as_deref()),
                phone: digits_only(c.phone.as_deref()),
                city: clean_text(c.city.as_deref()),
                state: clean_text(c.state.as_deref()).map(|s| s.to_uppercase()),
                zip: clean_text(c.zip.as_deref()),
            };
            (id, staged)
        })
        .collect();

    let (rows, null_keys) = drop_null_keys(typed);
    report.drop_rows("null_key", null_keys);
    let keys = customer_id_column(&rows);
    let (rows, duplicates) = dedupe_first(rows, keys)?;
    report.drop_rows("duplicate_key", duplicates);

    report.staged_rows = rows.len();
    Ok((rows, report))
}

fn stage_categories(raw: &RawRelations) -> PolarsResult<(Vec<StagedCategory>, RelationReport)> {
    let mut report = RelationReport::new("categories", raw.categories.len());

    let typed: Vec<(Option<i64>, StagedCategory)> = raw
        .categories
        .iter()
        .map(|c| {
            let id = parse_int(c.category_id.as_deref());
            let staged = StagedCategory {
                category_id: id.unwrap_or_default(),
                category_name: clean_text(c.category_name.as_deref()),
                abbreviation: clean_text(c.category_abbreviation.as_deref())
                    .map(|s| s.to_uppercase()),
            };
            (id, staged)
        })
        .collect();

    let (rows, null_keys) = drop_null_keys(typed);
    report.drop_rows("null_key", null_keys);
    let keys = Column::new("category_id".into(), values(&rows, |c| c.category_id));
    let (rows, duplicates) = dedupe_first(rows, keys)?;
    report.drop_rows("duplicate_key", duplicates);

    report.staged_rows = rows.len();
    Ok((rows, report))
}

fn stage_products(raw: &RawRelations) -> PolarsResult<(Vec<StagedProduct>, RelationReport)> {
    let mut report = RelationReport::new("products", raw.products.len());

    struct Typed {
        product_number: String,
        product_name: Option<String>,
        category_id: Option<i64>,
        price: Option<Decimal>,
    }

    let typed: Vec<(Option<String>, Typed)> = raw
        .products
        .iter()
        .map(|p| {
            let key = clean_text(p.product_number.as_deref());
            let typed = Typed {
                product_number: key.clone().unwrap_or_default(),
                product_name: clean_text(p.product_name.as_deref()),
                category_id: parse_int(p.category_id.as_deref()),
                price: parse_price(p.price.as_deref()),
            };
            (key, typed)
        })
        .collect();

    let (rows, null_keys) = drop_null_keys(typed);
    report.drop_rows("null_key", null_keys);
    let keys = Column::new("product_number".into(), values(&rows, |p| p.product_number.clone()));
    let (rows, duplicates) = dedupe_first(rows, keys)?;
    report.drop_rows("duplicate_key", duplicates);

    let mut staged = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(category_id) = row.category_id else {
            report.drop_rows("missing_category", 1);
            continue;
        };
        let Some(price) = row.price.filter(|p| *p > Decimal::ZERO) else {
            report.drop_rows("invalid_price", 1);
            continue;
        };
        staged.push(StagedProduct {
            product_number: row.product_number,
            product_name: row.product_name,
            category_id,
            price,
        });
    }

    report.staged_rows = staged.len();
    Ok((staged, report))
}

fn stage_orders(
    raw: &RawRelations,
    date_formats: &[String],
    customers: &[StagedCustomer],
    products: &[StagedProduct],
) -> PolarsResult<(Vec<StagedOrder>, RelationReport)> {
    let mut report = RelationReport::new("orders", raw.orders.len());

    let typed: Vec<(Option<i64>, _)> = raw
        .orders
        .iter()
        .map(|o| {
            let id = parse_int(o.order_id.as_deref());
            let fields = (
                id.unwrap_or_default(),
                parse_date(o.order_date.as_deref(), date_formats),
                parse_int(o.customer_id.as_deref()),
                clean_text(o.product_number.as_deref()),
                parse_int(o.quantity.as_deref()),
            );
            (id, fields)
        })
        .collect();

    let (rows, null_keys) = drop_null_keys(typed);
    report.drop_rows("null_key", null_keys);
    let keys = Column::new("order_id".into(), values(&rows, |row| row.0));
    let (rows, duplicates) = dedupe_first(rows, keys)?;
    report.drop_rows("duplicate_key", duplicates);

    // Inner-join semantics: unmatched references are dropped, not flagged
    let customer_found = resolves(
        Column::new("customer_id".into(), values(&rows, |row| row.2)),
        customer_id_column(customers),
    )?;
    let product_found = resolves(
        Column::new("product_number".into(), values(&rows, |row| row.3.clone())),
        product_number_column(products),
    )?;

    let mut staged = Vec::with_capacity(rows.len());
    let resolved = customer_found.into_iter().zip(product_found);
    for (row, found) in rows.into_iter().zip(resolved) {
        let (order_id, date, customer_id, product_number, quantity) = row;
        let Some(order_date) = date else {
            report.drop_rows("unparseable_date", 1);
            continue;
        };
        let Some(customer_id) = customer_id else {
            report.drop_rows("missing_customer_ref", 1);
            continue;
        };
        let Some(product_number) = product_number else {
            report.drop_rows("missing_product_ref", 1);
            continue;
        };
        let Some(quantity) = quantity.filter(|q| *q > 0) else {
            report.drop_rows("invalid_quantity", 1);
            continue;
        };
        let (customer_resolves, product_resolves) = found;
        if !customer_resolves {
            report.drop_rows("orphan_customer", 1);
            continue;
        }
        if !product_resolves {
            report.drop_rows("orphan_product", 1);
            continue;
        }
        staged.push(StagedOrder {
            order_id,
            order_date,
            customer_id,
            product_number,
            quantity,
            order_year_month: year_month_label(order_date),
        });
    }

    report.staged_rows = staged.len();
    Ok((staged, report))
}

/// Split off rows whose primary key failed to cast.
fn drop_null_keys<K, T>(rows: Vec<(Option<K>, T)>) -> (Vec<T>, usize) {
    let total = rows.len();
    let kept: Vec<T> = rows
        .into_iter()
        .filter_map(|(key, row)| key.map(|_| row))
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Keep the first row per key: among rows sharing a key the earliest in
/// source order wins, and the output is ordered by key.
fn dedupe_first<T>(rows: Vec<T>, keys: Column) -> PolarsResult<(Vec<T>, usize)> {
    let total = rows.len();
    let mut slots: Vec<Option<T>> = rows.into_iter().map(Some).collect();
    let kept: Vec<T> = first_per_key(keys)?
        .into_iter()
        .filter_map(|position| slots.get_mut(position).and_then(Option::take))
        .collect();
    let dropped = total - kept.len();
    Ok((kept, dropped))
}

/// Static catalog of the staged relations' columns.
pub fn schema_catalog() -> Vec<CatalogColumn> {
    const fn col(
        relation: &'static str,
        column: &'static str,
        data_type: &'static str,
        nullable: bool,
        key: &'static str,
    ) -> CatalogColumn {
        CatalogColumn {
            relation,
            column,
            data_type,
            nullable,
            key,
        }
    }

    vec![
        col("stg_customers", "customer_id", "int64", false, "PK"),
        col("stg_customers", "first_name", "string", true, ""),
        col("stg_customers", "last_name", "string", true, ""),
        col("stg_customers", "email", "string", true, ""),
        col("stg_customers", "phone", "string", true, ""),
        col("stg_customers", "city", "string", true, ""),
        col("stg_customers", "state", "string", true, ""),
        col("stg_customers", "zip", "string", true, ""),
        col("stg_categories", "category_id", "int64", false, "PK"),
        col("stg_categories", "category_name", "string", true, ""),
        col("stg_categories", "abbreviation", "string", true, ""),
        col("stg_products", "product_number", "string", false, "PK"),
        col("stg_products", "product_name", "string", true, ""),
        col("stg_products", "category_id", "int64", false, "FK stg_categories"),
        col("stg_products", "price", "decimal", false, ""),
        col("stg_orders", "order_id", "int64", false, "PK"),
        col("stg_orders", "order_date", "date", false, ""),
        col("stg_orders", "customer_id", "int64", false, "FK stg_customers"),
        col("stg_orders", "product_number", "string", false, "FK stg_products"),
        col("stg_orders", "quantity", "int64", false, ""),
        col("stg_orders", "order_year_month", "string", false, ""),
    ]
}
