//! Loading raw extract relations using Polars
//!
//! Every column is read as a string: casting is the staging layer's job, so
//! a malformed value must survive ingestion untouched.

use std::path::{Path, PathBuf};

use anyhow::Context;
use polars::prelude::*;
use tracing::{debug, info};

use crate::config::InputFiles;
use crate::error::PipelineError;
use crate::frame::opt_str_values;
use crate::model::{RawCategory, RawCustomer, RawOrder, RawProduct, RawRelations};

/// Load the four raw relations from CSV extracts in `dir`.
pub fn load_raw_relations(dir: &Path, inputs: &InputFiles) -> crate::Result<RawRelations> {
    let customers = read_raw_frame("customers", &dir.join(&inputs.customers))?;
    let categories = read_raw_frame("categories", &dir.join(&inputs.categories))?;
    let products = read_raw_frame("products", &dir.join(&inputs.products))?;
    let orders = read_raw_frame("orders", &dir.join(&inputs.orders))?;

    let raw = RawRelations::from_frames(&customers, &categories, &products, &orders)?;
    info!(
        customers = raw.customers.len(),
        categories = raw.categories.len(),
        products = raw.products.len(),
        orders = raw.orders.len(),
        "raw relations loaded"
    );
    Ok(raw)
}

/// Read one CSV extract with every column typed as a string.
pub fn read_raw_frame(relation: &str, path: &Path) -> crate::Result<DataFrame> {
    if !path.exists() {
        return Err(PipelineError::MissingInput {
            relation: relation.to_string(),
            path: path.display().to_string(),
        }
        .into());
    }

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(PathBuf::from(path)))?
        .finish()
        .with_context(|| format!("Failed to read {} from {}", relation, path.display()))?;

    debug!(relation, rows = df.height(), columns = df.width(), "raw frame read");
    Ok(df)
}

impl RawRelations {
    /// Build raw relations from frames. Columns may have any dtype; they are
    /// cast to strings. Absent columns become all-null.
    pub fn from_frames(
        customers: &DataFrame,
        categories: &DataFrame,
        products: &DataFrame,
        orders: &DataFrame,
    ) -> crate::Result<Self> {
        Ok(Self {
            customers: raw_customers(customers)?,
            categories: raw_categories(categories)?,
            products: raw_products(products)?,
            orders: raw_orders(orders)?,
        })
    }
}

fn raw_customers(df: &DataFrame) -> crate::Result<Vec<RawCustomer>> {
    let ids = string_column(df, "customer_id")?;
    let first_names = string_column(df, "first_name")?;
    let last_names = string_column(df, "last_name")?;
    let emails = string_column(df, "email")?;
    let phones = string_column(df, "phone")?;
    let cities = string_column(df, "city")?;
    let states = string_column(df, "state")?;
    let zips = string_column(df, "zip")?;

    let rows = (0..df.height())
        .map(|i| RawCustomer {
            customer_id: ids[i].clone(),
            first_name: first_names[i].clone(),
            last_name: last_names[i].clone(),
            email: emails[i].clone(),
            phone: phones[i].clone(),
            city: cities[i].clone(),
            state: states[i].clone(),
            zip: zips[i].clone(),
        })
        .collect();
    Ok(rows)
}

fn raw_categories(df: &DataFrame) -> crate::Result<Vec<RawCategory>> {
    let ids = string_column(df, "category_id")?;
    let names = string_column(df, "category_name")?;
    let abbreviations = string_column(df, "category_abbreviation")?;

    let rows = (0..df.height())
        .map(|i| RawCategory {
            category_id: ids[i].clone(),
            category_name: names[i].clone(),
            category_abbreviation: abbreviations[i].clone(),
        })
        .collect();
    Ok(rows)
}

fn raw_products(df: &DataFrame) -> crate::Result<Vec<RawProduct>> {
    let numbers = string_column(df, "product_number")?;
    let names = string_column(df, "product_name")?;
    let categories = string_column(df, "category_id")?;
    let prices = string_column(df, "price")?;

    let rows = (0..df.height())
        .map(|i| RawProduct {
            product_number: numbers[i].clone(),
            product_name: names[i].clone(),
            category_id: categories[i].clone(),
            price: prices[i].clone(),
        })
        .collect();
    Ok(rows)
}

fn raw_orders(df: &DataFrame) -> crate::Result<Vec<RawOrder>> {
    let ids = string_column(df, "order_id")?;
    let dates = string_column(df, "order_date")?;
    let customers = string_column(df, "customer_id")?;
    let products = string_column(df, "product_number")?;
    let quantities = string_column(df, "quantity")?;

    let rows = (0..df.height())
        .map(|i| RawOrder {
            order_id: ids[i].clone(),
            order_date: dates[i].clone(),
            customer_id: customers[i].clone(),
            product_number: products[i].clone(),
            quantity: quantities[i].clone(),
        })
        .collect();
    Ok(rows)
}

/// Extract a column as optional strings, or all-null if the column is absent.
fn string_column(df: &DataFrame, name: &str) -> crate::Result<Vec<Option<String>>> {
    if df.column(name).is_err() {
        return Ok(vec![None; df.height()]);
    }
    Ok(opt_str_values(df, name)?)
}
