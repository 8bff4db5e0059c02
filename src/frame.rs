//! Conversions between typed relation rows and Polars frames
//!
//! Stages keep their output as typed rows and run joins, windows and
//! group-bys as lazy Polars plans over frames built from those rows. Money
//! travels as a `Decimal` column so sums stay exact; dates travel as `Date`.

use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use rust_decimal::Decimal;

/// Row position column added before a plan reorders or joins rows.
pub const ROW: &str = "row";

/// Precision of every decimal column; the scale follows the data.
const DECIMAL_PRECISION: usize = 38;

/// Days from 0001-01-01 to 1970-01-01, the origin of Polars dates.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Project every row through `f`.
pub fn values<T, U>(rows: &[T], f: impl Fn(&T) -> U) -> Vec<U> {
    rows.iter().map(f).collect()
}

/// A `Date` column.
pub fn date_column(name: &str, dates: &[NaiveDate]) -> PolarsResult<Column> {
    let days: Vec<i32> = dates
        .iter()
        .map(|d| d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
        .collect();
    Column::new(name.into(), days).cast(&DataType::Date)
}

/// An exact `Decimal` column, scaled to the most precise value.
pub fn decimal_column(name: &str, amounts: &[Decimal]) -> PolarsResult<Column> {
    let scale = amounts.iter().map(|d| d.scale()).max().unwrap_or(0) as usize;
    let text: Vec<String> = amounts.iter().map(|d| d.to_string()).collect();
    Column::new(name.into(), text).cast(&DataType::Decimal(Some(DECIMAL_PRECISION), Some(scale)))
}

fn materialized(df: &DataFrame, name: &str, dtype: &DataType) -> PolarsResult<Series> {
    Ok(df.column(name)?.cast(dtype)?.as_materialized_series().clone())
}

fn unexpected_null(name: &str) -> PolarsError {
    PolarsError::ComputeError(format!("unexpected null in column {name}").into())
}

fn non_null<T>(name: &str, values: impl Iterator<Item = Option<T>>) -> PolarsResult<Vec<T>> {
    values.map(|v| v.ok_or_else(|| unexpected_null(name))).collect()
}

pub fn opt_str_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<String>>> {
    let series = materialized(df, name, &DataType::String)?;
    let values = series.str()?.into_iter().map(|v| v.map(str::to_owned)).collect();
    Ok(values)
}

pub fn str_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<String>> {
    non_null(name, opt_str_values(df, name)?.into_iter())
}

pub fn i64_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<i64>> {
    let series = materialized(df, name, &DataType::Int64)?;
    non_null(name, series.i64()?.into_iter())
}

pub fn u32_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<u32>> {
    let series = materialized(df, name, &DataType::UInt32)?;
    non_null(name, series.u32()?.into_iter())
}

pub fn opt_f64_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<f64>>> {
    let series = materialized(df, name, &DataType::Float64)?;
    Ok(series.f64()?.into_iter().collect())
}

/// Row positions, lengths and distinct counts.
pub fn count_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<usize>> {
    let series = materialized(df, name, &DataType::UInt64)?;
    let counts = non_null(name, series.u64()?.into_iter())?;
    Ok(counts.into_iter().map(|n| n as usize).collect())
}

/// The single count of a one-row aggregate frame.
pub fn scalar_count(df: &DataFrame, name: &str) -> PolarsResult<usize> {
    Ok(count_values(df, name)?.first().copied().unwrap_or(0))
}

pub fn date_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<NaiveDate>> {
    let series = materialized(df, name, &DataType::Int32)?;
    let dates = series.i32()?.into_iter().map(|days| {
        days.and_then(|d| NaiveDate::from_num_days_from_ce_opt(d + UNIX_EPOCH_DAYS_FROM_CE))
    });
    non_null(name, dates)
}

pub fn decimal_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Decimal>> {
    let series = materialized(df, name, &DataType::String)?;
    let amounts = series
        .str()?
        .into_iter()
        .map(|v| v.and_then(|text| Decimal::from_str(text).ok()));
    non_null(name, amounts)
}

/// Frame order for ties: keep the incoming row order.
pub fn stable_sort() -> SortMultipleOptions {
    SortMultipleOptions::default().with_maintain_order(true)
}

/// Stable sort with a per-column descending flag.
pub fn stable_sort_desc(descending: impl IntoIterator<Item = bool>) -> SortMultipleOptions {
    stable_sort().with_order_descending_multi(descending)
}

/// Sort key for a decimal column. Equal amounts map to equal keys.
pub fn amount_order(name: &str) -> Expr {
    col(name).cast(DataType::Float64)
}

/// Keys of `keys` tagged with a non-null `marker` column, one row per key,
/// ready to be left-joined as a membership test.
pub fn key_marker(keys: LazyFrame, key: &str, marker: &str) -> LazyFrame {
    keys.select([col(key)])
        .filter(col(key).is_not_null().and(col(key).is_first_distinct()))
        .with_column(lit(true).alias(marker))
}

pub fn left_join(left: LazyFrame, right: LazyFrame, key: &str) -> LazyFrame {
    left.join(right, [col(key)], [col(key)], JoinArgs::new(JoinType::Left))
}

pub fn inner_join(left: LazyFrame, right: LazyFrame, key: &str) -> LazyFrame {
    left.join(right, [col(key)], [col(key)], JoinArgs::new(JoinType::Inner))
}

/// For each of `lookups`, whether it occurs among `keys`. Null lookups never
/// resolve.
pub fn resolves(lookups: Column, keys: Column) -> PolarsResult<Vec<bool>> {
    const KEY: &str = "key";
    const FOUND: &str = "found";
    let lookups = DataFrame::new(vec![lookups.with_name(KEY.into())])?;
    let keys = DataFrame::new(vec![keys.with_name(KEY.into())])?;

    let joined = left_join(
        lookups.lazy().with_row_index(ROW, None),
        key_marker(keys.lazy(), KEY, FOUND),
        KEY,
    )
    .sort_by_exprs([col(ROW)], stable_sort())
    .select([col(FOUND).is_not_null().alias(FOUND)])
    .collect()?;

    let found = joined.column(FOUND)?.as_materialized_series().bool()?.clone();
    Ok(found.into_iter().map(|v| v.unwrap_or(false)).collect())
}

/// Positions of the first row for every distinct key, ordered by key.
pub fn first_per_key(keys: Column) -> PolarsResult<Vec<usize>> {
    const KEY: &str = "key";
    let frame = DataFrame::new(vec![keys.with_name(KEY.into())])?;
    let firsts = frame
        .lazy()
        .with_row_index(ROW, None)
        .filter(col(KEY).is_first_distinct())
        .sort_by_exprs([col(KEY)], stable_sort())
        .collect()?;
    count_values(&firsts, ROW)
}

/// Rows beyond the first for every repeated key.
pub fn duplicate_count(keys: &Column) -> PolarsResult<usize> {
    Ok(keys.len() - keys.as_materialized_series().n_unique()?)
}
