//! Export every output relation as a Polars DataFrame and CSV file
//!
//! Decimals are written as `f64` and dates as ISO `YYYY-MM-DD` strings.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::frame::values;
use crate::master::MasterReport;
use crate::metrics::{MetricViews, Rollup};
use crate::model::{EnrichedSalesLine, MasterSalesLine};
use crate::pipeline::PipelineOutput;
use crate::qa::QaReport;
use crate::staging::{schema_catalog, StagedRelations, StagingReport};
use crate::star::StarSchema;
use crate::validate::RawProfile;

fn dec(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

fn day(date: NaiveDate) -> String {
    date.to_string()
}

fn count(n: usize) -> u64 {
    n as u64
}

/// Every output relation by name, in pipeline order.
pub fn relation_frames(output: &PipelineOutput) -> PolarsResult<Vec<(&'static str, DataFrame)>> {
    let mut frames = staged_frames(&output.staged)?;
    frames.push(("master_sales", master_frame(&output.master)?));
    frames.push(("enriched_sales", enriched_frame(&output.enriched)?));
    frames.extend(star_frames(&output.star)?);
    frames.extend(view_frames(&output.views)?);
    frames.push(("qa_checks", qa_frame(&output.qa)?));
    frames.extend(staging_qa_frames(&output.staging_report)?);
    frames.extend(raw_qa_frames(&output.raw_profile)?);
    frames.extend(master_qa_frames(&output.master_report)?);
    Ok(frames)
}

/// Write `<name>.csv` into `dir`, replacing any previous file.
pub fn write_csv(dir: &Path, name: &str, df: &mut DataFrame) -> crate::Result<PathBuf> {
    let path = dir.join(format!("{name}.csv"));
    let mut file =
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(df)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!(relation = name, rows = df.height(), "relation written");
    Ok(path)
}

/// Write every output relation as CSV into `dir`.
pub fn write_relations(dir: &Path, output: &PipelineOutput) -> crate::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let frames = relation_frames(output).context("Failed to build output frames")?;

    let mut written = Vec::with_capacity(frames.len());
    for (name, mut df) in frames {
        written.push(write_csv(dir, name, &mut df)?);
    }
    info!(relations = written.len(), dir = %dir.display(), "relations written");
    Ok(written)
}

pub fn staged_frames(staged: &StagedRelations) -> PolarsResult<Vec<(&'static str, DataFrame)>> {
    let c = &staged.customers;
    let customers = df!(
        "customer_id" => values(c, |r| r.customer_id),
        "first_name" => values(c, |r| r.first_name.clone()),
        "last_name" => values(c, |r| r.last_name.clone()),
        "email" => values(c, |r| r.email.clone()),
        "phone" => values(c, |r| r.phone.clone()),
        "city" => values(c, |r| r.city.clone()),
        "state" => values(c, |r| r.state.clone()),
        "zip" => values(c, |r| r.zip.clone()),
    )?;

    let g = &staged.categories;
    let categories = df!(
        "category_id" => values(g, |r| r.category_id),
        "category_name" => values(g, |r| r.category_name.clone()),
        "abbreviation" => values(g, |r| r.abbreviation.clone()),
    )?;

    let p = &staged.products;
    let products = df!(
        "product_number" => values(p, |r| r.product_number.clone()),
        "product_name" => values(p, |r| r.product_name.clone()),
        "category_id" => values(p, |r| r.category_id),
        "price" => values(p, |r| dec(r.price)),
    )?;

    let o = &staged.orders;
    let orders = df!(
        "order_id" => values(o, |r| r.order_id),
        "order_date" => values(o, |r| day(r.order_date)),
        "customer_id" => values(o, |r| r.customer_id),
        "product_number" => values(o, |r| r.product_number.clone()),
        "quantity" => values(o, |r| r.quantity),
        "order_year_month" => values(o, |r| r.order_year_month.clone()),
    )?;

    Ok(vec![
        ("stg_customers", customers),
        ("stg_categories", categories),
        ("stg_products", products),
        ("stg_orders", orders),
    ])
}

pub fn master_frame(lines: &[MasterSalesLine]) -> PolarsResult<DataFrame> {
    df!(
        "customer_email" => values(lines, |r| r.customer_email.clone()),
        "customer_city" => values(lines, |r| r.customer_city.clone()),
        "order_date" => values(lines, |r| day(r.order_date)),
        "quantity" => values(lines, |r| r.quantity),
        "product_name" => values(lines, |r| r.product_name.clone()),
        "unit_price" => values(lines, |r| dec(r.unit_price)),
        "category_name" => values(lines, |r| r.category_name.clone()),
        "line_revenue" => values(lines, |r| dec(r.line_revenue)),
    )
}

pub fn enriched_frame(lines: &[EnrichedSalesLine]) -> PolarsResult<DataFrame> {
    let mut df = master_frame(&values(lines, |r| r.line.clone()))?;
    let extra = df!(
        "order_year" => values(lines, |r| r.order_year),
        "order_month" => values(lines, |r| r.order_month),
        "order_quarter" => values(lines, |r| r.order_quarter),
        "order_year_month" => values(lines, |r| r.order_year_month.clone()),
        "weekday_name" => values(lines, |r| r.weekday_name.clone()),
        "weekday_num" => values(lines, |r| r.weekday_num),
        "week_of_year" => values(lines, |r| r.week_of_year),
        "price_bucket" => values(lines, |r| r.price_bucket.clone()),
        "first_order_date" => values(lines, |r| day(r.first_order_date)),
        "days_since_first" => values(lines, |r| r.days_since_first),
        "order_sequence_number" => values(lines, |r| count(r.order_sequence_number)),
        "is_repeat_customer" => values(lines, |r| r.is_repeat_customer),
        "customer_lifetime_revenue" => values(lines, |r| dec(r.customer_lifetime_revenue)),
        "customer_line_count" => values(lines, |r| count(r.customer_line_count)),
        "customer_avg_line_value" => values(lines, |r| r.customer_avg_line_value.map(dec)),
        "city_tier" => values(lines, |r| r.city_tier.clone()),
        "city_revenue" => values(lines, |r| dec(r.city_revenue)),
        "category_tier" => values(lines, |r| r.category_tier.clone()),
        "category_revenue" => values(lines, |r| dec(r.category_revenue)),
    )?;
    df.hstack_mut(extra.get_columns())?;
    Ok(df)
}

pub fn star_frames(star: &StarSchema) -> PolarsResult<Vec<(&'static str, DataFrame)>> {
    let d = &star.dim_date;
    let dim_date = df!(
        "date_key" => values(d, |r| r.date_key),
        "date" => values(d, |r| day(r.date)),
        "year" => values(d, |r| r.year),
        "quarter" => values(d, |r| r.quarter),
        "month" => values(d, |r| r.month),
        "month_name" => values(d, |r| r.month_name.clone()),
        "day" => values(d, |r| r.day),
        "weekday_num" => values(d, |r| r.weekday_num),
        "weekday_name" => values(d, |r| r.weekday_name.clone()),
        "week_of_year" => values(d, |r| r.week_of_year),
        "is_weekend" => values(d, |r| r.is_weekend),
        "year_month" => values(d, |r| r.year_month.clone()),
    )?;

    let c = &star.dim_customer;
    let dim_customer = df!(
        "customer_key" => values(c, |r| r.customer_key),
        "customer_email" => values(c, |r| r.customer_email.clone()),
        "customer_city" => values(c, |r| r.customer_city.clone()),
    )?;

    let p = &star.dim_product;
    let dim_product = df!(
        "product_key" => values(p, |r| r.product_key),
        "product_name" => values(p, |r| r.product_name.clone()),
        "category_name" => values(p, |r| r.category_name.clone()),
    )?;

    let f = &star.fact_sales;
    let fact_sales = df!(
        "date_key" => values(f, |r| r.date_key),
        "customer_key" => values(f, |r| r.customer_key),
        "product_key" => values(f, |r| r.product_key),
        "quantity" => values(f, |r| r.quantity),
        "unit_price" => values(f, |r| dec(r.unit_price)),
        "line_revenue" => values(f, |r| dec(r.line_revenue)),
    )?;

    Ok(vec![
        ("dim_date", dim_date),
        ("dim_customer", dim_customer),
        ("dim_product", dim_product),
        ("fact_sales", fact_sales),
    ])
}

/// Rollup measures appended to the frame holding the key columns.
fn rollup_frame<K>(mut keys: DataFrame, rows: &[Rollup<K>]) -> PolarsResult<DataFrame> {
    let measures = df!(
        "revenue" => values(rows, |r| dec(r.revenue)),
        "quantity" => values(rows, |r| r.quantity),
        "lines" => values(rows, |r| count(r.lines)),
        "orders" => values(rows, |r| count(r.orders)),
        "customers" => values(rows, |r| count(r.customers)),
        "asp" => values(rows, |r| r.asp),
        "aov" => values(rows, |r| r.aov),
    )?;
    keys.hstack_mut(measures.get_columns())?;
    Ok(keys)
}

pub fn view_frames(views: &MetricViews) -> PolarsResult<Vec<(&'static str, DataFrame)>> {
    let b = &views.base;
    let base = df!(
        "date_key" => values(b, |r| r.date_key),
        "order_date" => values(b, |r| day(r.order_date)),
        "year" => values(b, |r| r.year),
        "quarter" => values(b, |r| r.quarter),
        "month" => values(b, |r| r.month),
        "year_month" => values(b, |r| r.year_month.clone()),
        "weekday_num" => values(b, |r| r.weekday_num),
        "weekday_name" => values(b, |r| r.weekday_name.clone()),
        "week_of_year" => values(b, |r| r.week_of_year),
        "is_weekend" => values(b, |r| r.is_weekend),
        "customer_key" => values(b, |r| r.customer_key),
        "customer_email" => values(b, |r| r.customer_email.clone()),
        "customer_city" => values(b, |r| r.customer_city.clone()),
        "product_key" => values(b, |r| r.product_key),
        "product_name" => values(b, |r| r.product_name.clone()),
        "category_name" => values(b, |r| r.category_name.clone()),
        "price_bucket" => values(b, |r| r.price_bucket_label.clone()),
        "quantity" => values(b, |r| r.quantity),
        "unit_price" => values(b, |r| dec(r.unit_price)),
        "line_revenue" => values(b, |r| dec(r.line_revenue)),
    )?;

    let daily = rollup_frame(
        df!("order_date" => values(&views.daily, |r| day(r.key)))?,
        &views.daily,
    )?;
    let monthly = rollup_frame(
        df!("year_month" => values(&views.monthly, |r| r.key.clone()))?,
        &views.monthly,
    )?;
    let weekday = rollup_frame(
        df!(
            "weekday_num" => values(&views.weekday, |r| r.key.0),
            "weekday_name" => values(&views.weekday, |r| r.key.1.clone()),
        )?,
        &views.weekday,
    )?;
    let city = rollup_frame(
        df!("customer_city" => values(&views.city, |r| r.key.clone()))?,
        &views.city,
    )?;
    let category = rollup_frame(
        df!("category_name" => values(&views.category, |r| r.key.clone()))?,
        &views.category,
    )?;
    let product = rollup_frame(
        df!(
            "product_name" => values(&views.product, |r| r.key.0.clone()),
            "category_name" => values(&views.product, |r| r.key.1.clone()),
        )?,
        &views.product,
    )?;
    let price_bucket = rollup_frame(
        df!("price_bucket" => values(&views.price_bucket, |r| r.key.1.clone()))?,
        &views.price_bucket,
    )?;

    let t = &views.trend;
    let trend = df!(
        "year_month" => values(t, |r| r.year_month.clone()),
        "revenue" => values(t, |r| dec(r.revenue)),
        "quantity" => values(t, |r| r.quantity),
        "revenue_prev_month" => values(t, |r| r.revenue_prev_month.map(dec)),
        "sales_mom_pct" => values(t, |r| r.sales_mom_pct),
        "revenue_prev_year" => values(t, |r| r.revenue_prev_year.map(dec)),
        "sales_yoy_pct" => values(t, |r| r.sales_yoy_pct),
        "sales_index" => values(t, |r| r.sales_index),
        "revenue_ma3" => values(t, |r| r.revenue_ma3),
    )?;

    let r = &views.rfm;
    let rfm = df!(
        "customer_key" => values(r, |x| x.customer_key),
        "customer_email" => values(r, |x| x.customer_email.clone()),
        "last_purchase" => values(r, |x| day(x.last_purchase)),
        "recency_days" => values(r, |x| x.recency_days),
        "frequency" => values(r, |x| count(x.frequency)),
        "monetary" => values(r, |x| dec(x.monetary)),
        "r_score" => values(r, |x| x.r_score),
        "f_score" => values(r, |x| x.f_score),
        "m_score" => values(r, |x| x.m_score),
        "rfm_code" => values(r, |x| x.rfm_code()),
        "segment" => values(r, |x| x.segment.as_str()),
    )?;

    let c = &views.cohort;
    let cohort = df!(
        "cohort_month" => values(c, |x| x.cohort_month.clone()),
        "months_since_first" => values(c, |x| x.months_since_first),
        "active_customers" => values(c, |x| count(x.active_customers)),
        "cohort_size" => values(c, |x| count(x.cohort_size)),
        "retention_rate" => values(c, |x| x.retention_rate),
    )?;

    let p = &views.pareto;
    let pareto = df!(
        "product_key" => values(p, |x| x.product_key),
        "product_name" => values(p, |x| x.product_name.clone()),
        "category_name" => values(p, |x| x.category_name.clone()),
        "revenue" => values(p, |x| dec(x.revenue)),
        "revenue_rank" => values(p, |x| count(x.revenue_rank)),
        "cumulative_revenue" => values(p, |x| dec(x.cumulative_revenue)),
        "cumulative_share" => values(p, |x| x.cumulative_share),
        "is_top_80" => values(p, |x| x.is_top_80),
    )?;

    let v = &views.clv;
    let clv = df!(
        "customer_key" => values(v, |x| x.customer_key),
        "customer_email" => values(v, |x| x.customer_email.clone()),
        "customer_city" => values(v, |x| x.customer_city.clone()),
        "first_purchase" => values(v, |x| day(x.first_purchase)),
        "last_purchase" => values(v, |x| day(x.last_purchase)),
        "lifespan_days" => values(v, |x| x.lifespan_days),
        "orders" => values(v, |x| count(x.orders)),
        "lines" => values(v, |x| count(x.lines)),
        "revenue_total" => values(v, |x| dec(x.revenue_total)),
        "avg_order_value" => values(v, |x| x.avg_order_value),
        "margin_rate" => values(v, |x| dec(x.margin_rate)),
        "clv" => values(v, |x| dec(x.clv)),
    )?;

    Ok(vec![
        ("vw_sales_base", base),
        ("vw_sales_daily", daily),
        ("vw_sales_monthly", monthly),
        ("vw_sales_weekday", weekday),
        ("vw_sales_city", city),
        ("vw_sales_category", category),
        ("vw_sales_product", product),
        ("vw_sales_price_bucket", price_bucket),
        ("vw_sales_trend", trend),
        ("vw_rfm", rfm),
        ("vw_cohort_retention", cohort),
        ("vw_pareto_products", pareto),
        ("vw_clv", clv),
    ])
}

pub fn qa_frame(qa: &QaReport) -> PolarsResult<DataFrame> {
    let c = qa.checks();
    df!(
        "stage" => values(c, |x| x.stage.as_str()),
        "check" => values(c, |x| x.check.clone()),
        "observed" => values(c, |x| x.observed.clone()),
        "expected" => values(c, |x| x.expected.clone()),
        "status" => values(c, |x| x.status.as_str()),
        "detail" => values(c, |x| x.detail.clone()),
    )
}

pub fn staging_qa_frames(report: &StagingReport) -> PolarsResult<Vec<(&'static str, DataFrame)>> {
    let r = &report.relations;
    let reconciliation = df!(
        "relation" => values(r, |x| x.relation),
        "raw_rows" => values(r, |x| count(x.raw_rows)),
        "staged_rows" => values(r, |x| count(x.staged_rows)),
        "dropped_rows" => values(r, |x| count(x.dropped_total())),
        "drop_reasons" => values(r, |x| {
            x.dropped
                .iter()
                .map(|(reason, n)| format!("{reason}={n}"))
                .collect::<Vec<_>>()
                .join(";")
        }),
    )?;

    let catalog = schema_catalog();
    let catalog = df!(
        "relation" => values(&catalog, |x| x.relation),
        "column" => values(&catalog, |x| x.column),
        "data_type" => values(&catalog, |x| x.data_type),
        "nullable" => values(&catalog, |x| x.nullable),
        "key" => values(&catalog, |x| x.key),
    )?;

    Ok(vec![
        ("qa_row_reconciliation", reconciliation),
        ("qa_schema_catalog", catalog),
    ])
}

pub fn raw_qa_frames(profile: &RawProfile) -> PolarsResult<Vec<(&'static str, DataFrame)>> {
    let c = &profile.columns;
    let columns = df!(
        "relation" => values(c, |x| x.relation),
        "column" => values(c, |x| x.column),
        "kind" => values(c, |x| x.kind.as_str()),
        "rows" => values(c, |x| count(x.rows)),
        "nulls" => values(c, |x| count(x.nulls)),
        "whitespace_polluted" => values(c, |x| count(x.whitespace_polluted)),
        "format_violations" => values(c, |x| count(x.format_violations)),
    )?;

    let n = &profile.numeric;
    let stat = |f: fn(&crate::stats::Summary) -> f64| values(n, move |x| x.summary.as_ref().map(f));
    let numeric = df!(
        "relation" => values(n, |x| x.relation),
        "column" => values(n, |x| x.column),
        "count" => values(n, |x| count(x.summary.as_ref().map_or(0, |s| s.count))),
        "min" => stat(|s| s.min),
        "q1" => stat(|s| s.q1),
        "median" => stat(|s| s.median),
        "q3" => stat(|s| s.q3),
        "max" => stat(|s| s.max),
        "mean" => stat(|s| s.mean),
        "stddev" => values(n, |x| x.summary.as_ref().and_then(|s| s.stddev)),
    )?;

    let f = &profile.frequencies;
    let frequency = df!(
        "relation" => values(f, |x| x.relation),
        "column" => values(f, |x| x.column),
        "rank" => values(f, |x| count(x.rank)),
        "value" => values(f, |x| x.value.clone()),
        "count" => values(f, |x| count(x.count)),
    )?;

    Ok(vec![
        ("qa_raw_columns", columns),
        ("qa_raw_numeric", numeric),
        ("qa_raw_frequency", frequency),
    ])
}

pub fn master_qa_frames(report: &MasterReport) -> PolarsResult<Vec<(&'static str, DataFrame)>> {
    let m = &report.months;
    let months = df!(
        "year_month" => values(m, |x| x.year_month.clone()),
        "lines" => values(m, |x| count(x.lines)),
        "quantity" => values(m, |x| x.quantity),
        "revenue" => values(m, |x| dec(x.revenue)),
    )?;

    let c = &report.categories;
    let categories = df!(
        "category_name" => values(c, |x| x.category_name.clone()),
        "lines" => values(c, |x| count(x.lines)),
        "quantity" => values(c, |x| x.quantity),
        "revenue" => values(c, |x| dec(x.revenue)),
        "revenue_share" => values(c, |x| x.revenue_share),
    )?;

    Ok(vec![
        ("qa_master_months", months),
        ("qa_master_categories", categories),
        ("qa_master_sample", master_frame(&report.sample)?),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::fixtures::{date, sale};
    use crate::qa::{QaCheck, Stage};

    #[test]
    fn test_master_frame_columns() {
        let lines = vec![
            sale("a@x.com", "Austin", date(2021, 1, 5), "P1", "Books", 1999, 2),
            sale("b@x.com", "Boston", date(2021, 2, 5), "P2", "Games", 500, 1),
        ];
        let df = master_frame(&lines).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 8);
        let revenue = df.column("line_revenue").unwrap().f64().unwrap();
        assert_eq!(revenue.get(0), Some(39.98));
        let dates = df.column("order_date").unwrap().str().unwrap();
        assert_eq!(dates.get(1), Some("2021-02-05"));
    }

    #[test]
    fn test_write_csv_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut qa = QaReport::new();
        qa.push(QaCheck::equals(Stage::Master, "master.preflight_cardinality", 3, 3));

        let mut df = qa_frame(&qa).unwrap();
        let path = write_csv(dir.path(), "qa_checks", &mut df).unwrap();
        let first = fs::read_to_string(&path).unwrap();
        let path = write_csv(dir.path(), "qa_checks", &mut df).unwrap();
        let second = fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
        assert!(first.starts_with("stage,check,observed,expected,status,detail"));
        assert!(first.contains("master,master.preflight_cardinality,3,3,pass"));
    }
}
