//! Integration tests for SalesForge

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use salesforge::config::PipelineConfig;
use salesforge::qa::QaStatus;
use salesforge::{load_raw_relations, run_pipeline, write_relations, PipelineError, PipelineOutput};
use tempfile::TempDir;

fn write_file(dir: &Path, name: &str, lines: &[&str]) {
    let mut file = File::create(dir.join(name)).unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
}

/// Create the four raw extracts with known defects
fn create_test_extracts() -> TempDir {
    let dir = TempDir::new().unwrap();

    write_file(
        dir.path(),
        "customers.csv",
        &[
            "customer_id,first_name,last_name,email,phone,city,state,zip",
            "1,Ann,Lee, ANN@X.com ,(555) 010-1000,Austin,tx,73301",
            "2,Bob,Ray,bob@x.com,555-010-2000,Boston,ma,02101",
            // Duplicate id: first row wins
            "2,Bob,Dup,bob2@x.com,,Boston,ma,02101",
            "3,Cy,Fox,mailto:cy@x.com,,Chicago,il,60601",
            // Null key
            ",No,Key,nokey@x.com,,Denver,co,80201",
            // No email: staged, then excluded by the master null guard
            "4,Dee,Nash,,,Denver,co,80201",
        ],
    );

    write_file(
        dir.path(),
        "categories.csv",
        &[
            "category_id,category_name,category_abbreviation",
            "10,Books,bk",
            "20,Games,gm",
        ],
    );

    write_file(
        dir.path(),
        "products.csv",
        &[
            "product_number,product_name,category_id,price",
            "P1,Novel,10,19.99",
            "P2,Board Game,20,$50.00",
            "P3,Atlas,10,120",
            "P4,Broken,10,-5",
            "P5,Orphan,,12",
        ],
    );

    write_file(
        dir.path(),
        "orders.csv",
        &[
            "order_id,order_date,customer_id,product_number,quantity",
            "1001,2021-01-05,1,P1,2",
            "1002,2021-01-05,1,P2,1",
            "1003,02/10/2021,1,P3,1",
            "1004,2021-02-11,2,P1,3",
            "1005,2021-03-01 10:00:00,3,P2,2",
            "1006,2021-03-15,2,P3,1",
            "1007,not a date,1,P1,1",
            "1008,2021-03-20,99,P1,1",
            "1009,2021-03-21,1,P9,1",
            "1010,2021-03-22,1,P1,0",
            "1001,2021-04-01,2,P1,5",
            "1011,2021-03-25,4,P1,1",
            "1012,2022-06-01,3,P3,5",
        ],
    );

    dir
}

fn run(dir: &TempDir, config: &PipelineConfig) -> PipelineOutput {
    let raw = load_raw_relations(dir.path(), &config.inputs).unwrap();
    run_pipeline(&raw, config).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn test_end_to_end_pipeline() {
    let extracts = create_test_extracts();
    let output = run(&extracts, &PipelineConfig::default());

    // Staging drops are counted per reason
    assert_eq!(output.staged.customers.len(), 4);
    assert_eq!(output.staged.categories.len(), 2);
    assert_eq!(output.staged.products.len(), 3);
    assert_eq!(output.staged.orders.len(), 8);

    let orders = output.staging_report.relation("orders").unwrap();
    assert_eq!(orders.raw_rows, 13);
    assert_eq!(orders.dropped_for("duplicate_key"), 1);
    assert_eq!(orders.dropped_for("unparseable_date"), 1);
    assert_eq!(orders.dropped_for("orphan_customer"), 1);
    assert_eq!(orders.dropped_for("orphan_product"), 1);
    assert_eq!(orders.dropped_for("invalid_quantity"), 1);

    let products = output.staging_report.relation("products").unwrap();
    assert_eq!(products.dropped_for("invalid_price"), 1);
    assert_eq!(products.dropped_for("missing_category"), 1);

    // Master: one row per resolvable order line, customer 4 guarded out
    assert_eq!(output.master.len(), 7);
    assert_eq!(output.master_report.null_guarded.get("customer_email"), Some(&1));
    for line in &output.master {
        assert_eq!(line.line_revenue, Decimal::from(line.quantity) * line.unit_price);
        assert!(line.quantity > 0);
        assert!(line.unit_price > Decimal::ZERO);
    }
    let total: Decimal = output.master.iter().map(|l| l.line_revenue).sum();
    assert_eq!(total, Decimal::new(108995, 2));

    // Star schema parity and reconciled views
    assert_eq!(output.star.fact_sales.len(), output.master.len());
    assert_eq!(output.star.dim_customer.len(), 3);
    assert_eq!(output.star.dim_product.len(), 3);
    assert!(output.check_guardrails().is_ok());
    let failures: Vec<_> = output.qa.failures().collect();
    assert!(failures.is_empty(), "{failures:?}");
}

#[test]
fn test_same_day_orders_sequence_deterministically() {
    let extracts = create_test_extracts();
    let output = run(&extracts, &PipelineConfig::default());

    let mut ann: Vec<_> = output
        .enriched
        .iter()
        .filter(|e| e.line.customer_email == "ann@x.com")
        .collect();
    ann.sort_by_key(|e| e.order_sequence_number);

    let products: Vec<&str> = ann.iter().map(|e| e.line.product_name.as_str()).collect();
    assert_eq!(products, vec!["Board Game", "Novel", "Atlas"]);
    let sequence: Vec<usize> = ann.iter().map(|e| e.order_sequence_number).collect();
    assert_eq!(sequence, vec![1, 2, 3]);
    let repeat: Vec<bool> = ann.iter().map(|e| e.is_repeat_customer).collect();
    assert_eq!(repeat, vec![false, true, true]);
    assert!(ann.iter().all(|e| e.first_order_date == date(2021, 1, 5)));
    assert_eq!(ann[2].days_since_first, 36);

    // 19.99 is under the first bound, 50.00 sits on the second
    assert_eq!(ann[1].price_bucket, "Under 20");
    assert_eq!(ann[0].price_bucket, "50–99.99");
    assert_eq!(ann[2].price_bucket, "100+");
}

#[test]
fn test_tier_granularity_toggle() {
    let extracts = create_test_extracts();
    let all_time = run(&extracts, &PipelineConfig::default());
    let per_year = run(
        &extracts,
        &PipelineConfig {
            per_year_tiers: true,
            ..PipelineConfig::default()
        },
    );

    let chicago_2021 = |output: &PipelineOutput| {
        output
            .enriched
            .iter()
            .find(|e| e.line.customer_city.as_deref() == Some("Chicago") && e.order_year == 2021)
            .map(|e| (e.city_tier.clone(), e.city_revenue))
            .unwrap()
    };

    // Chicago's 2022 order makes it the top city overall but not in 2021
    assert_eq!(chicago_2021(&all_time), ("Tier 1 (Top)".to_string(), Decimal::from(700)));
    assert_eq!(chicago_2021(&per_year), ("Tier 3 (Emerging)".to_string(), Decimal::from(100)));
}

#[test]
fn test_rebuild_is_idempotent() {
    let extracts = create_test_extracts();
    let config = PipelineConfig::default();
    let first = run(&extracts, &config);
    let second = run(&extracts, &config);

    assert_eq!(first.staged, second.staged);
    assert_eq!(first.master, second.master);
    assert_eq!(first.enriched, second.enriched);
    assert_eq!(first.star, second.star);
    assert_eq!(first.views, second.views);
    assert_eq!(first.qa, second.qa);
}

#[test]
fn test_metric_view_properties() {
    let extracts = create_test_extracts();
    let output = run(&extracts, &PipelineConfig::default());
    let views = &output.views;
    let base_total: Decimal = views.base.iter().map(|r| r.line_revenue).sum();

    // RFM: one row per customer, every score assigned
    assert_eq!(views.rfm.len(), 3);
    assert!(views
        .rfm
        .iter()
        .all(|r| (1..=5).contains(&r.r_score) && r.f_score >= 1 && r.m_score >= 1));

    // Cohorts: month zero is always complete
    for row in &views.cohort {
        assert!(row.months_since_first >= 0);
        if row.months_since_first == 0 {
            assert_eq!(row.retention_rate, Some(1.0));
        }
    }

    // Pareto: non-decreasing cumulative share ending at 1.0
    let shares: Vec<f64> = views.pareto.iter().filter_map(|p| p.cumulative_share).collect();
    assert!(shares.windows(2).all(|w| w[0] <= w[1]));
    assert!((shares.last().unwrap() - 1.0).abs() < 1e-9);
    assert_eq!(views.pareto[0].product_name, "Atlas");

    // CLV: revenue totals tie out to the base view
    let clv_total: Decimal = views.clv.iter().map(|c| c.revenue_total).sum();
    assert_eq!(clv_total, base_total);
    assert!(views.clv.iter().all(|c| c.clv == c.revenue_total * Decimal::new(30, 2)));

    // Monthly trend over the observed months
    let months: Vec<&str> = views.trend.iter().map(|t| t.year_month.as_str()).collect();
    assert_eq!(months, vec!["2021-01", "2021-02", "2021-03", "2022-06"]);
    assert_eq!(views.trend[0].sales_index, Some(1.0));
}

#[test]
fn test_narrow_date_dimension_fails_guardrail() {
    let extracts = create_test_extracts();
    let mut config = PipelineConfig::default();
    config.date_dimension.end = date(2021, 12, 31);
    let output = run(&extracts, &config);

    assert_eq!(output.star.fact_sales.len(), output.master.len() - 1);
    let parity = output.qa.find("star.row_parity").unwrap();
    assert_eq!(parity.status, QaStatus::Fail);

    match output.check_guardrails() {
        Err(PipelineError::Guardrail { check, .. }) => assert_eq!(check, "star.row_parity"),
        other => panic!("expected guardrail failure, got {:?}", other),
    }
}

#[test]
fn test_expected_master_rows_gate() {
    let extracts = create_test_extracts();
    let config = PipelineConfig {
        expected_master_rows: Some(42),
        ..PipelineConfig::default()
    };
    let raw = load_raw_relations(extracts.path(), &config.inputs).unwrap();
    let err = run_pipeline(&raw, &config).unwrap_err();

    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::RowCountMismatch { expected, actual, .. }) => {
            assert_eq!(*expected, 42);
            assert_eq!(*actual, 7);
        }
        other => panic!("expected row count mismatch, got {:?}", other),
    }
}

#[test]
fn test_missing_input_is_reported() {
    let extracts = create_test_extracts();
    fs::remove_file(extracts.path().join("orders.csv")).unwrap();

    let err = load_raw_relations(extracts.path(), &PipelineConfig::default().inputs).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::MissingInput { relation, .. }) if relation == "orders"
    ));
}

#[test]
fn test_write_relations() {
    let extracts = create_test_extracts();
    let output = run(&extracts, &PipelineConfig::default());
    let out_dir = TempDir::new().unwrap();

    let written = write_relations(out_dir.path(), &output).unwrap();
    assert_eq!(written.len(), 32);

    for name in [
        "stg_orders",
        "master_sales",
        "enriched_sales",
        "dim_date",
        "fact_sales",
        "vw_sales_base",
        "vw_sales_trend",
        "vw_rfm",
        "vw_cohort_retention",
        "vw_pareto_products",
        "vw_clv",
        "qa_checks",
        "qa_row_reconciliation",
        "qa_master_sample",
    ] {
        assert!(out_dir.path().join(format!("{}.csv", name)).exists(), "missing {}", name);
    }

    let fact = fs::read_to_string(out_dir.path().join("fact_sales.csv")).unwrap();
    assert_eq!(fact.lines().count(), 1 + output.star.fact_sales.len());
    assert!(fact.starts_with("date_key,customer_key,product_key,quantity,unit_price,line_revenue"));

    // A second write replaces, never appends
    write_relations(out_dir.path(), &output).unwrap();
    let again = fs::read_to_string(out_dir.path().join("fact_sales.csv")).unwrap();
    assert_eq!(fact, again);
}
