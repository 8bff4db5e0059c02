//! Re-runnable reconciliation of metric views against the base view

use std::collections::{BTreeMap, HashSet};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::rollup::Rollup;
use super::MetricViews;
use crate::model::year_month_label;
use crate::qa::{QaCheck, Stage};

/// Revenue and quantity of one month. Quantities widen to `i128` so a
/// recomputed sum cannot wrap.
type MonthTotals = (Decimal, i128);

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

/// Months where `view` disagrees with `expected` on revenue (within
/// tolerance) or quantity, including months present on only one side.
fn mismatched_months(
    expected: &BTreeMap<String, MonthTotals>,
    view: &BTreeMap<String, MonthTotals>,
    tolerance: f64,
) -> Vec<String> {
    let months: HashSet<&String> = expected.keys().chain(view.keys()).collect();
    let mut mismatched: Vec<String> = months
        .into_iter()
        .filter(|month| {
            let (er, eq) = expected.get(*month).copied().unwrap_or((Decimal::ZERO, 0));
            let (vr, vq) = view.get(*month).copied().unwrap_or((Decimal::ZERO, 0));
            (to_f64(er) - to_f64(vr)).abs() > tolerance || eq != vq
        })
        .cloned()
        .collect();
    mismatched.sort();
    mismatched
}

fn month_check(
    name: &str,
    expected: &BTreeMap<String, MonthTotals>,
    view: &BTreeMap<String, MonthTotals>,
    tolerance: f64,
) -> QaCheck {
    let mismatched = mismatched_months(expected, view, tolerance);
    QaCheck::equals(Stage::MetricViews, name, mismatched.len(), 0)
        .with_detail(mismatched.join(","))
}

fn total_check<K>(name: &str, view: &[Rollup<K>], expected: Decimal, tolerance: f64) -> QaCheck {
    let total: Decimal = view.iter().map(|r| r.revenue).sum();
    QaCheck::approx(Stage::MetricViews, name, to_f64(total), to_f64(expected), tolerance)
}

/// Recompute monthly aggregates from the base view independently and
/// compare every derived view against them. Pure: safe to re-run against
/// any built view set.
pub fn reconcile_views(views: &MetricViews, tolerance: f64) -> Vec<QaCheck> {
    let mut expected: BTreeMap<String, MonthTotals> = BTreeMap::new();
    for row in &views.base {
        let entry = expected.entry(row.year_month.clone()).or_insert((Decimal::ZERO, 0));
        entry.0 += row.line_revenue;
        entry.1 += i128::from(row.quantity);
    }
    let base_total: Decimal = views.base.iter().map(|r| r.line_revenue).sum();

    let monthly: BTreeMap<String, MonthTotals> = views
        .monthly
        .iter()
        .map(|m| (m.key.clone(), (m.revenue, i128::from(m.quantity))))
        .collect();
    let trend: BTreeMap<String, MonthTotals> = views
        .trend
        .iter()
        .map(|t| (t.year_month.clone(), (t.revenue, i128::from(t.quantity))))
        .collect();
    let mut daily: BTreeMap<String, MonthTotals> = BTreeMap::new();
    for day in &views.daily {
        let entry = daily
            .entry(year_month_label(day.key))
            .or_insert((Decimal::ZERO, 0));
        entry.0 += day.revenue;
        entry.1 += i128::from(day.quantity);
    }

    let mut checks = vec![
        month_check("views.monthly_reconciles", &expected, &monthly, tolerance),
        month_check("views.trend_reconciles", &expected, &trend, tolerance),
        month_check("views.daily_reconciles", &expected, &daily, tolerance),
        total_check("views.weekday_total", &views.weekday, base_total, tolerance),
        total_check("views.city_total", &views.city, base_total, tolerance),
        total_check("views.category_total", &views.category, base_total, tolerance),
        total_check("views.product_total", &views.product, base_total, tolerance),
        total_check("views.price_bucket_total", &views.price_bucket, base_total, tolerance),
    ];

    let customers: HashSet<i64> = views.base.iter().map(|r| r.customer_key).collect();
    let rfm_customers: HashSet<i64> = views.rfm.iter().map(|r| r.customer_key).collect();
    let unscored = views
        .rfm
        .iter()
        .filter(|r| r.r_score == 0 || r.f_score == 0 || r.m_score == 0)
        .count();
    let stage = Stage::MetricViews;
    checks.push(QaCheck::equals(stage, "views.rfm_customers", views.rfm.len(), customers.len()));
    checks.push(QaCheck::equals(stage, "views.rfm_unique", rfm_customers.len(), views.rfm.len()));
    checks.push(QaCheck::equals(stage, "views.rfm_unscored", unscored, 0));

    let month_zero_off = views
        .cohort
        .iter()
        .filter(|c| c.months_since_first == 0 && c.retention_rate != Some(1.0))
        .count();
    let negative_offsets = views.cohort.iter().filter(|c| c.months_since_first < 0).count();
    checks.push(QaCheck::equals(stage, "views.cohort_month_zero", month_zero_off, 0));
    checks.push(QaCheck::equals(stage, "views.cohort_negative_offsets", negative_offsets, 0));

    let shares: Vec<f64> = views.pareto.iter().filter_map(|p| p.cumulative_share).collect();
    let decreasing = shares.windows(2).filter(|w| w[1] < w[0]).count();
    checks.push(QaCheck::equals(stage, "views.pareto_monotonic", decreasing, 0));
    if let Some(max) = shares.iter().copied().reduce(f64::max) {
        checks.push(QaCheck::approx(stage, "views.pareto_max_share", max, 1.0, tolerance));
    }

    let clv_total: Decimal = views.clv.iter().map(|c| c.revenue_total).sum();
    checks.push(QaCheck::approx(
        stage,
        "views.clv_revenue_total",
        to_f64(clv_total),
        to_f64(base_total),
        tolerance,
    ));

    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::metrics::build_metric_views;
    use crate::metrics::fixtures::{date, sale};
    use crate::star::build_star_schema;

    fn views() -> MetricViews {
        let master = vec![
            sale("a@x.com", "Austin", date(2021, 1, 5), "P1", "Books", 1999, 2),
            sale("a@x.com", "Austin", date(2021, 2, 5), "P2", "Games", 5000, 1),
            sale("b@x.com", "Boston", date(2021, 2, 7), "P1", "Books", 1999, 3),
            sale("c@x.com", "Chicago", date(2021, 4, 1), "P3", "Games", 12000, 1),
        ];
        let config = PipelineConfig::default();
        let (schema, _) = build_star_schema(&master, &config.date_dimension).unwrap();
        build_metric_views(&schema, &config).unwrap()
    }

    #[test]
    fn test_views_reconcile() {
        let views = views();
        let checks = reconcile_views(&views, 1e-9);
        let failed: Vec<&QaCheck> = checks.iter().filter(|c| !c.passed()).collect();
        assert!(failed.is_empty(), "failed checks: {failed:?}");
    }

    #[test]
    fn test_tampered_view_is_detected() {
        let mut views = views();
        views.monthly[0].revenue += Decimal::ONE;
        views.cohort[0].retention_rate = Some(0.5);
        let checks = reconcile_views(&views, 1e-9);

        let monthly = checks.iter().find(|c| c.check == "views.monthly_reconciles").unwrap();
        assert!(!monthly.passed());
        assert_eq!(monthly.detail, "2021-01");
        let cohort = checks.iter().find(|c| c.check == "views.cohort_month_zero").unwrap();
        assert!(!cohort.passed());
    }

    #[test]
    fn test_oversized_base_quantities_are_reported_not_wrapped() {
        let mut views = views();
        views.base[1].quantity = i64::MAX;
        views.base[2].quantity = i64::MAX;
        let checks = reconcile_views(&views, 1e-9);

        let monthly = checks.iter().find(|c| c.check == "views.monthly_reconciles").unwrap();
        assert!(!monthly.passed());
        assert_eq!(monthly.detail, "2021-02");
    }
}
