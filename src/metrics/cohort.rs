//! Monthly cohort retention

use polars::prelude::*;

use crate::frame::{count_values, i64_values, stable_sort};
use crate::stats::safe_div;

#[derive(Debug, Clone, PartialEq)]
pub struct CohortRow {
    /// First purchase month, `YYYY-MM`
    pub cohort_month: String,
    pub months_since_first: i64,
    pub active_customers: usize,
    pub cohort_size: usize,
    pub retention_rate: Option<f64>,
}

fn month_label(month_index: i64) -> String {
    format!("{:04}-{:02}", month_index.div_euclid(12), month_index.rem_euclid(12) + 1)
}

/// One row per (cohort, offset) with activity, ordered by cohort then offset.
pub fn cohort_retention(base: &DataFrame) -> PolarsResult<Vec<CohortRow>> {
    let cells = base
        .clone()
        .lazy()
        .with_column(col("month_index").min().over([col("customer_key")]).alias("cohort"))
        .with_column((col("month_index") - col("cohort")).alias("offset"))
        .group_by([col("cohort"), col("offset")])
        .agg([col("customer_key").n_unique().alias("active")])
        .sort_by_exprs([col("cohort"), col("offset")], stable_sort())
        // offset 0 leads every cohort: its customers all bought in that month
        .with_column(col("active").first().over([col("cohort")]).alias("cohort_size"))
        .collect()?;

    let cohorts = i64_values(&cells, "cohort")?;
    let offsets = i64_values(&cells, "offset")?;
    let active = count_values(&cells, "active")?;
    let sizes = count_values(&cells, "cohort_size")?;

    let rows = cohorts
        .into_iter()
        .zip(offsets)
        .zip(active.into_iter().zip(sizes))
        .map(|((cohort, offset), (active, size))| CohortRow {
            cohort_month: month_label(cohort),
            months_since_first: offset,
            active_customers: active,
            cohort_size: size,
            retention_rate: safe_div(active as f64, size as f64),
        })
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::fixtures::{base, date, sale};

    #[test]
    fn test_cohort_retention() {
        let base = base(&[
            sale("a@x.com", "Austin", date(2021, 1, 5), "P1", "Books", 1000, 1),
            sale("b@x.com", "Boston", date(2021, 1, 20), "P1", "Books", 1000, 1),
            sale("a@x.com", "Austin", date(2021, 3, 2), "P1", "Books", 1000, 1),
            sale("c@x.com", "Chicago", date(2021, 2, 2), "P1", "Books", 1000, 1),
            sale("c@x.com", "Chicago", date(2021, 2, 9), "P1", "Books", 1000, 1),
        ]);
        let cohorts = cohort_retention(&base).unwrap();

        let summary: Vec<(&str, i64, usize, Option<f64>)> = cohorts
            .iter()
            .map(|c| {
                let offset = c.months_since_first;
                (c.cohort_month.as_str(), offset, c.active_customers, c.retention_rate)
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("2021-01", 0, 2, Some(1.0)),
                ("2021-01", 2, 1, Some(0.5)),
                ("2021-02", 0, 1, Some(1.0)),
            ]
        );
    }

    #[test]
    fn test_cohort_spans_year_boundary() {
        let base = base(&[
            sale("a@x.com", "Austin", date(2020, 12, 30), "P1", "Books", 1000, 1),
            sale("a@x.com", "Austin", date(2021, 1, 2), "P1", "Books", 1000, 1),
        ]);
        let cohorts = cohort_retention(&base).unwrap();
        assert_eq!(cohorts[0].cohort_month, "2020-12");
        assert_eq!(cohorts[1].months_since_first, 1);
        assert!(cohorts.iter().all(|c| c.months_since_first >= 0));
    }
}
