//! RFM segmentation
//!
//! Recency is measured against the latest order date in the base view, so
//! re-running on the same data yields the same scores.

use chrono::NaiveDate;
use polars::prelude::*;
use rust_decimal::Decimal;

use crate::config::{RfmConfig, SegmentThresholds};
use crate::frame::{
    amount_order, count_values, date_values, decimal_values, i64_values, stable_sort,
    stable_sort_desc, str_values,
};
use crate::stats::ntile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    Champions,
    Loyal,
    NewCustomers,
    AtRisk,
    Lost,
    Regulars,
}

impl Segment {
    /// First matching rule wins: Champions, Loyal, New Customers, At Risk,
    /// Lost, otherwise Regulars.
    pub fn assign(r: u32, f: u32, m: u32, t: &SegmentThresholds) -> Self {
        if r >= t.champions_min_r && f >= t.champions_min_f && m >= t.champions_min_m {
            Segment::Champions
        } else if r >= t.loyal_min_r && f >= t.loyal_min_f {
            Segment::Loyal
        } else if r >= t.new_min_r && f <= t.new_max_f {
            Segment::NewCustomers
        } else if r <= t.at_risk_max_r && f >= t.at_risk_min_f {
            Segment::AtRisk
        } else if r <= t.lost_max_r && f <= t.lost_max_f {
            Segment::Lost
        } else {
            Segment::Regulars
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Champions => "Champions",
            Segment::Loyal => "Loyal",
            Segment::NewCustomers => "New Customers",
            Segment::AtRisk => "At Risk",
            Segment::Lost => "Lost",
            Segment::Regulars => "Regulars",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RfmRow {
    pub customer_key: i64,
    pub customer_email: String,
    pub last_purchase: NaiveDate,
    pub recency_days: i64,
    /// Distinct purchase days
    pub frequency: usize,
    pub monetary: Decimal,
    pub r_score: u32,
    pub f_score: u32,
    pub m_score: u32,
    pub segment: Segment,
}

impl RfmRow {
    /// Scores concatenated, e.g. `"545"`.
    pub fn rfm_code(&self) -> String {
        format!("{}{}{}", self.r_score, self.f_score, self.m_score)
    }
}

/// One row per customer in the base view, ordered by email.
///
/// Each score is the NTILE of the customer's position in one ordering;
/// ties in any ordering break by email.
pub fn rfm_segments(base: &DataFrame, config: &RfmConfig) -> PolarsResult<Vec<RfmRow>> {
    let last_day = col("last_purchase").cast(DataType::Int32);
    let customers = base
        .clone()
        .lazy()
        .group_by([col("customer_key")])
        .agg([
            col("customer_email").first(),
            col("order_date").max().alias("last_purchase"),
            col("order_date").n_unique().alias("frequency"),
            col("line_revenue").sum().alias("monetary"),
        ])
        .with_column((last_day.clone().max() - last_day).alias("recency_days"))
        // Most days since last purchase scores lowest
        .sort_by_exprs(
            [col("recency_days"), col("customer_email")],
            stable_sort_desc([true, false]),
        )
        .with_row_index("r_position", None)
        .sort_by_exprs([col("frequency"), col("customer_email")], stable_sort())
        .with_row_index("f_position", None)
        .sort_by_exprs([amount_order("monetary"), col("customer_email")], stable_sort())
        .with_row_index("m_position", None)
        .sort_by_exprs([col("customer_email")], stable_sort())
        .collect()?;

    let n = customers.height();
    let buckets = config.quantiles;
    let score = |positions: Vec<usize>| -> Vec<u32> {
        positions.into_iter().map(|p| ntile(p, n, buckets) as u32).collect()
    };
    let r_scores = score(count_values(&customers, "r_position")?);
    let f_scores = score(count_values(&customers, "f_position")?);
    let m_scores = score(count_values(&customers, "m_position")?);

    let keys = i64_values(&customers, "customer_key")?;
    let last_purchases = date_values(&customers, "last_purchase")?;
    let recency = i64_values(&customers, "recency_days")?;
    let frequency = count_values(&customers, "frequency")?;
    let monetary = decimal_values(&customers, "monetary")?;

    let rows = str_values(&customers, "customer_email")?
        .into_iter()
        .enumerate()
        .map(|(i, email)| {
            let (r, f, m) = (r_scores[i], f_scores[i], m_scores[i]);
            RfmRow {
                customer_key: keys[i],
                customer_email: email,
                last_purchase: last_purchases[i],
                recency_days: recency[i],
                frequency: frequency[i],
                monetary: monetary[i],
                r_score: r,
                f_score: f,
                m_score: m,
                segment: Segment::assign(r, f, m, &config.thresholds),
            }
        })
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::fixtures::{base, date, sale};

    #[test]
    fn test_segment_precedence() {
        let t = SegmentThresholds::default();
        assert_eq!(Segment::assign(5, 5, 5, &t), Segment::Champions);
        assert_eq!(Segment::assign(3, 4, 1, &t), Segment::Loyal);
        assert_eq!(Segment::assign(5, 1, 1, &t), Segment::NewCustomers);
        assert_eq!(Segment::assign(1, 3, 5, &t), Segment::AtRisk);
        assert_eq!(Segment::assign(1, 1, 1, &t), Segment::Lost);
        assert_eq!(Segment::assign(3, 3, 3, &t), Segment::Regulars);
        assert_eq!(Segment::NewCustomers.as_str(), "New Customers");
    }

    #[test]
    fn test_scores_and_recency() {
        let base = base(&[
            sale("a@x.com", "Austin", date(2021, 1, 1), "P1", "Books", 1000, 1),
            sale("a@x.com", "Austin", date(2021, 1, 1), "P2", "Books", 1000, 1),
            sale("b@x.com", "Boston", date(2021, 3, 1), "P1", "Books", 1000, 5),
            sale("b@x.com", "Boston", date(2021, 2, 1), "P1", "Books", 1000, 1),
            sale("c@x.com", "Chicago", date(2021, 2, 15), "P1", "Books", 1000, 1),
        ]);
        let config = RfmConfig::default();
        let rfm = rfm_segments(&base, &config).unwrap();

        assert_eq!(rfm.len(), 3);
        let emails: Vec<&str> = rfm.iter().map(|r| r.customer_email.as_str()).collect();
        assert_eq!(emails, vec!["a@x.com", "b@x.com", "c@x.com"]);

        let (a, b, c) = (&rfm[0], &rfm[1], &rfm[2]);
        assert_eq!(b.recency_days, 0);
        assert_eq!(a.recency_days, 59);
        assert_eq!(a.frequency, 1);
        assert_eq!(b.frequency, 2);
        assert_eq!(b.monetary, Decimal::from(60));

        // 3 customers over 5 buckets: one per bucket
        assert_eq!((a.r_score, c.r_score, b.r_score), (1, 2, 3));
        assert_eq!((a.f_score, c.f_score, b.f_score), (1, 2, 3));
        assert_eq!((c.m_score, a.m_score, b.m_score), (1, 2, 3));
        assert_eq!(b.rfm_code(), "333");
    }
}
