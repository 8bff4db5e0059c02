//! Month-over-month, year-over-year, indexed and smoothed revenue series

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::rollup::Rollup;
use crate::stats::{safe_div_decimal, share};

/// Trailing moving-average window: current month plus two preceding.
pub const MOVING_AVERAGE_WINDOW: usize = 3;
pub const YEAR_LAG: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyTrend {
    pub year_month: String,
    pub revenue: Decimal,
    pub quantity: i64,
    pub revenue_prev_month: Option<Decimal>,
    pub sales_mom_pct: Option<f64>,
    pub revenue_prev_year: Option<Decimal>,
    pub sales_yoy_pct: Option<f64>,
    /// Ratio to the first month's revenue
    pub sales_index: Option<f64>,
    /// Average over the available trailing window
    pub revenue_ma3: Option<f64>,
}

/// Relative change, `None` without a previous value or on a zero base.
pub fn pct_change(current: Decimal, previous: Option<Decimal>) -> Option<f64> {
    let previous = previous?;
    safe_div_decimal(current - previous, previous).and_then(|d| d.to_f64())
}

/// Lags are positional over the ordered months: a gap month is not filled.
pub fn monthly_trend(months: &[Rollup<String>]) -> Vec<MonthlyTrend> {
    let baseline = months.first().map(|m| m.revenue);

    months
        .iter()
        .enumerate()
        .map(|(i, month)| {
            let lag = |n: usize| i.checked_sub(n).map(|j| months[j].revenue);
            let window = &months[i.saturating_sub(MOVING_AVERAGE_WINDOW - 1)..=i];
            let window_sum: Decimal = window.iter().map(|m| m.revenue).sum();

            MonthlyTrend {
                year_month: month.key.clone(),
                revenue: month.revenue,
                quantity: month.quantity,
                revenue_prev_month: lag(1),
                sales_mom_pct: pct_change(month.revenue, lag(1)),
                revenue_prev_year: lag(YEAR_LAG),
                sales_yoy_pct: pct_change(month.revenue, lag(YEAR_LAG)),
                sales_index: baseline.and_then(|base| share(month.revenue, base)),
                revenue_ma3: safe_div_decimal(window_sum, Decimal::from(window.len()))
                    .and_then(|d| d.to_f64()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(label: &str, revenue: i64) -> Rollup<String> {
        Rollup {
            key: label.to_string(),
            revenue: Decimal::from(revenue),
            quantity: 1,
            lines: 1,
            orders: 1,
            customers: 1,
            asp: None,
            aov: None,
        }
    }

    #[test]
    fn test_mom_and_index() {
        let months = vec![month("2021-01", 100), month("2021-02", 150), month("2021-03", 120)];
        let trend = monthly_trend(&months);

        let mom: Vec<Option<f64>> = trend.iter().map(|t| t.sales_mom_pct).collect();
        assert_eq!(mom, vec![None, Some(0.5), Some(-0.2)]);
        let index: Vec<Option<f64>> = trend.iter().map(|t| t.sales_index).collect();
        assert_eq!(index, vec![Some(1.0), Some(1.5), Some(1.2)]);

        assert_eq!(trend[0].revenue_ma3, Some(100.0));
        assert_eq!(trend[1].revenue_ma3, Some(125.0));
        assert_eq!(trend[2].sales_yoy_pct, None);
    }

    #[test]
    fn test_year_over_year_lag() {
        let months: Vec<Rollup<String>> = (0..13)
            .map(|i| month(&format!("{}-{:02}", 2020 + i / 12, i % 12 + 1), 100 + i as i64 * 10))
            .collect();
        let trend = monthly_trend(&months);
        assert_eq!(trend[12].revenue_prev_year, Some(Decimal::from(100)));
        assert_eq!(trend[12].sales_yoy_pct, Some(1.2));
        assert_eq!(trend[12].revenue_ma3, Some(210.0));
    }

    #[test]
    fn test_zero_base_yields_none() {
        let months = vec![month("2021-01", 0), month("2021-02", 50)];
        let trend = monthly_trend(&months);
        assert_eq!(trend[1].sales_mom_pct, None);
        assert_eq!(trend[1].sales_index, None);
    }
}
