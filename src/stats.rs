//! Small numeric helpers shared by profiling, tiering and metric views

use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::frame::opt_f64_values;

const VALUE: &str = "value";

/// Division that yields `None` instead of an error, NaN or infinity.
pub fn safe_div(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 {
        return None;
    }
    let value = numerator / denominator;
    value.is_finite().then_some(value)
}

/// Exact decimal division, `None` on a zero denominator.
pub fn safe_div_decimal(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    numerator.checked_div(denominator)
}

/// Decimal share rendered as `f64`, `None` on a zero denominator.
pub fn share(part: Decimal, total: Decimal) -> Option<f64> {
    safe_div_decimal(part, total).and_then(|d| d.to_f64())
}

/// 1-based `NTILE(buckets)` for the row at `position` (0-based) in an ordered
/// set of `rows`. Earlier buckets take the remainder, so sizes differ by at
/// most one.
pub fn ntile(position: usize, rows: usize, buckets: usize) -> usize {
    debug_assert!(position < rows && buckets > 0);
    let base = rows / buckets;
    let remainder = rows % buckets;
    let large = remainder * (base + 1);
    if position < large {
        position / (base + 1) + 1
    } else {
        remainder + (position - large) / base + 1
    }
}

/// Descriptive statistics for one numeric column.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
    pub mean: f64,
    /// Sample standard deviation; `None` below two values
    pub stddev: Option<f64>,
}

impl Summary {
    /// Quartiles interpolate linearly between neighbouring values.
    pub fn from_values(values: &[f64]) -> PolarsResult<Option<Self>> {
        if values.is_empty() {
            return Ok(None);
        }
        let quartile = |q: f64| col(VALUE).quantile(lit(q), QuantileMethod::Linear);
        let stats = DataFrame::new(vec![Column::new(VALUE.into(), values.to_vec())])?
            .lazy()
            .select([
                col(VALUE).min().alias("min"),
                quartile(0.25).alias("q1"),
                col(VALUE).median().alias("median"),
                quartile(0.75).alias("q3"),
                col(VALUE).max().alias("max"),
                col(VALUE).mean().alias("mean"),
                col(VALUE).std(1).alias("stddev"),
            ])
            .collect()?;

        let stat = |name: &str| -> PolarsResult<Option<f64>> {
            Ok(opt_f64_values(&stats, name)?.first().copied().flatten())
        };
        let required = |name: &str| -> PolarsResult<f64> {
            stat(name)?.ok_or_else(|| {
                PolarsError::ComputeError(format!("no {name} for a non-empty column").into())
            })
        };

        Ok(Some(Self {
            count: values.len(),
            min: required("min")?,
            q1: required("q1")?,
            median: required("median")?,
            q3: required("q3")?,
            max: required("max")?,
            mean: required("mean")?,
            stddev: stat("stddev")?.filter(|_| values.len() > 1),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(3.0, 2.0), Some(1.5));
        assert_eq!(safe_div(1.0, 0.0), None);
        assert_eq!(safe_div(0.0, 0.0), None);
        assert_eq!(safe_div_decimal(Decimal::ONE, Decimal::ZERO), None);
        assert_eq!(share(Decimal::from(1), Decimal::from(4)), Some(0.25));
    }

    #[test]
    fn test_ntile_matches_sql_bucket_sizes() {
        // 7 rows into 3 buckets: sizes 3, 2, 2
        let tiles: Vec<usize> = (0..7).map(|i| ntile(i, 7, 3)).collect();
        assert_eq!(tiles, vec![1, 1, 1, 2, 2, 3, 3]);

        // Fewer rows than buckets
        let tiles: Vec<usize> = (0..2).map(|i| ntile(i, 2, 5)).collect();
        assert_eq!(tiles, vec![1, 2]);
    }

    #[test]
    fn test_summary() {
        let summary = Summary::from_values(&[4.0, 1.0, 3.0, 2.0]).unwrap().unwrap();
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 4.0);
        assert_eq!(summary.median, 2.5);
        assert_eq!(summary.q1, 1.75);
        assert_eq!(summary.mean, 2.5);
        assert!((summary.stddev.unwrap() - 1.290_994_448_7).abs() < 1e-9);

        assert_eq!(summary.q3, 3.25);
        assert_eq!(summary.count, 4);

        assert!(Summary::from_values(&[]).unwrap().is_none());
        let single = Summary::from_values(&[5.0]).unwrap().unwrap();
        assert_eq!((single.q1, single.q3, single.stddev), (5.0, 5.0, None));
    }

    proptest! {
        #[test]
        fn prop_ntile_is_monotonic_and_balanced(rows in 1usize..200, buckets in 1usize..10) {
            let tiles: Vec<usize> = (0..rows).map(|i| ntile(i, rows, buckets)).collect();
            prop_assert_eq!(tiles[0], 1);
            prop_assert!(tiles.windows(2).all(|w| w[0] <= w[1] && w[1] - w[0] <= 1));
            prop_assert_eq!(*tiles.last().unwrap(), buckets.min(rows));

            let mut sizes = vec![0usize; buckets.min(rows)];
            for tile in &tiles {
                sizes[tile - 1] += 1;
            }
            let max = *sizes.iter().max().unwrap();
            let min = *sizes.iter().min().unwrap();
            prop_assert!(max - min <= 1);
        }
    }
}
