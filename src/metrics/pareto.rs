//! Pareto (80/20) concentration of revenue across products

use polars::prelude::*;
use rust_decimal::Decimal;

use crate::frame::{amount_order, decimal_values, stable_sort_desc, str_values};
use crate::star::product_key;
use crate::stats::share;

/// Cumulative revenue share at or below which a product is in the top set.
pub const PARETO_THRESHOLD: Decimal = Decimal::from_parts(80, 0, 0, false, 2);

#[derive(Debug, Clone, PartialEq)]
pub struct ParetoRow {
    pub product_key: i64,
    pub product_name: String,
    pub category_name: String,
    pub revenue: Decimal,
    /// Dense rank by descending revenue; equal revenue shares a rank
    pub revenue_rank: usize,
    /// Revenue of every product ranked at or above this one, peers included
    pub cumulative_revenue: Decimal,
    pub cumulative_share: Option<f64>,
    pub is_top_80: bool,
}

/// Products ordered by descending revenue, then name and category.
///
/// The running total is a range over revenue: products with equal revenue
/// are peers and share one cumulative value, so a tie is either wholly
/// inside the top set or wholly outside it.
pub fn pareto_products(base: &DataFrame) -> PolarsResult<Vec<ParetoRow>> {
    let products = base
        .clone()
        .lazy()
        .group_by([col("product_name"), col("category_name")])
        .agg([col("line_revenue").sum().alias("revenue")])
        .sort_by_exprs(
            [amount_order("revenue"), col("product_name"), col("category_name")],
            stable_sort_desc([true, false, false]),
        )
        .collect()?;

    let names = str_values(&products, "product_name")?;
    let categories = str_values(&products, "category_name")?;
    let revenues = decimal_values(&products, "revenue")?;
    let total: Decimal = revenues.iter().sum();

    let mut rows = Vec::with_capacity(revenues.len());
    let mut products = names.into_iter().zip(categories).zip(revenues.iter().copied());
    let mut cumulative = Decimal::ZERO;
    let mut start = 0;
    while start < revenues.len() {
        let revenue = revenues[start];
        let end = revenues[start..]
            .iter()
            .position(|r| *r != revenue)
            .map_or(revenues.len(), |offset| start + offset);
        cumulative += revenues[start..end].iter().sum::<Decimal>();
        let rank = rows.last().map_or(1, |p: &ParetoRow| p.revenue_rank + 1);
        let is_top_80 = cumulative.checked_div(total).is_some_and(|s| s <= PARETO_THRESHOLD);

        for ((name, category), revenue) in products.by_ref().take(end - start) {
            rows.push(ParetoRow {
                product_key: product_key(&name, &category),
                product_name: name,
                category_name: category,
                revenue,
                revenue_rank: rank,
                cumulative_revenue: cumulative,
                cumulative_share: share(cumulative, total),
                is_top_80,
            });
        }
        start = end;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::base::base_frame;
    use crate::metrics::fixtures::{base, date, sale};

    #[test]
    fn test_pareto_ranks_and_shares() {
        let d = date(2021, 1, 5);
        let base = base(&[
            sale("a@x.com", "Austin", d, "Big", "Books", 6000, 1),
            sale("a@x.com", "Austin", d, "Mid A", "Books", 1500, 1),
            sale("b@x.com", "Boston", d, "Mid B", "Books", 1500, 1),
            sale("b@x.com", "Boston", d, "Small", "Books", 1000, 1),
        ]);
        let pareto = pareto_products(&base).unwrap();

        let ranks: Vec<usize> = pareto.iter().map(|p| p.revenue_rank).collect();
        assert_eq!(ranks, vec![1, 2, 2, 3]);
        let names: Vec<&str> = pareto.iter().map(|p| p.product_name.as_str()).collect();
        assert_eq!(names, vec!["Big", "Mid A", "Mid B", "Small"]);

        let shares: Vec<f64> = pareto.iter().filter_map(|p| p.cumulative_share).collect();
        assert_eq!(shares, vec![0.6, 0.9, 0.9, 1.0]);
        let top: Vec<bool> = pareto.iter().map(|p| p.is_top_80).collect();
        assert_eq!(top, vec![true, false, false, false]);
    }

    #[test]
    fn test_tied_products_share_their_cumulative_position() {
        let d = date(2021, 1, 5);
        let base = base(&[
            sale("a@x.com", "Austin", d, "Alpha", "Books", 2000, 1),
            sale("a@x.com", "Austin", d, "Beta", "Books", 2000, 1),
            sale("b@x.com", "Boston", d, "Gamma", "Books", 2000, 1),
            sale("b@x.com", "Boston", d, "Delta", "Books", 2000, 1),
            sale("b@x.com", "Boston", d, "Omega", "Books", 2000, 1),
        ]);
        let pareto = pareto_products(&base).unwrap();
        assert_eq!(pareto.len(), 5);
        assert!(pareto.iter().all(|p| p.revenue_rank == 1));
        assert!(pareto.iter().all(|p| p.cumulative_revenue == Decimal::from(100)));
        assert!(pareto.iter().all(|p| !p.is_top_80));
    }

    #[test]
    fn test_pareto_empty() {
        assert!(pareto_products(&base_frame(&[]).unwrap()).unwrap().is_empty());
    }
}
