//! Metric view layer
//!
//! A single base view over the star schema, and every downstream view
//! (rollups, trend, RFM, cohorts, Pareto, CLV) composed from it.

pub mod base;
pub mod clv;
pub mod cohort;
pub mod pareto;
pub mod reconcile;
pub mod rfm;
pub mod rollup;
pub mod trend;

use chrono::NaiveDate;
use polars::prelude::PolarsResult;
use tracing::{debug, info_span};

use crate::config::PipelineConfig;
use crate::enrich::PriceBucket;
use crate::star::StarSchema;

pub use base::{base_frame, build_base_view, BaseRow};
pub use clv::{customer_lifetime_value, ClvRow};
pub use cohort::{cohort_retention, CohortRow};
pub use pareto::{pareto_products, ParetoRow};
pub use reconcile::reconcile_views;
pub use rfm::{rfm_segments, RfmRow, Segment};
pub use rollup::{rollup_by, Rollup};
pub use trend::{monthly_trend, MonthlyTrend};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricViews {
    pub base: Vec<BaseRow>,
    pub daily: Vec<Rollup<NaiveDate>>,
    pub monthly: Vec<Rollup<String>>,
    pub weekday: Vec<Rollup<(u32, String)>>,
    pub city: Vec<Rollup<Option<String>>>,
    pub category: Vec<Rollup<String>>,
    pub product: Vec<Rollup<(String, String)>>,
    pub price_bucket: Vec<Rollup<(PriceBucket, String)>>,
    pub trend: Vec<MonthlyTrend>,
    pub rfm: Vec<RfmRow>,
    pub cohort: Vec<CohortRow>,
    pub pareto: Vec<ParetoRow>,
    pub clv: Vec<ClvRow>,
}

/// Build the base view, then every metric view from its frame.
pub fn build_metric_views(
    schema: &StarSchema,
    config: &PipelineConfig,
) -> PolarsResult<MetricViews> {
    let _span = info_span!("metric_view_layer").entered();

    let base = build_base_view(schema, &config.price_buckets)?;
    let frame = base_frame(&base)?;
    let monthly = rollup::monthly(&frame)?;
    let views = MetricViews {
        daily: rollup::daily(&frame)?,
        weekday: rollup::by_weekday(&frame)?,
        city: rollup::by_city(&frame)?,
        category: rollup::by_category(&frame)?,
        product: rollup::by_product(&frame)?,
        price_bucket: rollup::by_price_bucket(&frame)?,
        trend: monthly_trend(&monthly),
        rfm: rfm_segments(&frame, &config.rfm)?,
        cohort: cohort_retention(&frame)?,
        pareto: pareto_products(&frame)?,
        clv: customer_lifetime_value(&frame, config.margin_rate)?,
        monthly,
        base,
    };

    debug!(
        base = views.base.len(),
        months = views.monthly.len(),
        customers = views.rfm.len(),
        products = views.pareto.len(),
        cohort_cells = views.cohort.len(),
        "metric views built"
    );
    Ok(views)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::NaiveDate;
    use polars::prelude::DataFrame;
    use rust_decimal::Decimal;

    use super::base::{base_frame, build_base_view, BaseRow};
    use crate::config::PipelineConfig;
    use crate::model::MasterSalesLine;
    use crate::star::build_star_schema;

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// A master line priced in cents.
    pub fn sale(
        email: &str,
        city: &str,
        order_date: NaiveDate,
        product: &str,
        category: &str,
        price_cents: i64,
        quantity: i64,
    ) -> MasterSalesLine {
        let unit_price = Decimal::new(price_cents, 2);
        MasterSalesLine {
            customer_email: email.to_string(),
            customer_city: Some(city.to_string()),
            order_date,
            quantity,
            product_name: product.to_string(),
            unit_price,
            category_name: category.to_string(),
            line_revenue: Decimal::from(quantity) * unit_price,
        }
    }

    pub fn base_rows(master: &[MasterSalesLine]) -> Vec<BaseRow> {
        let config = PipelineConfig::default();
        let (schema, _) = build_star_schema(master, &config.date_dimension).unwrap();
        build_base_view(&schema, &config.price_buckets).unwrap()
    }

    pub fn base(master: &[MasterSalesLine]) -> DataFrame {
        base_frame(&base_rows(master)).unwrap()
    }
}
