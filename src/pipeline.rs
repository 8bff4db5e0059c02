//! End-to-end pipeline: raw validation through metric views
//!
//! Every run is a full rebuild. Stages run strictly in order and each one
//! contributes its QA checks to a single [`QaReport`].

use std::time::{Duration, Instant};

use tracing::{info, info_span};

use crate::config::PipelineConfig;
use crate::enrich::{enrich, enrichment_checks, TierGranularity};
use crate::error::PipelineError;
use crate::master::{build_master, MasterReport};
use crate::metrics::{build_metric_views, reconcile_views, MetricViews};
use crate::model::{EnrichedSalesLine, MasterSalesLine, RawRelations};
use crate::qa::{QaReport, Stage};
use crate::staging::{build_staging, StagedRelations, StagingReport};
use crate::star::{build_star_schema, StarReport, StarSchema};
use crate::validate::{profile_raw, RawProfile};

/// Row flow and timing of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSummary {
    pub stage: Stage,
    pub rows_in: usize,
    pub rows_out: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub raw_profile: RawProfile,
    pub staged: StagedRelations,
    pub staging_report: StagingReport,
    pub master: Vec<MasterSalesLine>,
    pub master_report: MasterReport,
    pub enriched: Vec<EnrichedSalesLine>,
    pub star: StarSchema,
    pub star_report: StarReport,
    pub views: MetricViews,
    pub qa: QaReport,
    pub summaries: Vec<StageSummary>,
}

impl PipelineOutput {
    /// First failed star-schema or metric-view check as a fatal error.
    pub fn check_guardrails(&self) -> Result<(), PipelineError> {
        match self
            .qa
            .failures()
            .find(|c| matches!(c.stage, Stage::StarSchema | Stage::MetricViews))
        {
            Some(check) => Err(PipelineError::Guardrail {
                check: check.check.clone(),
                detail: format!(
                    "observed {} expected {} {}",
                    check.observed,
                    check.expected.as_deref().unwrap_or("-"),
                    check.detail
                )
                .trim_end()
                .to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn summary(stage: Stage, rows_in: usize, rows_out: usize, started: Instant) -> StageSummary {
    let elapsed = started.elapsed();
    info!(
        stage = %stage,
        rows_in,
        rows_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "stage complete"
    );
    StageSummary {
        stage,
        rows_in,
        rows_out,
        elapsed,
    }
}

/// Run every stage over `raw`.
///
/// # Arguments
/// * `raw` - The raw input relations
/// * `config` - Pipeline configuration
///
/// # Returns
/// All output relations with their QA report. Fails on invalid
/// configuration or a master cardinality mismatch; star-schema and view
/// guardrails are reported in the output, see
/// [`PipelineOutput::check_guardrails`].
pub fn run_pipeline(raw: &RawRelations, config: &PipelineConfig) -> crate::Result<PipelineOutput> {
    config.validate()?;
    let _span = info_span!("pipeline", per_year_tiers = config.per_year_tiers).entered();

    let mut qa = QaReport::new();
    let mut summaries = Vec::with_capacity(6);
    let raw_rows =
        raw.customers.len() + raw.categories.len() + raw.products.len() + raw.orders.len();

    let started = Instant::now();
    let raw_profile = profile_raw(raw, &config.date_formats, config.top_n)?;
    qa.extend(raw_profile.qa_checks());
    summaries.push(summary(Stage::Raw, raw_rows, raw_rows, started));

    let started = Instant::now();
    let (staged, staging_report) = build_staging(raw, &config.date_formats)?;
    qa.extend(staging_report.qa_checks());
    summaries.push(summary(Stage::Staging, raw.orders.len(), staged.orders.len(), started));

    let started = Instant::now();
    let (master, master_report) =
        build_master(&staged, config.expected_master_rows, config.spot_sample_size)?;
    qa.extend(master_report.qa_checks());
    summaries.push(summary(Stage::Master, staged.orders.len(), master.len(), started));

    let started = Instant::now();
    let enriched = enrich(
        &master,
        &config.price_buckets,
        TierGranularity::from_toggle(config.per_year_tiers),
    )?;
    qa.extend(enrichment_checks(&master, &enriched)?);
    summaries.push(summary(Stage::Enrichment, master.len(), enriched.len(), started));

    let started = Instant::now();
    let (star, star_report) = build_star_schema(&master, &config.date_dimension)?;
    qa.extend(star_report.qa_checks());
    summaries.push(summary(Stage::StarSchema, master.len(), star.fact_sales.len(), started));

    let started = Instant::now();
    let views = build_metric_views(&star, config)?;
    qa.extend(reconcile_views(&views, config.reconciliation_tolerance));
    summaries.push(summary(Stage::MetricViews, star.fact_sales.len(), views.base.len(), started));

    info!(
        checks = qa.checks().len(),
        failures = qa.failures().count(),
        "pipeline complete"
    );

    Ok(PipelineOutput {
        raw_profile,
        staged,
        staging_report,
        master,
        master_report,
        enriched,
        star,
        star_report,
        views,
        qa,
        summaries,
    })
}
