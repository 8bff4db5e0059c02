//! SalesForge: rebuilds the sales star schema and metric views from raw
//! CSV extracts.
//!
//! This is the main entrypoint that orchestrates loading, the staged
//! pipeline run, output writing and guardrail enforcement.

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use salesforge::qa::QaStatus;
use salesforge::{load_raw_relations, run_pipeline, write_relations, Args, PipelineOutput};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if args.verbose {
        println!("SalesForge - Sales BI pipeline");
        println!("==============================\n");
    }

    let config = args.load_config()?;
    let start_time = Instant::now();

    // Step 1: Load raw extracts
    if args.verbose {
        println!("Step 1: Loading raw extracts");
        println!("  Input directory: {}", args.input);
    }
    let raw = load_raw_relations(Path::new(&args.input), &config.inputs)?;
    println!(
        "✓ Raw data loaded: {} customers, {} categories, {} products, {} orders",
        raw.customers.len(),
        raw.categories.len(),
        raw.products.len(),
        raw.orders.len()
    );

    // Step 2: Run every stage
    if args.verbose {
        println!("\nStep 2: Running pipeline");
        println!(
            "  Tier granularity: {}",
            if config.per_year_tiers { "per year" } else { "all time" }
        );
        println!(
            "  Date dimension: {} to {}",
            config.date_dimension.start, config.date_dimension.end
        );
    }
    let output = run_pipeline(&raw, &config)?;
    print_stage_summaries(&output, args.verbose);
    print_qa_summary(&output);

    // Step 3: Write output relations
    if args.no_write {
        println!("\nOutput writing skipped (--no-write)");
    } else {
        let written = write_relations(Path::new(&args.output), &output)?;
        println!("\n✓ {} relations written to {}", written.len(), args.output);
    }

    let total_time = start_time.elapsed();
    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", total_time.as_secs_f64());

    if config.fail_on_guardrail {
        output.check_guardrails()?;
    }
    Ok(())
}

fn print_stage_summaries(output: &PipelineOutput, verbose: bool) {
    println!("\n=== Stage Summary ===");
    for summary in &output.summaries {
        let dropped = summary.rows_in.saturating_sub(summary.rows_out);
        println!(
            "{:<13} in: {:>8}  out: {:>8}  dropped: {:>6}",
            summary.stage.as_str(),
            summary.rows_in,
            summary.rows_out,
            dropped
        );
        if verbose {
            println!("  Time: {:.3}s", summary.elapsed.as_secs_f64());
        }
    }

    if verbose {
        println!("\nStaging drops:");
        for relation in &output.staging_report.relations {
            for (reason, count) in &relation.dropped {
                println!("  {}.{}: {}", relation.relation, reason, count);
            }
        }
    }
}

fn print_qa_summary(output: &PipelineOutput) {
    let checks = output.qa.checks();
    let count = |status: QaStatus| checks.iter().filter(|c| c.status == status).count();
    println!(
        "\nQA checks: {} passed, {} warnings, {} failed",
        count(QaStatus::Pass),
        count(QaStatus::Warn),
        count(QaStatus::Fail)
    );
    for check in output.qa.failures() {
        println!(
            "  ✗ [{}] {}: observed {}, expected {}",
            check.stage,
            check.check,
            check.observed,
            check.expected.as_deref().unwrap_or("-")
        );
    }
}
