//! SalesForge: a batch BI pipeline for e-commerce sales extracts
//!
//! Raw customer, category, product and order extracts are validated,
//! staged, consolidated into order-line master sales, enriched, modeled as
//! a star schema and finally summarized into metric views. Every stage
//! reports its QA checks alongside its output relations.

pub mod cast;
pub mod cli;
pub mod config;
pub mod data;
pub mod enrich;
pub mod error;
pub mod export;
pub mod frame;
pub mod master;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod qa;
pub mod staging;
pub mod star;
pub mod stats;
pub mod validate;

// Re-export public items for easier access
pub use cli::Args;
pub use config::PipelineConfig;
pub use data::load_raw_relations;
pub use error::PipelineError;
pub use export::{relation_frames, write_relations};
pub use pipeline::{run_pipeline, PipelineOutput};
pub use qa::{QaCheck, QaReport};

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;
