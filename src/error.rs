//! Fatal pipeline conditions
//!
//! Row-level problems (bad casts, duplicates, orphans) never surface here:
//! they are counted into stage reports. These variants stop a run.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing input relation '{relation}' at {path}")]
    MissingInput { relation: String, path: String },

    #[error("Row count mismatch in {stage}: expected {expected}, got {actual}")]
    RowCountMismatch {
        stage: String,
        expected: usize,
        actual: usize,
    },

    #[error("Guardrail '{check}' failed: {detail}")]
    Guardrail { check: String, detail: String },
}
