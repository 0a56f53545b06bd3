use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Domain errors raised by the pipeline.
///
/// Plumbing failures (I/O, Arrow, Parquet) travel as `anyhow::Error`; these
/// variants are the ones the orchestrator inspects at the month boundary.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no records for {year}-{month:02} at the {stage} stage")]
    EmptyPartition {
        year: i32,
        month: u32,
        stage: &'static str,
    },
    #[error("cannot compute a threshold for `{column}` over an empty set")]
    ThresholdUndefined { column: String },
    #[error("quantile {0} is outside the open interval (0, 1)")]
    InvalidQuantile(f64),
    #[error("table `{table}` is missing required columns: {missing:?}")]
    SchemaMismatch { table: String, missing: Vec<String> },
    #[error("append to `{table}` attempted before the table was replaced")]
    WriteOrderingViolation { table: String },
    #[error("IO error reading config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse YAML configuration in {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    /// Fatal errors abort the whole run; everything else is scoped to one month.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::EmptyPartition { .. } | PipelineError::ThresholdUndefined { .. }
        )
    }
}

/// True when `err` carries a fatal [`PipelineError`] anywhere in its chain.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<PipelineError>())
        .any(PipelineError::is_fatal)
}
