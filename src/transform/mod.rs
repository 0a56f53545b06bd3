// src/transform/mod.rs
//! Hourly aggregation and zero-filled densification of filtered rides.

pub mod aggregate;
pub mod densify;

use crate::error::PipelineError;
use crate::model::{FilteredRecord, YearMonth};
use tracing::{info, instrument};

pub use aggregate::{aggregate_hourly, truncate_to_hour, HourlyCount};
pub use densify::{densify, DenseGrid};

/// Aggregate then densify one month. Records tagged with another month are
/// ignored.
#[instrument(level = "debug", skip(records), fields(key = %key, input = records.len()))]
pub fn transform_month(key: YearMonth, records: &[FilteredRecord]) -> Result<DenseGrid, PipelineError> {
    let counts = aggregate_hourly(
        records
            .iter()
            .filter(|r| r.year == key.year && r.month == key.month),
    );
    let grid = densify(key, &counts)?;
    info!(
        year = key.year,
        month = key.month,
        hours = grid.hours,
        locations = grid.locations,
        observed = grid.observed,
        rows = grid.cells.len(),
        "densified month"
    );
    Ok(grid)
}
