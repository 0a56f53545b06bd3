// src/transform/densify.rs
use super::aggregate::HourlyCount;
use crate::error::PipelineError;
use crate::model::{HourLocationCell, MonthStatus, TransformStats, YearMonth};
use chrono::{Duration, NaiveDateTime};
use std::collections::{BTreeSet, HashMap};

/// Complete hour × location grid for one month.
#[derive(Debug, Clone)]
pub struct DenseGrid {
    pub cells: Vec<HourLocationCell>,
    pub hours: usize,
    pub locations: usize,
    /// Cells with at least one observed ride.
    pub observed: usize,
}

impl DenseGrid {
    pub fn total_rides(&self) -> u64 {
        self.cells.iter().map(|c| c.rides).sum()
    }

    pub fn stats(&self, key: YearMonth) -> TransformStats {
        TransformStats {
            year: key.year,
            month: key.month,
            status: MonthStatus::Processed,
            observed_cells: self.observed as u64,
            hours: self.hours as u64,
            locations: self.locations as u64,
            rows: self.cells.len() as u64,
            total_rides: self.total_rides(),
        }
    }
}

/// Every hour from `first` to `last` inclusive.
fn hour_range(first: NaiveDateTime, last: NaiveDateTime) -> Vec<NaiveDateTime> {
    let mut hours = Vec::new();
    let mut current = first;
    while current <= last {
        hours.push(current);
        current += Duration::hours(1);
    }
    hours
}

/// Expand sparse counts into the full cartesian product of the observed hour
/// span and the observed locations, zero-filling the gaps.
///
/// Cells come out hour-major, locations ascending within each hour.
pub fn densify(key: YearMonth, counts: &[HourlyCount]) -> Result<DenseGrid, PipelineError> {
    let (Some(first), Some(last)) = (
        counts.iter().map(|c| c.hour).min(),
        counts.iter().map(|c| c.hour).max(),
    ) else {
        return Err(PipelineError::EmptyPartition {
            year: key.year,
            month: key.month,
            stage: "transform",
        });
    };

    let locations: BTreeSet<i64> = counts.iter().map(|c| c.location_id).collect();
    let mut observed: HashMap<(NaiveDateTime, i64), u64> = HashMap::with_capacity(counts.len());
    for c in counts {
        *observed.entry((c.hour, c.location_id)).or_insert(0) += c.rides;
    }

    let hours = hour_range(first, last);
    let mut cells = Vec::with_capacity(hours.len() * locations.len());
    for &hour in &hours {
        for &location_id in &locations {
            cells.push(HourLocationCell {
                hour,
                location_id,
                rides: observed.get(&(hour, location_id)).copied().unwrap_or(0),
                year: key.year,
                month: key.month,
            });
        }
    }

    Ok(DenseGrid {
        hours: hours.len(),
        locations: locations.len(),
        observed: observed.len(),
        cells,
    })
}
