// src/transform/aggregate.rs
use crate::model::FilteredRecord;
use chrono::{NaiveDateTime, Timelike};
use std::collections::BTreeMap;

/// Rides observed in one (hour, pickup location) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourlyCount {
    pub hour: NaiveDateTime,
    pub location_id: i64,
    pub rides: u64,
}

/// Floor `ts` to the start of its hour.
pub fn truncate_to_hour(ts: NaiveDateTime) -> NaiveDateTime {
    ts.date().and_hms_opt(ts.hour(), 0, 0).unwrap_or(ts)
}

/// Sparse per-(hour, location) ride counts, ordered by hour then location.
pub fn aggregate_hourly<'r>(records: impl IntoIterator<Item = &'r FilteredRecord>) -> Vec<HourlyCount> {
    let mut counts: BTreeMap<(NaiveDateTime, i64), u64> = BTreeMap::new();
    for r in records {
        *counts
            .entry((truncate_to_hour(r.pickup), r.pickup_location_id))
            .or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|((hour, location_id), rides)| HourlyCount {
            hour,
            location_id,
            rides,
        })
        .collect()
}
