// src/model/mod.rs
pub mod table_row;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use table_row::{ensure_columns, FromBatch, TableRow};

/// Partition key: one calendar month.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// Midnight on the first day of the month, or `None` for a mis-tagged key
    /// such as month 13.
    pub fn first_day(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)?.and_hms_opt(0, 0, 0)
    }

    /// Half-open `[start, end)` range covered by this month. December rolls
    /// over into January of the following year.
    pub fn bounds(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let start = self.first_day()?;
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        let end = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
        Some((start, end))
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// One raw ride event as read from the source table. Everything except the
/// partition keys may be null.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RideRecord {
    pub pickup: Option<NaiveDateTime>,
    pub dropoff: Option<NaiveDateTime>,
    pub pickup_location_id: Option<i64>,
    pub dropoff_location_id: Option<i64>,
    pub trip_distance: Option<f64>,
    pub total_amount: Option<f64>,
    pub fare_amount: Option<f64>,
    pub tip_amount: Option<f64>,
    pub payment_type: Option<i64>,
    pub passenger_count: Option<i64>,
    pub year: i32,
    pub month: u32,
}

impl RideRecord {
    pub fn key(&self) -> YearMonth {
        YearMonth::new(self.year, self.month)
    }
}

/// A ride that survived every funnel rule, in the canonical output schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredRecord {
    pub pickup: NaiveDateTime,
    pub dropoff: NaiveDateTime,
    pub pickup_location_id: i64,
    pub dropoff_location_id: i64,
    pub trip_distance: f64,
    pub fare_amount: Option<f64>,
    pub tip_amount: Option<f64>,
    pub payment_type: Option<i64>,
    pub passenger_count: i64,
    pub year: i32,
    pub month: u32,
}

/// One cell of the dense hour × location grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourLocationCell {
    pub hour: NaiveDateTime,
    pub location_id: i64,
    pub rides: u64,
    pub year: i32,
    pub month: u32,
}

/// Outcome marker carried by every report row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonthStatus {
    Processed,
    SkippedEmpty,
    Failed(String),
}

impl MonthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            MonthStatus::Processed => "processed",
            MonthStatus::SkippedEmpty => "skipped_empty",
            MonthStatus::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            MonthStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Upper bounds applied by the duration, fare and distance rules.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub max_duration_secs: f64,
    pub max_total_amount: f64,
    pub max_distance: f64,
}

/// Per-month audit of the funnel. Each `dropped_*` counter is the marginal
/// loss at that rule, measured on the survivors of the rule before it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FilterStats {
    pub year: i32,
    pub month: u32,
    pub status: MonthStatus,
    pub total_records: u64,
    pub dropped_missing: u64,
    pub dropped_duration: u64,
    pub dropped_total_amount: u64,
    pub dropped_distance: u64,
    pub dropped_location: u64,
    pub dropped_date_range: u64,
    pub dropped_passenger_count: u64,
    pub valid_records: u64,
    pub records_dropped: u64,
    pub percent_dropped: f64,
    pub thresholds: Option<Thresholds>,
}

impl FilterStats {
    pub fn new(key: YearMonth, total_records: u64) -> Self {
        Self {
            year: key.year,
            month: key.month,
            status: MonthStatus::Processed,
            total_records,
            dropped_missing: 0,
            dropped_duration: 0,
            dropped_total_amount: 0,
            dropped_distance: 0,
            dropped_location: 0,
            dropped_date_range: 0,
            dropped_passenger_count: 0,
            valid_records: 0,
            records_dropped: 0,
            percent_dropped: 0.0,
            thresholds: None,
        }
    }

    /// Row for a month that failed before any rule ran. `total_records` is
    /// whatever was known about the month at that point, 0 if it was never read.
    pub fn failed(key: YearMonth, total_records: u64, reason: impl Into<String>) -> Self {
        let mut stats = Self::new(key, total_records);
        stats.fail(reason);
        stats
    }

    /// Mark the month failed. Rule counters and thresholds gathered so far are
    /// kept; nothing of the month is written, so every record counts as dropped.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.valid_records = 0;
        self.records_dropped = self.total_records;
        self.percent_dropped = if self.total_records == 0 { 0.0 } else { 100.0 };
        self.status = MonthStatus::Failed(reason.into());
    }

    pub fn key(&self) -> YearMonth {
        YearMonth::new(self.year, self.month)
    }

    /// Close the funnel: derive the totals and the status from `valid_records`.
    pub fn finish(&mut self, valid_records: u64) {
        self.valid_records = valid_records;
        self.records_dropped = self.total_records.saturating_sub(valid_records);
        self.percent_dropped = if self.total_records == 0 {
            0.0
        } else {
            self.records_dropped as f64 / self.total_records as f64 * 100.0
        };
        self.status = if valid_records == 0 {
            MonthStatus::SkippedEmpty
        } else {
            MonthStatus::Processed
        };
    }

    pub fn rule_drops(&self) -> u64 {
        self.dropped_missing
            + self.dropped_duration
            + self.dropped_total_amount
            + self.dropped_distance
            + self.dropped_location
            + self.dropped_date_range
            + self.dropped_passenger_count
    }
}

/// Per-month summary of the densification stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransformStats {
    pub year: i32,
    pub month: u32,
    pub status: MonthStatus,
    pub observed_cells: u64,
    pub hours: u64,
    pub locations: u64,
    pub rows: u64,
    pub total_rides: u64,
}

impl TransformStats {
    pub fn skipped(key: YearMonth, status: MonthStatus) -> Self {
        Self {
            year: key.year,
            month: key.month,
            status,
            observed_cells: 0,
            hours: 0,
            locations: 0,
            rows: 0,
            total_rides: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn december_bounds_roll_into_next_year() {
        let (start, end) = YearMonth::new(2023, 12).bounds().unwrap();
        assert_eq!(start, ts("2023-12-01 00:00:00"));
        assert_eq!(end, ts("2024-01-01 00:00:00"));
    }

    #[test]
    fn mis_tagged_month_has_no_bounds() {
        assert!(YearMonth::new(2024, 13).bounds().is_none());
        assert!(YearMonth::new(2024, 0).first_day().is_none());
    }

    #[test]
    fn keys_order_by_year_then_month() {
        let mut keys = vec![
            YearMonth::new(2024, 2),
            YearMonth::new(2023, 11),
            YearMonth::new(2024, 1),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                YearMonth::new(2023, 11),
                YearMonth::new(2024, 1),
                YearMonth::new(2024, 2)
            ]
        );
        assert_eq!(YearMonth::new(2024, 1).to_string(), "2024-01");
    }

    #[test]
    fn finish_keeps_totals_consistent() {
        let mut stats = FilterStats::new(YearMonth::new(2024, 3), 8);
        stats.dropped_missing = 2;
        stats.dropped_total_amount = 1;
        stats.finish(5);
        assert_eq!(stats.records_dropped, 3);
        assert_eq!(stats.total_records, stats.valid_records + stats.records_dropped);
        assert_eq!(stats.rule_drops(), stats.records_dropped);
        assert!((stats.percent_dropped - 37.5).abs() < 1e-9);
        assert_eq!(stats.status, MonthStatus::Processed);
    }

    #[test]
    fn failing_a_month_zeroes_valid_but_keeps_totals() {
        let mut stats = FilterStats::new(YearMonth::new(2024, 3), 8);
        stats.dropped_missing = 2;
        stats.finish(6);
        stats.fail("write refused");
        assert_eq!(stats.total_records, 8);
        assert_eq!(stats.dropped_missing, 2);
        assert_eq!(stats.valid_records, 0);
        assert_eq!(stats.records_dropped, 8);
        assert_eq!(stats.percent_dropped, 100.0);
        assert_eq!(stats.status, MonthStatus::Failed("write refused".into()));

        let unread = FilterStats::failed(YearMonth::new(2024, 4), 0, "unreadable part");
        assert_eq!(unread.percent_dropped, 0.0);
        assert_eq!(unread.status.label(), "failed");
    }

    #[test]
    fn zero_total_has_zero_percent() {
        let mut stats = FilterStats::new(YearMonth::new(2024, 3), 0);
        stats.finish(0);
        assert_eq!(stats.percent_dropped, 0.0);
        assert_eq!(stats.status, MonthStatus::SkippedEmpty);
    }
}
