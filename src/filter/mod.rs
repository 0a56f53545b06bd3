// src/filter/mod.rs
//! Per-month outlier funnel: seven rules applied in order, each measured on
//! the survivors of the one before.

pub mod quantile;

use crate::config::{FilterConfig, ThresholdScope};
use crate::error::PipelineError;
use crate::model::table_row::source;
use crate::model::{FilterStats, FilteredRecord, RideRecord, Thresholds, YearMonth};
use chrono::NaiveDateTime;
use tracing::{debug, info, instrument, warn};

pub use quantile::{build_estimator, ExactEstimator, QuantileEstimator, TDigest, TDigestEstimator};

const DURATION: &str = "DURATION";

/// A ride with every field the rules look at present.
#[derive(Debug, Clone, Copy)]
struct CompleteRide<'a> {
    record: &'a RideRecord,
    pickup: NaiveDateTime,
    pickup_location_id: i64,
    trip_distance: f64,
    total_amount: f64,
    passenger_count: i64,
    duration_secs: i64,
    dropoff: NaiveDateTime,
    dropoff_location_id: i64,
}

impl<'a> CompleteRide<'a> {
    fn from_record(record: &'a RideRecord) -> Option<Self> {
        let pickup = record.pickup?;
        let dropoff = record.dropoff?;
        Some(Self {
            record,
            pickup,
            dropoff,
            pickup_location_id: record.pickup_location_id?,
            dropoff_location_id: record.dropoff_location_id?,
            trip_distance: record.trip_distance?,
            total_amount: record.total_amount?,
            passenger_count: record.passenger_count?,
            // whole-second boundaries crossed, so sub-second trips count as 0
            duration_secs: dropoff.and_utc().timestamp() - pickup.and_utc().timestamp(),
        })
    }

    fn into_filtered(self, key: YearMonth) -> FilteredRecord {
        FilteredRecord {
            pickup: self.pickup,
            dropoff: self.dropoff,
            pickup_location_id: self.pickup_location_id,
            dropoff_location_id: self.dropoff_location_id,
            trip_distance: self.trip_distance,
            fare_amount: self.record.fare_amount,
            tip_amount: self.record.tip_amount,
            payment_type: self.record.payment_type,
            passenger_count: self.passenger_count,
            year: key.year,
            month: key.month,
        }
    }
}

/// Survivors of the funnel plus its audit row.
#[derive(Debug, Clone)]
pub struct FunnelOutcome {
    pub records: Vec<FilteredRecord>,
    pub stats: FilterStats,
}

pub struct FunnelFilter<'a> {
    config: &'a FilterConfig,
    estimator: &'a dyn QuantileEstimator,
}

/// Retain by `keep`, returning how many were dropped.
fn apply_rule<'a>(rides: &mut Vec<CompleteRide<'a>>, keep: impl FnMut(&CompleteRide<'a>) -> bool) -> u64 {
    let before = rides.len();
    rides.retain(keep);
    (before - rides.len()) as u64
}

impl<'a> FunnelFilter<'a> {
    pub fn new(config: &'a FilterConfig, estimator: &'a dyn QuantileEstimator) -> Self {
        Self { config, estimator }
    }

    fn keeps_duration(ride: &CompleteRide<'_>, max: f64) -> bool {
        ride.duration_secs > 0 && ride.duration_secs as f64 <= max
    }

    fn keeps_total_amount(&self, ride: &CompleteRide<'_>, max: f64) -> bool {
        ride.total_amount >= self.config.min_total_amount && ride.total_amount <= max
    }

    fn keeps_distance(ride: &CompleteRide<'_>, max: f64) -> bool {
        ride.trip_distance > 0.0 && ride.trip_distance <= max
    }

    fn keeps_location(&self, ride: &CompleteRide<'_>) -> bool {
        !self.config.invalid_location_ids.contains(&ride.pickup_location_id)
    }

    fn keeps_date_range(ride: &CompleteRide<'_>, bounds: Option<(NaiveDateTime, NaiveDateTime)>) -> bool {
        bounds.is_some_and(|(start, end)| ride.pickup >= start && ride.pickup < end)
    }

    fn keeps_passenger_count(&self, ride: &CompleteRide<'_>) -> bool {
        (self.config.min_passenger_count..=self.config.max_passenger_count)
            .contains(&ride.passenger_count)
    }

    /// Whether `record` passes every rule for month `key` under fixed
    /// `thresholds`.
    pub fn admits(&self, key: YearMonth, record: &RideRecord, thresholds: &Thresholds) -> bool {
        if record.key() != key {
            return false;
        }
        let Some(ride) = CompleteRide::from_record(record) else {
            return false;
        };
        Self::keeps_duration(&ride, thresholds.max_duration_secs)
            && self.keeps_total_amount(&ride, thresholds.max_total_amount)
            && Self::keeps_distance(&ride, thresholds.max_distance)
            && self.keeps_location(&ride)
            && Self::keeps_date_range(&ride, key.bounds())
            && self.keeps_passenger_count(&ride)
    }

    fn estimate<'r>(
        &self,
        column: &str,
        rides: &[CompleteRide<'r>],
        value: impl Fn(&CompleteRide<'r>) -> f64,
    ) -> Result<f64, PipelineError> {
        let values: Vec<f64> = rides.iter().map(value).collect();
        self.estimator.estimate(column, &values, self.config.quantile)
    }

    fn duration_bound(&self, rides: &[CompleteRide<'_>]) -> Result<f64, PipelineError> {
        self.estimate(DURATION, rides, |r| r.duration_secs as f64)
    }

    fn total_amount_bound(&self, rides: &[CompleteRide<'_>]) -> Result<f64, PipelineError> {
        self.estimate(source::TOTAL_AMOUNT, rides, |r| r.total_amount)
    }

    fn distance_bound(&self, rides: &[CompleteRide<'_>]) -> Result<f64, PipelineError> {
        self.estimate(source::TRIP_DISTANCE, rides, |r| r.trip_distance)
    }

    /// Run the three percentile rules. Returns the bounds that were applied,
    /// or `None` when the set ran dry before all of them could be computed.
    fn apply_threshold_rules(
        &self,
        rides: &mut Vec<CompleteRide<'_>>,
        stats: &mut FilterStats,
    ) -> Result<Option<Thresholds>, PipelineError> {
        if rides.is_empty() {
            return Ok(None);
        }
        match self.config.threshold_scope {
            ThresholdScope::PostCompleteness => {
                let thresholds = Thresholds {
                    max_duration_secs: self.duration_bound(rides)?,
                    max_total_amount: self.total_amount_bound(rides)?,
                    max_distance: self.distance_bound(rides)?,
                };
                stats.dropped_duration =
                    apply_rule(rides, |r| Self::keeps_duration(r, thresholds.max_duration_secs));
                stats.dropped_total_amount =
                    apply_rule(rides, |r| self.keeps_total_amount(r, thresholds.max_total_amount));
                stats.dropped_distance =
                    apply_rule(rides, |r| Self::keeps_distance(r, thresholds.max_distance));
                Ok(Some(thresholds))
            }
            ThresholdScope::Sequential => {
                let max_duration_secs = self.duration_bound(rides)?;
                stats.dropped_duration =
                    apply_rule(rides, |r| Self::keeps_duration(r, max_duration_secs));
                if rides.is_empty() {
                    return Ok(None);
                }
                let max_total_amount = self.total_amount_bound(rides)?;
                stats.dropped_total_amount =
                    apply_rule(rides, |r| self.keeps_total_amount(r, max_total_amount));
                if rides.is_empty() {
                    return Ok(None);
                }
                let max_distance = self.distance_bound(rides)?;
                stats.dropped_distance = apply_rule(rides, |r| Self::keeps_distance(r, max_distance));
                Ok(Some(Thresholds {
                    max_duration_secs,
                    max_total_amount,
                    max_distance,
                }))
            }
        }
    }

    /// Filter the records tagged with `key`. Records of other months in
    /// `records` are ignored. A bound that cannot be estimated (every value
    /// non-finite) fails the month but keeps the counts gathered so far.
    #[instrument(level = "debug", skip(self, records), fields(key = %key, input = records.len()))]
    pub fn apply(&self, key: YearMonth, records: &[RideRecord]) -> Result<FunnelOutcome, PipelineError> {
        let month: Vec<&RideRecord> = records.iter().filter(|r| r.key() == key).collect();
        let mut stats = FilterStats::new(key, month.len() as u64);

        let mut rides: Vec<CompleteRide<'_>> = month
            .iter()
            .filter_map(|r| CompleteRide::from_record(r))
            .collect();
        stats.dropped_missing = stats.total_records - rides.len() as u64;

        stats.thresholds = match self.apply_threshold_rules(&mut rides, &mut stats) {
            Ok(thresholds) => thresholds,
            Err(e @ PipelineError::ThresholdUndefined { .. }) => {
                warn!(year = key.year, month = key.month, total = stats.total_records, "{}", e);
                stats.fail(e.to_string());
                return Ok(FunnelOutcome {
                    records: Vec::new(),
                    stats,
                });
            }
            Err(e) => return Err(e),
        };
        if let Some(t) = &stats.thresholds {
            debug!(
                max_duration_secs = t.max_duration_secs,
                max_total_amount = t.max_total_amount,
                max_distance = t.max_distance,
                estimator = self.estimator.name(),
                "dynamic thresholds"
            );
        }

        stats.dropped_location = apply_rule(&mut rides, |r| self.keeps_location(r));
        let bounds = key.bounds();
        stats.dropped_date_range = apply_rule(&mut rides, |r| Self::keeps_date_range(r, bounds));
        stats.dropped_passenger_count = apply_rule(&mut rides, |r| self.keeps_passenger_count(r));

        stats.finish(rides.len() as u64);
        let records: Vec<FilteredRecord> = rides.into_iter().map(|r| r.into_filtered(key)).collect();

        info!(
            year = key.year,
            month = key.month,
            total = stats.total_records,
            valid = stats.valid_records,
            dropped = stats.records_dropped,
            percent = format!("{:.2}", stats.percent_dropped),
            missing = stats.dropped_missing,
            duration = stats.dropped_duration,
            total_amount = stats.dropped_total_amount,
            distance = stats.dropped_distance,
            location = stats.dropped_location,
            date_range = stats.dropped_date_range,
            passenger = stats.dropped_passenger_count,
            status = stats.status.label(),
            "filtered month"
        );

        Ok(FunnelOutcome { records, stats })
    }
}
