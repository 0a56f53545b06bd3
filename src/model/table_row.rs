// src/model/table_row.rs
use super::{FilterStats, FilteredRecord, HourLocationCell, RideRecord};
use crate::error::PipelineError;
use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{
        Array, ArrayRef, ArrowPrimitiveType, Float64Array, Int64Array, PrimitiveArray,
        StringArray, TimestampMicrosecondArray, UInt64Array,
    },
    compute::cast,
    datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{DateTime, NaiveDateTime};
use std::sync::Arc;

/// Column names of the raw source table (matched case-insensitively).
pub mod source {
    pub const PICKUP: &str = "TPEP_PICKUP_DATETIME";
    pub const DROPOFF: &str = "TPEP_DROPOFF_DATETIME";
    pub const PICKUP_LOCATION: &str = "PULOCATIONID";
    pub const DROPOFF_LOCATION: &str = "DOLOCATIONID";
    pub const TRIP_DISTANCE: &str = "TRIP_DISTANCE";
    pub const TOTAL_AMOUNT: &str = "TOTAL_AMOUNT";
    pub const FARE_AMOUNT: &str = "FARE_AMOUNT";
    pub const TIP_AMOUNT: &str = "TIP_AMOUNT";
    pub const PAYMENT_TYPE: &str = "PAYMENT_TYPE";
    pub const PASSENGER_COUNT: &str = "PASSENGER_COUNT";
}

/// Column names of the derived tables.
pub mod canonical {
    pub const PICKUP: &str = "PICKUP_DATETIME";
    pub const DROPOFF: &str = "DROPOFF_DATETIME";
    pub const PICKUP_LOCATION: &str = "PICKUP_LOCATION_ID";
    pub const DROPOFF_LOCATION: &str = "DROPOFF_LOCATION_ID";
    pub const TRIP_DISTANCE: &str = "TRIP_DISTANCE";
    pub const FARE_AMOUNT: &str = "FARE_AMOUNT";
    pub const TIP_AMOUNT: &str = "TIP_AMOUNT";
    pub const PAYMENT_TYPE: &str = "PAYMENT_TYPE";
    pub const PASSENGER_COUNT: &str = "PASSENGER_COUNT";
    pub const PICKUP_HOUR: &str = "PICKUP_HOUR";
    pub const RIDES: &str = "RIDES";
}

/// Partition key columns shared by every table.
pub const YEAR: &str = "YEAR";
pub const MONTH: &str = "MONTH";

/// A typed row that can be written as an Arrow batch.
/// - `COLUMNS` lists the column names in schema order.
/// - `to_batch` builds one batch from a slice of rows.
pub trait TableRow: Sized {
    const COLUMNS: &'static [&'static str];
    fn schema() -> SchemaRef;
    fn to_batch(rows: &[Self]) -> Result<RecordBatch>;
}

/// A typed row that can also be decoded from a batch. Columns are looked up
/// by name (case-insensitively) and cast to the expected Arrow type first.
pub trait FromBatch: TableRow {
    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>>;

    fn from_batches(batches: &[RecordBatch]) -> Result<Vec<Self>> {
        let mut rows = Vec::with_capacity(batches.iter().map(|b| b.num_rows()).sum());
        for batch in batches {
            rows.extend(Self::from_batch(batch)?);
        }
        Ok(rows)
    }
}

pub fn column_index(schema: &Schema, name: &str) -> Option<usize> {
    schema
        .fields()
        .iter()
        .position(|f| f.name().eq_ignore_ascii_case(name))
}

/// Check that every `required` column is present in `schema`.
pub fn ensure_columns(schema: &Schema, required: &[&str], table: &str) -> Result<(), PipelineError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|name| column_index(schema, name).is_none())
        .map(|name| name.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::SchemaMismatch {
            table: table.to_string(),
            missing,
        })
    }
}

fn typed_column(batch: &RecordBatch, name: &str, to: &DataType) -> Result<ArrayRef> {
    let idx = column_index(&batch.schema(), name)
        .ok_or_else(|| anyhow!("column `{}` not found in batch", name))?;
    let col = batch.column(idx);
    if col.data_type() == to {
        return Ok(col.clone());
    }
    cast(col.as_ref(), to)
        .with_context(|| format!("casting `{}` from {:?} to {:?}", name, col.data_type(), to))
}

fn primitive_column<T: ArrowPrimitiveType>(
    batch: &RecordBatch,
    name: &str,
    to: DataType,
) -> Result<PrimitiveArray<T>> {
    let arr = typed_column(batch, name, &to)?;
    arr.as_any()
        .downcast_ref::<PrimitiveArray<T>>()
        .cloned()
        .ok_or_else(|| anyhow!("column `{}` was expected to be {:?}", name, to))
}

fn f64_column(batch: &RecordBatch, name: &str) -> Result<Float64Array> {
    primitive_column(batch, name, DataType::Float64)
}

fn i64_column(batch: &RecordBatch, name: &str) -> Result<Int64Array> {
    primitive_column(batch, name, DataType::Int64)
}

fn ts_column(batch: &RecordBatch, name: &str) -> Result<TimestampMicrosecondArray> {
    primitive_column(batch, name, timestamp_type())
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, None)
}

fn opt<T: ArrowPrimitiveType>(arr: &PrimitiveArray<T>, row: usize) -> Option<T::Native> {
    arr.is_valid(row).then(|| arr.value(row))
}

fn required<T: ArrowPrimitiveType>(
    arr: &PrimitiveArray<T>,
    row: usize,
    name: &str,
) -> Result<T::Native> {
    opt(arr, row).ok_or_else(|| anyhow!("null `{}` at row {}", name, row))
}

pub(crate) fn micros_to_naive(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros).map(|dt| dt.naive_utc())
}

pub(crate) fn naive_to_micros(ts: &NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_micros()
}

fn required_ts(arr: &TimestampMicrosecondArray, row: usize, name: &str) -> Result<NaiveDateTime> {
    let micros = required(arr, row, name)?;
    micros_to_naive(micros).ok_or_else(|| anyhow!("`{}` out of range at row {}", name, row))
}

pub(crate) fn year_from(v: i64) -> Result<i32> {
    i32::try_from(v).with_context(|| format!("YEAR value {} out of range", v))
}

pub(crate) fn month_from(v: i64) -> Result<u32> {
    u32::try_from(v).with_context(|| format!("MONTH value {} out of range", v))
}

impl TableRow for RideRecord {
    const COLUMNS: &'static [&'static str] = &[
        source::PICKUP,
        source::DROPOFF,
        source::PICKUP_LOCATION,
        source::DROPOFF_LOCATION,
        source::TRIP_DISTANCE,
        source::TOTAL_AMOUNT,
        source::FARE_AMOUNT,
        source::TIP_AMOUNT,
        source::PAYMENT_TYPE,
        source::PASSENGER_COUNT,
        YEAR,
        MONTH,
    ];

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new(source::PICKUP, timestamp_type(), true),
            Field::new(source::DROPOFF, timestamp_type(), true),
            Field::new(source::PICKUP_LOCATION, DataType::Int64, true),
            Field::new(source::DROPOFF_LOCATION, DataType::Int64, true),
            Field::new(source::TRIP_DISTANCE, DataType::Float64, true),
            Field::new(source::TOTAL_AMOUNT, DataType::Float64, true),
            Field::new(source::FARE_AMOUNT, DataType::Float64, true),
            Field::new(source::TIP_AMOUNT, DataType::Float64, true),
            Field::new(source::PAYMENT_TYPE, DataType::Int64, true),
            Field::new(source::PASSENGER_COUNT, DataType::Int64, true),
            Field::new(YEAR, DataType::Int64, false),
            Field::new(MONTH, DataType::Int64, false),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let ts = |f: fn(&RideRecord) -> Option<NaiveDateTime>| -> ArrayRef {
            Arc::new(TimestampMicrosecondArray::from(
                rows.iter()
                    .map(|r| f(r).as_ref().map(naive_to_micros))
                    .collect::<Vec<_>>(),
            ))
        };
        let ints = |f: fn(&RideRecord) -> Option<i64>| -> ArrayRef {
            Arc::new(Int64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
        };
        let floats = |f: fn(&RideRecord) -> Option<f64>| -> ArrayRef {
            Arc::new(Float64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
        };
        let columns = vec![
            ts(|r| r.pickup),
            ts(|r| r.dropoff),
            ints(|r| r.pickup_location_id),
            ints(|r| r.dropoff_location_id),
            floats(|r| r.trip_distance),
            floats(|r| r.total_amount),
            floats(|r| r.fare_amount),
            floats(|r| r.tip_amount),
            ints(|r| r.payment_type),
            ints(|r| r.passenger_count),
            ints(|r| Some(r.year as i64)),
            ints(|r| Some(r.month as i64)),
        ];
        RecordBatch::try_new(Self::schema(), columns).context("building ride record batch")
    }
}

impl FromBatch for RideRecord {
    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        let pickup = ts_column(batch, source::PICKUP)?;
        let dropoff = ts_column(batch, source::DROPOFF)?;
        let pu = i64_column(batch, source::PICKUP_LOCATION)?;
        let dl = i64_column(batch, source::DROPOFF_LOCATION)?;
        let distance = f64_column(batch, source::TRIP_DISTANCE)?;
        let total = f64_column(batch, source::TOTAL_AMOUNT)?;
        let fare = f64_column(batch, source::FARE_AMOUNT)?;
        let tip = f64_column(batch, source::TIP_AMOUNT)?;
        let payment = i64_column(batch, source::PAYMENT_TYPE)?;
        let passengers = i64_column(batch, source::PASSENGER_COUNT)?;
        let year = i64_column(batch, YEAR)?;
        let month = i64_column(batch, MONTH)?;

        (0..batch.num_rows())
            .map(|i| {
                Ok(RideRecord {
                    pickup: opt(&pickup, i).and_then(micros_to_naive),
                    dropoff: opt(&dropoff, i).and_then(micros_to_naive),
                    pickup_location_id: opt(&pu, i),
                    dropoff_location_id: opt(&dl, i),
                    trip_distance: opt(&distance, i),
                    total_amount: opt(&total, i),
                    fare_amount: opt(&fare, i),
                    tip_amount: opt(&tip, i),
                    payment_type: opt(&payment, i),
                    passenger_count: opt(&passengers, i),
                    year: year_from(required(&year, i, YEAR)?)?,
                    month: month_from(required(&month, i, MONTH)?)?,
                })
            })
            .collect()
    }
}

impl TableRow for FilteredRecord {
    const COLUMNS: &'static [&'static str] = &[
        canonical::PICKUP,
        canonical::DROPOFF,
        canonical::PICKUP_LOCATION,
        canonical::DROPOFF_LOCATION,
        canonical::TRIP_DISTANCE,
        canonical::FARE_AMOUNT,
        canonical::TIP_AMOUNT,
        canonical::PAYMENT_TYPE,
        canonical::PASSENGER_COUNT,
        YEAR,
        MONTH,
    ];

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new(canonical::PICKUP, timestamp_type(), false),
            Field::new(canonical::DROPOFF, timestamp_type(), false),
            Field::new(canonical::PICKUP_LOCATION, DataType::Int64, false),
            Field::new(canonical::DROPOFF_LOCATION, DataType::Int64, false),
            Field::new(canonical::TRIP_DISTANCE, DataType::Float64, false),
            Field::new(canonical::FARE_AMOUNT, DataType::Float64, true),
            Field::new(canonical::TIP_AMOUNT, DataType::Float64, true),
            Field::new(canonical::PAYMENT_TYPE, DataType::Int64, true),
            Field::new(canonical::PASSENGER_COUNT, DataType::Int64, false),
            Field::new(YEAR, DataType::Int64, false),
            Field::new(MONTH, DataType::Int64, false),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(TimestampMicrosecondArray::from_iter_values(
                rows.iter().map(|r| naive_to_micros(&r.pickup)),
            )),
            Arc::new(TimestampMicrosecondArray::from_iter_values(
                rows.iter().map(|r| naive_to_micros(&r.dropoff)),
            )),
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|r| r.pickup_location_id),
            )),
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|r| r.dropoff_location_id),
            )),
            Arc::new(Float64Array::from_iter_values(
                rows.iter().map(|r| r.trip_distance),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.fare_amount).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.tip_amount).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.payment_type).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|r| r.passenger_count),
            )),
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|r| r.year as i64),
            )),
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|r| r.month as i64),
            )),
        ];
        RecordBatch::try_new(Self::schema(), columns).context("building filtered record batch")
    }
}

impl FromBatch for FilteredRecord {
    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        let pickup = ts_column(batch, canonical::PICKUP)?;
        let dropoff = ts_column(batch, canonical::DROPOFF)?;
        let pu = i64_column(batch, canonical::PICKUP_LOCATION)?;
        let dl = i64_column(batch, canonical::DROPOFF_LOCATION)?;
        let distance = f64_column(batch, canonical::TRIP_DISTANCE)?;
        let fare = f64_column(batch, canonical::FARE_AMOUNT)?;
        let tip = f64_column(batch, canonical::TIP_AMOUNT)?;
        let payment = i64_column(batch, canonical::PAYMENT_TYPE)?;
        let passengers = i64_column(batch, canonical::PASSENGER_COUNT)?;
        let year = i64_column(batch, YEAR)?;
        let month = i64_column(batch, MONTH)?;

        (0..batch.num_rows())
            .map(|i| {
                Ok(FilteredRecord {
                    pickup: required_ts(&pickup, i, canonical::PICKUP)?,
                    dropoff: required_ts(&dropoff, i, canonical::DROPOFF)?,
                    pickup_location_id: required(&pu, i, canonical::PICKUP_LOCATION)?,
                    dropoff_location_id: required(&dl, i, canonical::DROPOFF_LOCATION)?,
                    trip_distance: required(&distance, i, canonical::TRIP_DISTANCE)?,
                    fare_amount: opt(&fare, i),
                    tip_amount: opt(&tip, i),
                    payment_type: opt(&payment, i),
                    passenger_count: required(&passengers, i, canonical::PASSENGER_COUNT)?,
                    year: year_from(required(&year, i, YEAR)?)?,
                    month: month_from(required(&month, i, MONTH)?)?,
                })
            })
            .collect()
    }
}

impl TableRow for HourLocationCell {
    const COLUMNS: &'static [&'static str] = &[
        canonical::PICKUP_HOUR,
        canonical::PICKUP_LOCATION,
        canonical::RIDES,
        YEAR,
        MONTH,
    ];

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new(canonical::PICKUP_HOUR, timestamp_type(), false),
            Field::new(canonical::PICKUP_LOCATION, DataType::Int64, false),
            Field::new(canonical::RIDES, DataType::UInt64, false),
            Field::new(YEAR, DataType::Int64, false),
            Field::new(MONTH, DataType::Int64, false),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(TimestampMicrosecondArray::from_iter_values(
                rows.iter().map(|c| naive_to_micros(&c.hour)),
            )),
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|c| c.location_id),
            )),
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|c| c.rides))),
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|c| c.year as i64),
            )),
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|c| c.month as i64),
            )),
        ];
        RecordBatch::try_new(Self::schema(), columns).context("building hourly grid batch")
    }
}

impl FromBatch for HourLocationCell {
    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        let hour = ts_column(batch, canonical::PICKUP_HOUR)?;
        let location = i64_column(batch, canonical::PICKUP_LOCATION)?;
        let rides: UInt64Array = primitive_column(batch, canonical::RIDES, DataType::UInt64)?;
        let year = i64_column(batch, YEAR)?;
        let month = i64_column(batch, MONTH)?;

        (0..batch.num_rows())
            .map(|i| {
                Ok(HourLocationCell {
                    hour: required_ts(&hour, i, canonical::PICKUP_HOUR)?,
                    location_id: required(&location, i, canonical::PICKUP_LOCATION)?,
                    rides: required(&rides, i, canonical::RIDES)?,
                    year: year_from(required(&year, i, YEAR)?)?,
                    month: month_from(required(&month, i, MONTH)?)?,
                })
            })
            .collect()
    }
}

impl TableRow for FilterStats {
    const COLUMNS: &'static [&'static str] = &[
        YEAR,
        MONTH,
        "STATUS",
        "REASON",
        "TOTAL_RECORDS",
        "DROPPED_MISSING",
        "DROPPED_DURATION",
        "DROPPED_TOTAL_AMOUNT",
        "DROPPED_DISTANCE",
        "DROPPED_LOCATION",
        "DROPPED_DATE_RANGE",
        "DROPPED_PASSENGER_COUNT",
        "VALID_RECORDS",
        "RECORDS_DROPPED",
        "PERCENT_DROPPED",
        "MAX_DURATION_SECS",
        "MAX_TOTAL_AMOUNT",
        "MAX_DISTANCE",
    ];

    fn schema() -> SchemaRef {
        let fields: Vec<Field> = Self::COLUMNS
            .iter()
            .enumerate()
            .map(|(i, name)| match i {
                0 | 1 => Field::new(*name, DataType::Int64, false),
                2 => Field::new(*name, DataType::Utf8, false),
                3 => Field::new(*name, DataType::Utf8, true),
                4..=13 => Field::new(*name, DataType::UInt64, false),
                14 => Field::new(*name, DataType::Float64, false),
                _ => Field::new(*name, DataType::Float64, true),
            })
            .collect();
        Arc::new(Schema::new(fields))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let counter = |f: fn(&FilterStats) -> u64| -> ArrayRef {
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(f)))
        };
        let bound = |f: fn(&crate::model::Thresholds) -> f64| -> ArrayRef {
            Arc::new(Float64Array::from(
                rows.iter()
                    .map(|r| r.thresholds.as_ref().map(f))
                    .collect::<Vec<_>>(),
            ))
        };
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|r| r.year as i64),
            )),
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|r| r.month as i64),
            )),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|r| r.status.label()),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.status.reason()).collect::<Vec<_>>(),
            )),
            counter(|r| r.total_records),
            counter(|r| r.dropped_missing),
            counter(|r| r.dropped_duration),
            counter(|r| r.dropped_total_amount),
            counter(|r| r.dropped_distance),
            counter(|r| r.dropped_location),
            counter(|r| r.dropped_date_range),
            counter(|r| r.dropped_passenger_count),
            counter(|r| r.valid_records),
            counter(|r| r.records_dropped),
            Arc::new(Float64Array::from_iter_values(
                rows.iter().map(|r| r.percent_dropped),
            )),
            bound(|t| t.max_duration_secs),
            bound(|t| t.max_total_amount),
            bound(|t| t.max_distance),
        ];
        RecordBatch::try_new(Self::schema(), columns).context("building filter report batch")
    }
}
