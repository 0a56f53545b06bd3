// src/warehouse/mod.rs
//! Storage collaborator: named tables of Arrow batches, partitioned by the
//! `YEAR` / `MONTH` columns.

pub mod memory;
pub mod parquet_store;

use crate::error::PipelineError;
use crate::model::table_row::{column_index, month_from, year_from, MONTH, YEAR};
use crate::model::YearMonth;
use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{Array, BooleanArray, Int64Array},
    compute::{and, cast, filter_record_batch, kernels::cmp::eq},
    datatypes::{DataType, Schema},
    record_batch::RecordBatch,
};
use std::collections::HashSet;
use tracing::{debug, warn};

pub use self::memory::MemoryWarehouse;
pub use self::parquet_store::ParquetWarehouse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Drop whatever the table held and write the given batches in its place.
    Replace,
    /// Add the given batches to the existing table.
    Append,
}

/// Minimal table surface the pipeline needs from a storage backend.
pub trait Warehouse: Send + Sync {
    /// Distinct `(YEAR, MONTH)` keys in the order they are first seen.
    fn partitions(&self, table: &str) -> Result<Vec<YearMonth>>;

    /// Every row of `table` whose partition key equals `key`.
    fn read_partition(&self, table: &str, key: YearMonth) -> Result<Vec<RecordBatch>>;

    fn write(&self, table: &str, batches: &[RecordBatch], mode: WriteMode) -> Result<()>;

    fn drop_table_if_exists(&self, table: &str) -> Result<()>;

    fn table_exists(&self, table: &str) -> Result<bool>;
}

/// Writes into one destination table so that the first write replaces it and
/// every later write appends.
pub struct OrderedSink<'a> {
    warehouse: &'a dyn Warehouse,
    table: String,
    replaced: bool,
    writes: usize,
}

impl<'a> OrderedSink<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, table: impl Into<String>) -> Self {
        Self {
            warehouse,
            table: table.into(),
            replaced: false,
            writes: 0,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn has_replaced(&self) -> bool {
        self.replaced
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Write with the mode implied by the sink's history.
    pub fn write(&mut self, batches: &[RecordBatch]) -> Result<WriteMode> {
        let mode = if self.replaced {
            WriteMode::Append
        } else {
            WriteMode::Replace
        };
        self.write_with(batches, mode)?;
        Ok(mode)
    }

    /// Write with an explicit mode. Appending before the first replace fails
    /// with [`PipelineError::WriteOrderingViolation`].
    pub fn write_with(&mut self, batches: &[RecordBatch], mode: WriteMode) -> Result<()> {
        if mode == WriteMode::Append && !self.replaced {
            return Err(PipelineError::WriteOrderingViolation {
                table: self.table.clone(),
            }
            .into());
        }
        self.warehouse.write(&self.table, batches, mode)?;
        if mode == WriteMode::Replace {
            self.replaced = true;
        }
        self.writes += 1;
        debug!(table = %self.table, ?mode, writes = self.writes, "sink write");
        Ok(())
    }
}

/// Table names become directory names, so keep them to one path component.
pub(crate) fn validate_table_name(table: &str) -> Result<()> {
    if table.is_empty()
        || table == "."
        || table == ".."
        || table.starts_with('.')
        || table.contains(['/', '\\'])
    {
        anyhow::bail!("invalid table name `{}`", table);
    }
    Ok(())
}

fn key_column(batch: &RecordBatch, name: &str, table: &str) -> Result<Int64Array> {
    let idx = column_index(&batch.schema(), name).ok_or_else(|| PipelineError::SchemaMismatch {
        table: table.to_string(),
        missing: vec![name.to_string()],
    })?;
    let arr = cast(batch.column(idx).as_ref(), &DataType::Int64)
        .with_context(|| format!("casting `{}` of `{}` to Int64", name, table))?;
    arr.as_any()
        .downcast_ref::<Int64Array>()
        .cloned()
        .ok_or_else(|| anyhow!("`{}` of `{}` is not integral", name, table))
}

pub(crate) fn ensure_partition_columns(schema: &Schema, table: &str) -> Result<(), PipelineError> {
    crate::model::ensure_columns(schema, &[YEAR, MONTH], table)
}

/// Append the keys found in `batch` to `out`, skipping ones already seen.
/// Rows with a null year or month belong to no partition. So do rows whose
/// year or month cannot be a calendar value (negative month, year outside
/// i32); they are counted and logged rather than failing the scan.
pub(crate) fn collect_partition_keys(
    batch: &RecordBatch,
    table: &str,
    seen: &mut HashSet<YearMonth>,
    out: &mut Vec<YearMonth>,
) -> Result<()> {
    let years = key_column(batch, YEAR, table)?;
    let months = key_column(batch, MONTH, table)?;
    let mut unusable = 0usize;
    for i in 0..batch.num_rows() {
        if years.is_null(i) || months.is_null(i) {
            continue;
        }
        let (Ok(year), Ok(month)) = (year_from(years.value(i)), month_from(months.value(i))) else {
            unusable += 1;
            continue;
        };
        let key = YearMonth::new(year, month);
        if seen.insert(key) {
            out.push(key);
        }
    }
    if unusable > 0 {
        warn!(table, rows = unusable, "skipping rows with out-of-range partition keys");
    }
    Ok(())
}

/// Row mask of `batch` for partition `key`. Null keys never match.
pub(crate) fn partition_mask(batch: &RecordBatch, key: YearMonth, table: &str) -> Result<BooleanArray> {
    let years = key_column(batch, YEAR, table)?;
    let months = key_column(batch, MONTH, table)?;
    let year_mask = eq(&years, &Int64Array::new_scalar(key.year as i64))?;
    let month_mask = eq(&months, &Int64Array::new_scalar(key.month as i64))?;
    Ok(and(&year_mask, &month_mask)?)
}

/// Rows of `batch` tagged with `key`, or `None` when there are none.
pub(crate) fn select_partition(
    batch: &RecordBatch,
    key: YearMonth,
    table: &str,
) -> Result<Option<RecordBatch>> {
    let mask = partition_mask(batch, key, table)?;
    let selected = filter_record_batch(batch, &mask)?;
    Ok((selected.num_rows() > 0).then_some(selected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::Field;
    use std::sync::Arc;

    fn keyed_batch(keys: &[(Option<i64>, Option<i64>)]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("Year", DataType::Int64, true),
            Field::new("Month", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from_iter_values(0..keys.len() as i64)),
                Arc::new(Int64Array::from(
                    keys.iter().map(|k| k.0).collect::<Vec<_>>(),
                )),
                Arc::new(Int64Array::from(
                    keys.iter().map(|k| k.1).collect::<Vec<_>>(),
                )),
            ],
        )
        .unwrap()
    }

    #[test]
    fn keys_come_back_in_first_seen_order_without_nulls() -> Result<()> {
        let batch = keyed_batch(&[
            (Some(2024), Some(2)),
            (Some(2023), Some(12)),
            (None, Some(1)),
            (Some(2024), Some(2)),
        ]);
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        collect_partition_keys(&batch, "t", &mut seen, &mut keys)?;
        assert_eq!(keys, vec![YearMonth::new(2024, 2), YearMonth::new(2023, 12)]);
        Ok(())
    }

    #[test]
    fn out_of_range_keys_are_skipped_not_fatal() -> Result<()> {
        let batch = keyed_batch(&[
            (Some(2024), Some(-1)),
            (Some(1i64 << 40), Some(3)),
            (Some(2024), Some(3)),
            (Some(2024), Some(13)),
        ]);
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        collect_partition_keys(&batch, "t", &mut seen, &mut keys)?;
        assert_eq!(keys, vec![YearMonth::new(2024, 3), YearMonth::new(2024, 13)]);
        Ok(())
    }

    #[test]
    fn select_partition_keeps_only_matching_rows() -> Result<()> {
        let batch = keyed_batch(&[
            (Some(2024), Some(1)),
            (Some(2024), Some(2)),
            (Some(2024), Some(1)),
            (Some(2024), None),
        ]);
        let jan = select_partition(&batch, YearMonth::new(2024, 1), "t")?.unwrap();
        let ids = jan
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.values().to_vec(), vec![0, 2]);
        assert!(select_partition(&batch, YearMonth::new(2025, 1), "t")?.is_none());
        Ok(())
    }

    #[test]
    fn missing_key_column_is_a_schema_mismatch() {
        let schema = Arc::new(Schema::new(vec![Field::new("YEAR", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![2024]))]).unwrap();
        let err = select_partition(&batch, YearMonth::new(2024, 1), "raw").unwrap_err();
        assert!(crate::error::is_fatal(&err));
    }

    #[test]
    fn sink_rejects_append_before_replace() -> Result<()> {
        let warehouse = MemoryWarehouse::new();
        let mut sink = OrderedSink::new(&warehouse, "out");
        let batch = keyed_batch(&[(Some(2024), Some(1))]);

        let err = sink
            .write_with(&[batch.clone()], WriteMode::Append)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::WriteOrderingViolation { table }) if table == "out"
        ));
        assert!(!warehouse.table_exists("out")?);

        assert_eq!(sink.write(&[batch.clone()])?, WriteMode::Replace);
        assert_eq!(sink.write(&[batch])?, WriteMode::Append);
        assert_eq!(sink.writes(), 2);
        assert_eq!(warehouse.row_count("out")?, 2);
        Ok(())
    }

    #[test]
    fn table_names_stay_inside_the_root() {
        assert!(validate_table_name("yellow_taxi_data_raw").is_ok());
        assert!(validate_table_name("NYC_DATA.PUBLIC.RAW").is_ok());
        assert!(validate_table_name("../etc").is_err());
        assert!(validate_table_name("a/b").is_err());
        assert!(validate_table_name("").is_err());
    }
}
