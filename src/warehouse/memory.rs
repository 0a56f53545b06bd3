// src/warehouse/memory.rs
use super::{
    collect_partition_keys, ensure_partition_columns, select_partition, validate_table_name,
    Warehouse, WriteMode,
};
use crate::model::YearMonth;
use anyhow::{anyhow, Result};
use arrow::record_batch::RecordBatch;
use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

/// In-process warehouse holding every table as a list of batches.
#[derive(Default)]
pub struct MemoryWarehouse {
    tables: RwLock<HashMap<String, Vec<RecordBatch>>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table, replacing any previous content.
    pub fn with_table(self, table: &str, batches: Vec<RecordBatch>) -> Result<Self> {
        self.write(table, &batches, WriteMode::Replace)?;
        Ok(self)
    }

    /// Every batch currently stored for `table`.
    pub fn batches(&self, table: &str) -> Result<Vec<RecordBatch>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| anyhow!("memory warehouse lock poisoned"))?;
        tables
            .get(table)
            .cloned()
            .ok_or_else(|| anyhow!("table `{}` does not exist", table))
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.batches(table)?.iter().map(|b| b.num_rows()).sum())
    }
}

impl Warehouse for MemoryWarehouse {
    fn partitions(&self, table: &str) -> Result<Vec<YearMonth>> {
        let batches = self.batches(table)?;
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for batch in &batches {
            ensure_partition_columns(&batch.schema(), table)?;
            collect_partition_keys(batch, table, &mut seen, &mut keys)?;
        }
        Ok(keys)
    }

    fn read_partition(&self, table: &str, key: YearMonth) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        for batch in self.batches(table)? {
            if let Some(selected) = select_partition(&batch, key, table)? {
                out.push(selected);
            }
        }
        Ok(out)
    }

    fn write(&self, table: &str, batches: &[RecordBatch], mode: WriteMode) -> Result<()> {
        validate_table_name(table)?;
        let mut tables = self
            .tables
            .write()
            .map_err(|_| anyhow!("memory warehouse lock poisoned"))?;
        let entry = tables.entry(table.to_string()).or_default();
        if mode == WriteMode::Replace {
            entry.clear();
        }
        entry.extend(batches.iter().filter(|b| b.num_rows() > 0).cloned());
        Ok(())
    }

    fn drop_table_if_exists(&self, table: &str) -> Result<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| anyhow!("memory warehouse lock poisoned"))?;
        tables.remove(table);
        Ok(())
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        let tables = self
            .tables
            .read()
            .map_err(|_| anyhow!("memory warehouse lock poisoned"))?;
        Ok(tables.contains_key(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RideRecord, TableRow};

    fn ride(year: i32, month: u32) -> RideRecord {
        RideRecord {
            year,
            month,
            ..Default::default()
        }
    }

    #[test]
    fn replace_discards_previous_rows() -> Result<()> {
        let wh = MemoryWarehouse::new();
        let two = RideRecord::to_batch(&[ride(2024, 1), ride(2024, 2)])?;
        let one = RideRecord::to_batch(&[ride(2024, 3)])?;
        wh.write("raw", &[two], WriteMode::Replace)?;
        wh.write("raw", &[one.clone()], WriteMode::Append)?;
        assert_eq!(wh.row_count("raw")?, 3);
        wh.write("raw", &[one], WriteMode::Replace)?;
        assert_eq!(wh.row_count("raw")?, 1);
        assert_eq!(wh.partitions("raw")?, vec![YearMonth::new(2024, 3)]);
        Ok(())
    }

    #[test]
    fn missing_table_is_an_error_and_drop_is_idempotent() -> Result<()> {
        let wh = MemoryWarehouse::new();
        assert!(wh.partitions("nope").is_err());
        wh.drop_table_if_exists("nope")?;
        wh.drop_table_if_exists("nope")?;
        assert!(!wh.table_exists("nope")?);
        Ok(())
    }

    #[test]
    fn read_partition_spans_batches() -> Result<()> {
        let wh = MemoryWarehouse::new().with_table(
            "raw",
            vec![
                RideRecord::to_batch(&[ride(2024, 1), ride(2024, 2)])?,
                RideRecord::to_batch(&[ride(2024, 1)])?,
            ],
        )?;
        let jan = wh.read_partition("raw", YearMonth::new(2024, 1))?;
        assert_eq!(jan.iter().map(|b| b.num_rows()).sum::<usize>(), 2);
        assert_eq!(
            wh.partitions("raw")?,
            vec![YearMonth::new(2024, 1), YearMonth::new(2024, 2)]
        );
        Ok(())
    }
}
