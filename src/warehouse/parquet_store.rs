// src/warehouse/parquet_store.rs
use super::{
    collect_partition_keys, ensure_partition_columns, partition_mask, validate_table_name,
    Warehouse, WriteMode,
};
use crate::model::table_row::{column_index, MONTH, YEAR};
use crate::model::YearMonth;
use anyhow::{bail, Context, Result};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use glob::{glob, Pattern};
use parquet::arrow::arrow_reader::{
    ArrowPredicateFn, ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder, RowFilter,
};
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::{
    collections::HashSet,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

const PART_PREFIX: &str = "part-";
const READ_BATCH_SIZE: usize = 65_536;

/// Warehouse backed by a directory tree: `<root>/<table>/part-NNNNN.parquet`.
///
/// Every part file is written to a `.tmp` path first and renamed into place.
/// A `Replace` builds the new table in a hidden staging directory and swaps it
/// in, so readers never observe a half-written table.
pub struct ParquetWarehouse {
    root: PathBuf,
    props: WriterProperties,
}

impl ParquetWarehouse {
    /// Open (creating if needed) a warehouse rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating warehouse root {}", root.display()))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_dictionary_enabled(true)
            .build();
        Ok(Self { root, props })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> Result<PathBuf> {
        validate_table_name(table)?;
        Ok(self.root.join(table))
    }

    /// Part files of `table`, in write order.
    pub fn part_files(&self, table: &str) -> Result<Vec<PathBuf>> {
        let dir = self.table_dir(table)?;
        if !dir.is_dir() {
            bail!(
                "table `{}` does not exist under {}",
                table,
                self.root.display()
            );
        }
        let pattern = format!(
            "{}/{}*.parquet",
            Pattern::escape(&dir.display().to_string()),
            PART_PREFIX
        );
        let mut files: Vec<PathBuf> = glob(&pattern)
            .context("invalid glob pattern for part files")?
            .filter_map(|entry| match entry {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("cannot read glob entry: {:?}", e);
                    None
                }
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn open_builder(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>> {
        let file = File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
        Ok(ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("failed to create reader builder for `{}`", path.display()))?
            .with_batch_size(READ_BATCH_SIZE))
    }

    /// Leaf mask over the `YEAR` / `MONTH` root columns of the file.
    fn key_mask(builder: &ParquetRecordBatchReaderBuilder<File>, table: &str) -> Result<ProjectionMask> {
        let schema = builder.schema().clone();
        ensure_partition_columns(&schema, table)?;
        let indices: Vec<usize> = [YEAR, MONTH]
            .iter()
            .filter_map(|c| column_index(&schema, c))
            .collect();
        Ok(ProjectionMask::roots(builder.parquet_schema(), indices))
    }

    /// Reader over the partition key columns only.
    fn key_reader(path: &Path, table: &str) -> Result<ParquetRecordBatchReader> {
        let builder = Self::open_builder(path)?;
        let mask = Self::key_mask(&builder, table)?;
        builder
            .with_projection(mask)
            .build()
            .with_context(|| format!("failed to build batch reader for `{}`", path.display()))
    }

    /// Reader yielding only the rows of `key`. The key columns are decoded
    /// first and the remaining columns only for matching rows.
    fn partition_reader(path: &Path, key: YearMonth, table: &str) -> Result<ParquetRecordBatchReader> {
        let builder = Self::open_builder(path)?;
        let mask = Self::key_mask(&builder, table)?;
        let table_name = table.to_string();
        let predicate = ArrowPredicateFn::new(mask, move |batch: RecordBatch| {
            partition_mask(&batch, key, &table_name).map_err(|e| ArrowError::ExternalError(e.into()))
        });
        builder
            .with_row_filter(RowFilter::new(vec![Box::new(predicate)]))
            .build()
            .with_context(|| format!("failed to build batch reader for `{}`", path.display()))
    }

    /// Write `batches` as one part file `dir/part-<index>.parquet`.
    fn write_part(&self, dir: &Path, index: usize, batches: &[RecordBatch]) -> Result<()> {
        let Some(first) = batches.iter().find(|b| b.num_rows() > 0) else {
            return Ok(());
        };
        let final_path = dir.join(format!("{}{:05}.parquet", PART_PREFIX, index));
        let tmp_path = final_path.with_extension("parquet.tmp");

        let file = File::create(&tmp_path)
            .with_context(|| format!("could not create temporary file `{}`", tmp_path.display()))?;
        let mut writer =
            ArrowWriter::try_new(BufWriter::new(file), first.schema(), Some(self.props.clone()))
                .context("creating ArrowWriter for part file")?;
        let mut rows = 0;
        for batch in batches.iter().filter(|b| b.num_rows() > 0) {
            writer
                .write(batch)
                .with_context(|| format!("writing batch to `{}`", tmp_path.display()))?;
            rows += batch.num_rows();
        }
        writer.close().context("closing ArrowWriter for part file")?;

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to rename `{}` to `{}`",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        debug!(path = %final_path.display(), rows, "wrote part file");
        Ok(())
    }

    fn replace(&self, table: &str, dir: &Path, batches: &[RecordBatch]) -> Result<()> {
        let stamp = Utc::now().timestamp_micros();
        let staging = self.root.join(format!(".{}.staging-{}", table, stamp));
        fs::create_dir_all(&staging)
            .with_context(|| format!("creating staging dir `{}`", staging.display()))?;

        if let Err(e) = self.write_part(&staging, 0, batches) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        if dir.exists() {
            let retired = self.root.join(format!(".{}.retired-{}", table, stamp));
            fs::rename(dir, &retired)
                .with_context(|| format!("retiring `{}`", dir.display()))?;
            fs::rename(&staging, dir)
                .with_context(|| format!("swapping staging dir into `{}`", dir.display()))?;
            fs::remove_dir_all(&retired)
                .with_context(|| format!("removing retired dir `{}`", retired.display()))?;
        } else {
            fs::rename(&staging, dir)
                .with_context(|| format!("moving staging dir to `{}`", dir.display()))?;
        }
        Ok(())
    }
}

/// One past the highest part index in `dir`, or 0 for an empty table.
fn next_part_index(dir: &Path) -> Result<usize> {
    let mut next = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        let index = name
            .strip_prefix(PART_PREFIX)
            .and_then(|rest| rest.strip_suffix(".parquet"))
            .and_then(|digits| digits.parse::<usize>().ok());
        if let Some(index) = index {
            next = next.max(index + 1);
        }
    }
    Ok(next)
}

impl Warehouse for ParquetWarehouse {
    #[instrument(level = "debug", skip(self))]
    fn partitions(&self, table: &str) -> Result<Vec<YearMonth>> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for path in self.part_files(table)? {
            for batch in Self::key_reader(&path, table)? {
                let batch = batch
                    .with_context(|| format!("error reading RecordBatch from `{}`", path.display()))?;
                collect_partition_keys(&batch, table, &mut seen, &mut keys)?;
            }
        }
        Ok(keys)
    }

    #[instrument(level = "debug", skip(self), fields(key = %key))]
    fn read_partition(&self, table: &str, key: YearMonth) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        for path in self.part_files(table)? {
            for batch in Self::partition_reader(&path, key, table)? {
                let batch = batch
                    .with_context(|| format!("error reading RecordBatch from `{}`", path.display()))?;
                if batch.num_rows() > 0 {
                    out.push(batch);
                }
            }
        }
        Ok(out)
    }

    #[instrument(level = "debug", skip(self, batches), fields(batches = batches.len()))]
    fn write(&self, table: &str, batches: &[RecordBatch], mode: WriteMode) -> Result<()> {
        let dir = self.table_dir(table)?;
        match mode {
            WriteMode::Replace => self.replace(table, &dir, batches),
            WriteMode::Append => {
                fs::create_dir_all(&dir)
                    .with_context(|| format!("creating table dir `{}`", dir.display()))?;
                let index = next_part_index(&dir)?;
                self.write_part(&dir, index, batches)
            }
        }
    }

    fn drop_table_if_exists(&self, table: &str) -> Result<()> {
        let dir = self.table_dir(table)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("dropping table dir `{}`", dir.display()))?;
            info!(table, "dropped table");
        }
        Ok(())
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.table_dir(table)?.is_dir())
    }
}
