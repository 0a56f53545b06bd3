// src/pipeline/mod.rs
//! Month-by-month orchestration of the filter and transform stages.

pub mod report;

use crate::config::PipelineConfig;
use crate::error::{self, PipelineError};
use crate::filter::{FunnelFilter, FunnelOutcome, QuantileEstimator};
use crate::model::{
    ensure_columns, FilterStats, FilteredRecord, FromBatch, HourLocationCell, MonthStatus,
    RideRecord, TableRow, TransformStats, YearMonth,
};
use crate::transform::{transform_month, DenseGrid};
use crate::warehouse::{OrderedSink, Warehouse};
use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{info, instrument, warn};

pub use report::PipelineReport;

/// Everything a run needs, passed explicitly instead of living in globals.
#[derive(Clone, Copy)]
pub struct PipelineContext<'a> {
    pub warehouse: &'a dyn Warehouse,
    pub config: &'a PipelineConfig,
    pub estimator: &'a dyn QuantileEstimator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Stage {
    Filter,
    Transform,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrder {
    /// Order of first appearance in the table.
    Scan,
    /// Ascending by year, then month.
    Chronological,
}

/// Distinct `(YEAR, MONTH)` keys of `table`.
pub fn month_keys(warehouse: &dyn Warehouse, table: &str, order: KeyOrder) -> Result<Vec<YearMonth>> {
    let mut keys = warehouse
        .partitions(table)
        .with_context(|| format!("listing partitions of `{}`", table))?;
    if order == KeyOrder::Chronological {
        keys.sort();
    }
    Ok(keys)
}

/// Decode batches read from `table`, failing fatally on missing columns.
fn decode<R: FromBatch>(batches: &[arrow::record_batch::RecordBatch], table: &str) -> Result<Vec<R>> {
    for batch in batches {
        ensure_columns(&batch.schema(), R::COLUMNS, table)?;
    }
    R::from_batches(batches)
}

pub struct Orchestrator<'a> {
    ctx: PipelineContext<'a>,
    pool: Option<rayon::ThreadPool>,
    width: usize,
}

impl<'a> Orchestrator<'a> {
    /// Months are computed `min(parallel_months, cpus)` at a time; a width of
    /// one runs everything on the calling thread.
    pub fn new(ctx: PipelineContext<'a>) -> Result<Self> {
        let width = ctx.config.parallel_months.clamp(1, num_cpus::get().max(1));
        let pool = if width > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(width)
                    .thread_name(|i| format!("month-worker-{i}"))
                    .build()
                    .context("building month worker pool")?,
            )
        } else {
            None
        };
        Ok(Self { ctx, pool, width })
    }

    /// Run `f` for every key of `chunk`, in parallel when a pool is configured.
    /// Results keep the order of `chunk`.
    fn map_months<T, F>(&self, chunk: &[YearMonth], f: F) -> Vec<Result<T>>
    where
        T: Send,
        F: Fn(YearMonth) -> Result<T> + Send + Sync,
    {
        match &self.pool {
            Some(pool) => pool.install(|| chunk.par_iter().map(|&key| f(key)).collect()),
            None => chunk.iter().map(|&key| f(key)).collect(),
        }
    }

    pub fn run(&self) -> Result<PipelineReport> {
        self.run_stage(Stage::All)
    }

    #[instrument(level = "info", skip(self))]
    pub fn run_stage(&self, stage: Stage) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        if matches!(stage, Stage::Filter | Stage::All) {
            report.filter = self.run_filter_stage()?;
            if let Some(table) = &self.ctx.config.report_table {
                report.persist_filter_stats(self.ctx.warehouse, table)?;
            }
        }
        if matches!(stage, Stage::Transform | Stage::All) {
            report.transform = self.run_transform_stage()?;
        }
        info!(
            filter_months = report.filter.len(),
            transform_months = report.transform.len(),
            valid_records = report.total_valid_records(),
            failed = report.failed_months(),
            "pipeline finished"
        );
        Ok(report)
    }

    fn filter_month(&self, funnel: &FunnelFilter<'_>, key: YearMonth) -> Result<FunnelOutcome> {
        let table = &self.ctx.config.source_table;
        let batches = self
            .ctx
            .warehouse
            .read_partition(table, key)
            .with_context(|| format!("reading `{}` for {}", table, key))?;
        let records: Vec<RideRecord> = decode(&batches, table)?;
        Ok(funnel.apply(key, &records)?)
    }

    /// Filter every month of the source table into the filtered table.
    #[instrument(level = "info", skip(self), fields(source = %self.ctx.config.source_table))]
    pub fn run_filter_stage(&self) -> Result<Vec<FilterStats>> {
        let cfg = self.ctx.config;
        self.ctx
            .warehouse
            .drop_table_if_exists(&cfg.filtered_table)
            .with_context(|| format!("dropping `{}`", cfg.filtered_table))?;

        let keys = month_keys(self.ctx.warehouse, &cfg.source_table, KeyOrder::Scan)?;
        info!(months = keys.len(), "filter stage starting");

        let funnel = FunnelFilter::new(&cfg.filter, self.ctx.estimator);
        let mut sink = OrderedSink::new(self.ctx.warehouse, cfg.filtered_table.clone());
        let mut all = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(self.width) {
            let results = self.map_months(chunk, |key| self.filter_month(&funnel, key));
            for (&key, result) in chunk.iter().zip(results) {
                let stats = match result {
                    Ok(outcome) => self.write_filtered(&mut sink, key, outcome)?,
                    Err(e) if error::is_fatal(&e) => {
                        return Err(e.context(format!("filtering {}", key)))
                    }
                    Err(e) => {
                        warn!(year = key.year, month = key.month, "filter failed: {:#}", e);
                        FilterStats::failed(key, 0, format!("{:#}", e))
                    }
                };
                all.push(stats);
            }
        }

        info!(
            months = all.len(),
            writes = sink.writes(),
            table = %cfg.filtered_table,
            "filter stage finished"
        );
        Ok(all)
    }

    fn write_filtered(
        &self,
        sink: &mut OrderedSink<'_>,
        key: YearMonth,
        outcome: FunnelOutcome,
    ) -> Result<FilterStats> {
        let mut stats = outcome.stats;
        if outcome.records.is_empty() {
            return Ok(stats);
        }
        let written = FilteredRecord::to_batch(&outcome.records).and_then(|batch| sink.write(&[batch]));
        match written {
            Ok(mode) => {
                info!(year = key.year, month = key.month, ?mode, rows = outcome.records.len(), "wrote filtered month");
            }
            Err(e) if error::is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(year = key.year, month = key.month, "writing filtered month failed: {:#}", e);
                stats.fail(format!("{:#}", e));
            }
        }
        Ok(stats)
    }

    fn densify_month(&self, key: YearMonth) -> Result<DenseGrid> {
        let table = &self.ctx.config.filtered_table;
        let batches = self
            .ctx
            .warehouse
            .read_partition(table, key)
            .with_context(|| format!("reading `{}` for {}", table, key))?;
        let records: Vec<FilteredRecord> = decode(&batches, table)?;
        Ok(transform_month(key, &records)?)
    }

    /// Densify every month of the filtered table into the transformed table.
    #[instrument(level = "info", skip(self), fields(source = %self.ctx.config.filtered_table))]
    pub fn run_transform_stage(&self) -> Result<Vec<TransformStats>> {
        let cfg = self.ctx.config;
        let mut sink = OrderedSink::new(self.ctx.warehouse, cfg.transformed_table.clone());
        let mut all = Vec::new();

        if self.ctx.warehouse.table_exists(&cfg.filtered_table)? {
            let keys = month_keys(self.ctx.warehouse, &cfg.filtered_table, KeyOrder::Chronological)?;
            info!(months = keys.len(), "transform stage starting");
            all.reserve(keys.len());

            for chunk in keys.chunks(self.width) {
                let results = self.map_months(chunk, |key| self.densify_month(key));
                for (&key, result) in chunk.iter().zip(results) {
                    let stats = match result {
                        Ok(grid) => self.write_grid(&mut sink, key, grid)?,
                        Err(e) if error::is_fatal(&e) => {
                            return Err(e.context(format!("transforming {}", key)))
                        }
                        Err(e) => Self::skipped_month(key, e),
                    };
                    all.push(stats);
                }
            }
        } else {
            warn!(table = %cfg.filtered_table, "filtered table does not exist; nothing to transform");
        }

        if !sink.has_replaced() {
            // no month produced output, so a previous run's table would be stale
            self.ctx
                .warehouse
                .drop_table_if_exists(&cfg.transformed_table)
                .with_context(|| format!("dropping `{}`", cfg.transformed_table))?;
        }
        info!(
            months = all.len(),
            writes = sink.writes(),
            table = %cfg.transformed_table,
            "transform stage finished"
        );
        Ok(all)
    }

    fn skipped_month(key: YearMonth, e: anyhow::Error) -> TransformStats {
        let empty = e
            .chain()
            .filter_map(|c| c.downcast_ref::<PipelineError>())
            .any(|p| matches!(p, PipelineError::EmptyPartition { .. }));
        if empty {
            info!(year = key.year, month = key.month, "no data; month skipped");
            TransformStats::skipped(key, MonthStatus::SkippedEmpty)
        } else {
            warn!(year = key.year, month = key.month, "transform failed: {:#}", e);
            TransformStats::skipped(key, MonthStatus::Failed(format!("{:#}", e)))
        }
    }

    fn write_grid(&self, sink: &mut OrderedSink<'_>, key: YearMonth, grid: DenseGrid) -> Result<TransformStats> {
        let mut stats = grid.stats(key);
        let written = HourLocationCell::to_batch(&grid.cells).and_then(|batch| sink.write(&[batch]));
        match written {
            Ok(mode) => {
                info!(year = key.year, month = key.month, ?mode, rows = grid.cells.len(), "wrote dense month");
            }
            Err(e) if error::is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(year = key.year, month = key.month, "writing dense month failed: {:#}", e);
                stats.status = MonthStatus::Failed(format!("{:#}", e));
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::build_estimator;
    use crate::model::table_row::source;
    use crate::warehouse::{MemoryWarehouse, WriteMode};
    use arrow::array::{Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::sync::{Arc, Mutex};

    fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, month, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn ride(year: i32, month: u32, i: i64) -> RideRecord {
        let pickup = at(year, month, 1 + (i % 5) as u32, (i % 24) as u32, (i % 60) as u32);
        RideRecord {
            pickup: Some(pickup),
            dropoff: Some(pickup + Duration::seconds(400 + i % 7)),
            pickup_location_id: Some(100 + i % 4),
            dropoff_location_id: Some(7),
            trip_distance: Some(2.0 + (i % 3) as f64),
            total_amount: Some(12.0 + (i % 9) as f64),
            fare_amount: Some(10.0),
            tip_amount: Some(2.0),
            payment_type: Some(1),
            passenger_count: Some(1),
            year,
            month,
        }
    }

    fn source_warehouse(config: &PipelineConfig) -> MemoryWarehouse {
        let mut rows: Vec<RideRecord> = (0..300).map(|i| ride(2024, 2, i)).collect();
        rows.extend((0..300).map(|i| ride(2023, 12, i)));
        // a month whose rides all lack a distance
        rows.extend((0..20).map(|i| RideRecord {
            trip_distance: None,
            ..ride(2024, 1, i)
        }));
        MemoryWarehouse::new()
            .with_table(&config.source_table, vec![RideRecord::to_batch(&rows).unwrap()])
            .unwrap()
    }

    /// Memory warehouse that refuses chosen reads and the first write to one table.
    struct FlakyWarehouse {
        inner: MemoryWarehouse,
        unreadable: Vec<(String, YearMonth)>,
        refuse_first_write: Mutex<Option<String>>,
    }

    impl FlakyWarehouse {
        fn new(inner: MemoryWarehouse) -> Self {
            Self {
                inner,
                unreadable: Vec::new(),
                refuse_first_write: Mutex::new(None),
            }
        }
    }

    impl Warehouse for FlakyWarehouse {
        fn partitions(&self, table: &str) -> Result<Vec<YearMonth>> {
            self.inner.partitions(table)
        }

        fn read_partition(&self, table: &str, key: YearMonth) -> Result<Vec<RecordBatch>> {
            if self.unreadable.iter().any(|(t, k)| t == table && *k == key) {
                anyhow::bail!("part file of `{}` is corrupt", table);
            }
            self.inner.read_partition(table, key)
        }

        fn write(&self, table: &str, batches: &[RecordBatch], mode: WriteMode) -> Result<()> {
            let mut refuse = self.refuse_first_write.lock().unwrap();
            if refuse.as_deref() == Some(table) {
                *refuse = None;
                anyhow::bail!("no space left writing `{}`", table);
            }
            drop(refuse);
            self.inner.write(table, batches, mode)
        }

        fn drop_table_if_exists(&self, table: &str) -> Result<()> {
            self.inner.drop_table_if_exists(table)
        }

        fn table_exists(&self, table: &str) -> Result<bool> {
            self.inner.table_exists(table)
        }
    }

    fn run(config: &PipelineConfig, warehouse: &dyn Warehouse) -> Result<PipelineReport> {
        let estimator = build_estimator(&config.filter.estimator);
        let ctx = PipelineContext {
            warehouse,
            config,
            estimator: estimator.as_ref(),
        };
        Orchestrator::new(ctx)?.run()
    }

    #[test]
    fn both_stages_account_for_every_month() -> Result<()> {
        let config = PipelineConfig {
            report_table: Some("filter_report".into()),
            ..Default::default()
        };
        let wh = source_warehouse(&config);
        let report = run(&config, &wh)?;

        let filter_keys: Vec<_> = report.filter.iter().map(|s| s.key()).collect();
        assert_eq!(
            filter_keys,
            vec![YearMonth::new(2024, 2), YearMonth::new(2023, 12), YearMonth::new(2024, 1)]
        );
        for s in &report.filter {
            assert_eq!(s.total_records, s.valid_records + s.records_dropped);
        }
        let jan = &report.filter[2];
        assert_eq!(jan.dropped_missing, jan.total_records);
        assert_eq!(jan.status, MonthStatus::SkippedEmpty);

        let valid: u64 = report.filter.iter().map(|s| s.valid_records).sum();
        assert_eq!(wh.row_count(&config.filtered_table)? as u64, valid);
        assert_eq!(wh.row_count("filter_report")?, 3);

        // transform runs chronologically and never sees the empty month
        let transform_keys: Vec<_> = report.transform.iter().map(|s| (s.year, s.month)).collect();
        assert_eq!(transform_keys, vec![(2023, 12), (2024, 2)]);
        let rows: u64 = report.transform.iter().map(|s| s.rows).sum();
        assert_eq!(wh.row_count(&config.transformed_table)? as u64, rows);
        for s in &report.transform {
            assert_eq!(s.rows, s.hours * s.locations);
        }
        let rides: u64 = report.transform.iter().map(|s| s.total_rides).sum();
        assert_eq!(rides, valid);
        Ok(())
    }

    #[test]
    fn rerun_produces_identical_tables() -> Result<()> {
        let config = PipelineConfig::default();
        let wh = source_warehouse(&config);
        let first = run(&config, &wh)?;
        let filtered = FilteredRecord::from_batches(&wh.batches(&config.filtered_table)?)?;
        let dense = HourLocationCell::from_batches(&wh.batches(&config.transformed_table)?)?;

        let second = run(&config, &wh)?;
        assert_eq!(first, second);
        assert_eq!(
            FilteredRecord::from_batches(&wh.batches(&config.filtered_table)?)?,
            filtered
        );
        assert_eq!(
            HourLocationCell::from_batches(&wh.batches(&config.transformed_table)?)?,
            dense
        );
        Ok(())
    }

    #[test]
    fn parallel_months_match_sequential_output() -> Result<()> {
        let sequential = PipelineConfig::default();
        let parallel = PipelineConfig {
            parallel_months: 4,
            ..Default::default()
        };
        let wh_a = source_warehouse(&sequential);
        let wh_b = source_warehouse(&parallel);
        assert_eq!(run(&sequential, &wh_a)?, run(&parallel, &wh_b)?);
        assert_eq!(
            HourLocationCell::from_batches(&wh_a.batches(&sequential.transformed_table)?)?,
            HourLocationCell::from_batches(&wh_b.batches(&parallel.transformed_table)?)?
        );
        Ok(())
    }

    #[test]
    fn month_without_finite_distances_fails_and_the_run_continues() -> Result<()> {
        let config = PipelineConfig::default();
        let mut rows: Vec<RideRecord> = (0..300).map(|i| ride(2024, 2, i)).collect();
        rows.extend((0..50).map(|i| RideRecord {
            trip_distance: Some(f64::NAN),
            ..ride(2024, 3, i)
        }));
        let wh = MemoryWarehouse::new()
            .with_table(&config.source_table, vec![RideRecord::to_batch(&rows)?])?;
        let report = run(&config, &wh)?;

        assert_eq!(report.failed_months(), 1);
        let (feb, mar) = (&report.filter[0], &report.filter[1]);
        assert_eq!(feb.status, MonthStatus::Processed);
        assert!(matches!(&mar.status, MonthStatus::Failed(reason) if reason.contains(source::TRIP_DISTANCE)));
        assert_eq!(mar.total_records, 50);
        assert_eq!(mar.valid_records, 0);
        assert_eq!(report.total_valid_records(), feb.valid_records);

        assert_eq!(wh.partitions(&config.filtered_table)?, vec![YearMonth::new(2024, 2)]);
        assert_eq!(wh.row_count(&config.filtered_table)? as u64, feb.valid_records);
        assert_eq!(report.transform.len(), 1);
        let dense = &report.transform[0];
        assert_eq!((dense.year, dense.month, &dense.status), (2024, 2, &MonthStatus::Processed));
        assert_eq!(dense.rows, dense.hours * dense.locations);
        assert_eq!(dense.total_rides, feb.valid_records);
        assert_eq!(wh.row_count(&config.transformed_table)? as u64, dense.rows);
        Ok(())
    }

    #[test]
    fn unreadable_months_are_recorded_in_both_stages() -> Result<()> {
        let config = PipelineConfig::default();
        let mut wh = FlakyWarehouse::new(source_warehouse(&config));
        wh.unreadable = vec![
            (config.source_table.clone(), YearMonth::new(2023, 12)),
            (config.filtered_table.clone(), YearMonth::new(2024, 2)),
        ];
        let report = run(&config, &wh)?;

        let dec = &report.filter[1];
        assert!(matches!(&dec.status, MonthStatus::Failed(reason) if reason.contains("corrupt")));
        assert_eq!((dec.total_records, dec.valid_records), (0, 0));
        assert_eq!(report.filter[0].status, MonthStatus::Processed);
        assert_eq!(report.filter[2].status, MonthStatus::SkippedEmpty);

        // Feb is the only filtered month and its read fails, so nothing is densified
        assert_eq!(report.transform.len(), 1);
        assert!(matches!(report.transform[0].status, MonthStatus::Failed(_)));
        assert_eq!(report.failed_months(), 2);
        assert!(!wh.table_exists(&config.transformed_table)?);
        Ok(())
    }

    #[test]
    fn refused_write_zeroes_the_month_and_the_next_one_replaces() -> Result<()> {
        let config = PipelineConfig::default();
        let wh = FlakyWarehouse::new(source_warehouse(&config));
        *wh.refuse_first_write.lock().unwrap() = Some(config.filtered_table.clone());
        let report = run(&config, &wh)?;

        let (feb, dec) = (&report.filter[0], &report.filter[1]);
        assert!(matches!(&feb.status, MonthStatus::Failed(reason) if reason.contains("no space")));
        assert_eq!(feb.total_records, 300);
        assert_eq!(feb.valid_records, 0);
        assert_eq!(feb.records_dropped, 300);
        assert_eq!(dec.status, MonthStatus::Processed);

        assert_eq!(report.total_valid_records(), dec.valid_records);
        assert_eq!(wh.inner.row_count(&config.filtered_table)? as u64, dec.valid_records);
        let transform_keys: Vec<_> = report.transform.iter().map(|s| (s.year, s.month)).collect();
        assert_eq!(transform_keys, vec![(2023, 12)]);
        Ok(())
    }

    #[test]
    fn missing_source_column_aborts_the_run() -> Result<()> {
        let config = PipelineConfig::default();
        let schema = Arc::new(Schema::new(vec![
            Field::new(source::TRIP_DISTANCE, DataType::Float64, true),
            Field::new("YEAR", DataType::Int64, false),
            Field::new("MONTH", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(vec![1.0])),
                Arc::new(Int64Array::from(vec![2024])),
                Arc::new(Int64Array::from(vec![1])),
            ],
        )?;
        let wh = MemoryWarehouse::new().with_table(&config.source_table, vec![batch])?;
        let err = run(&config, &wh).unwrap_err();
        assert!(error::is_fatal(&err), "{err:#}");
        Ok(())
    }

    #[test]
    fn stale_transform_output_is_removed_when_nothing_survives() -> Result<()> {
        let config = PipelineConfig::default();
        let rows: Vec<RideRecord> = (0..5)
            .map(|i| RideRecord {
                passenger_count: None,
                ..ride(2024, 3, i)
            })
            .collect();
        let wh = MemoryWarehouse::new()
            .with_table(&config.source_table, vec![RideRecord::to_batch(&rows)?])?;
        let stale = HourLocationCell::to_batch(&[HourLocationCell {
            hour: at(2020, 1, 1, 0, 0),
            location_id: 1,
            rides: 1,
            year: 2020,
            month: 1,
        }])?;
        wh.write(&config.transformed_table, &[stale], WriteMode::Replace)?;

        let report = run(&config, &wh)?;
        assert_eq!(report.filter[0].status, MonthStatus::SkippedEmpty);
        assert!(report.transform.is_empty());
        assert!(!wh.table_exists(&config.filtered_table)?);
        assert!(!wh.table_exists(&config.transformed_table)?);
        Ok(())
    }

    #[test]
    fn transform_stage_alone_without_filtered_table() -> Result<()> {
        let config = PipelineConfig::default();
        let wh = MemoryWarehouse::new();
        let estimator = build_estimator(&config.filter.estimator);
        let ctx = PipelineContext {
            warehouse: &wh,
            config: &config,
            estimator: estimator.as_ref(),
        };
        let report = Orchestrator::new(ctx)?.run_stage(Stage::Transform)?;
        assert!(report.filter.is_empty());
        assert!(report.transform.is_empty());
        Ok(())
    }
}
