use anyhow::{Context, Result};
use clap::Parser;
use ride_grid::{
    config::PipelineConfig,
    filter::build_estimator,
    pipeline::{Orchestrator, PipelineContext, Stage},
    warehouse::ParquetWarehouse,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Filter raw ride records month by month and densify them into an hourly
/// per-location grid.
#[derive(Parser, Debug)]
#[command(name = "ride-grid", version)]
struct Args {
    /// YAML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Warehouse root directory (overrides the config file).
    #[arg(long)]
    warehouse: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Stage::All)]
    stage: Stage,

    /// Months computed concurrently (overrides the config file).
    #[arg(long)]
    parallel_months: Option<usize>,

    /// Write the run report as JSON to this path.
    #[arg(long)]
    report_json: Option<PathBuf>,
}

fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ride_grid=info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {:?}", info);
    }));

    if let Err(e) = run(Args::parse()) {
        error!("run failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let start = Instant::now();

    // ─── 2) configuration ────────────────────────────────────────────
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(root) = args.warehouse {
        config.warehouse_root = root;
    }
    if let Some(n) = args.parallel_months {
        config.parallel_months = n;
    }
    config.validate()?;
    info!(
        warehouse = %config.warehouse_root.display(),
        source = %config.source_table,
        stage = ?args.stage,
        parallel_months = config.parallel_months,
        "startup"
    );

    // ─── 3) run the requested stages ─────────────────────────────────
    let warehouse = ParquetWarehouse::new(&config.warehouse_root)
        .with_context(|| format!("opening warehouse {}", config.warehouse_root.display()))?;
    let estimator = build_estimator(&config.filter.estimator);
    let ctx = PipelineContext {
        warehouse: &warehouse,
        config: &config,
        estimator: estimator.as_ref(),
    };
    let report = Orchestrator::new(ctx)?.run_stage(args.stage)?;

    // ─── 4) report ───────────────────────────────────────────────────
    if let Some(path) = &args.report_json {
        report.write_json(path)?;
    }
    info!(
        months = report.filter.len().max(report.transform.len()),
        failed = report.failed_months(),
        elapsed = ?start.elapsed(),
        "done"
    );
    Ok(())
}
