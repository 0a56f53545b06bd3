// src/pipeline/report.rs
use crate::model::{FilterStats, MonthStatus, TableRow, TransformStats};
use crate::warehouse::{Warehouse, WriteMode};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tracing::info;

/// Audit trail of one pipeline run: one row per attempted month and stage.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub filter: Vec<FilterStats>,
    pub transform: Vec<TransformStats>,
}

impl PipelineReport {
    pub fn failed_months(&self) -> usize {
        let failed = |s: &MonthStatus| matches!(s, MonthStatus::Failed(_));
        self.filter.iter().filter(|s| failed(&s.status)).count()
            + self.transform.iter().filter(|s| failed(&s.status)).count()
    }

    pub fn total_valid_records(&self) -> u64 {
        self.filter.iter().map(|s| s.valid_records).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing pipeline report")
    }

    /// Write the report as pretty JSON, via a temporary file.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating report dir {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, self.to_json()?)
            .with_context(|| format!("writing report to {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        info!(path = %path.display(), "wrote report");
        Ok(())
    }

    /// Replace `table` with the filter audit rows.
    pub fn persist_filter_stats(&self, warehouse: &dyn Warehouse, table: &str) -> Result<()> {
        let batch = FilterStats::to_batch(&self.filter)?;
        warehouse
            .write(table, &[batch], WriteMode::Replace)
            .with_context(|| format!("writing filter report to `{}`", table))?;
        info!(table, rows = self.filter.len(), "persisted filter report");
        Ok(())
    }
}
