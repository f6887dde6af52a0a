// ============================================================
// Layer 6 — Metrics Sink
// ============================================================
// Append-only stream of (step, metric, value) triples, one CSV
// file per run, for an external dashboard to pick up:
//
//   logs/<run_id>/metrics.csv
//
//   run_id,step,metric,value
//   shtech-a,10,train/loss,0.003412
//   shtech-a,20,train/loss,0.002871
//   shtech-a,25,train/epoch_loss,0.003007
//   shtech-a,25,eval/mae,41.250000
//
// Metric names used by the trainer:
//   train/loss        every log_interval steps
//   train/epoch_loss  mean step loss at the end of each epoch
//   eval/mae, eval/mse, eval/rmse, eval/mape
//
// Rows are only ever appended, so a resumed run keeps extending
// the same file.
//
// Reference: Rust Book §12 (I/O and File Handling)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

const HEADER: &str = "run_id,step,metric,value";

/// One row of the metrics stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub step: usize,
    pub metric: String,
    pub value: f64,
}

impl MetricPoint {
    pub fn new(step: usize, metric: impl Into<String>, value: f64) -> Self {
        Self { step, metric: metric.into(), value }
    }
}

pub struct MetricsLogger {
    run_id: String,
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Open `<log_dir>/<run_id>/metrics.csv`, writing the header if new.
    pub fn new(log_dir: impl AsRef<Path>, run_id: impl Into<String>) -> Result<Self> {
        let run_id = run_id.into();
        anyhow::ensure!(
            !run_id.is_empty() && !run_id.contains(['/', '\\', ',']),
            "run id '{run_id}' must be non-empty and free of '/', '\\' and ','"
        );

        let dir = log_dir.as_ref().join(&run_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create log directory '{}'", dir.display()))?;

        let csv_path = dir.join("metrics.csv");
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)?;
            writeln!(f, "{HEADER}")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { run_id, csv_path })
    }

    pub fn log(&self, point: &MetricPoint) -> Result<()> {
        self.log_all(std::slice::from_ref(point))
    }

    /// Append several rows with a single open/flush.
    pub fn log_all(&self, points: &[MetricPoint]) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot append to '{}'", self.csv_path.display()))?;

        for p in points {
            writeln!(f, "{},{},{},{:.6}", self.run_id, p.step, p.metric, p.value)?;
            tracing::debug!("step {} {}={:.6}", p.step, p.metric, p.value);
        }
        f.flush()?;
        Ok(())
    }

    /// Shorthand for a single value
    pub fn record(&self, step: usize, metric: &str, value: f64) -> Result<()> {
        self.log(&MetricPoint::new(step, metric, value))
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    #[cfg(test)]
    pub fn read_all(&self) -> Result<Vec<MetricPoint>> {
        let text = fs::read_to_string(&self.csv_path)?;
        text.lines()
            .skip(1)
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let fields: Vec<&str> = line.split(',').collect();
                anyhow::ensure!(fields.len() == 4, "malformed metrics row '{line}'");
                Ok(MetricPoint::new(fields[1].parse()?, fields[2], fields[3].parse()?))
            })
            .collect()
    }
}
