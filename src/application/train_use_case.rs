// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates a training run in order:
//
//   Step 1: Preprocess raw data if needed   (Layer 2 - preprocess)
//   Step 2: Open processed datasets         (Layer 4 - data)
//   Step 3: Build prefetching pipelines     (Layer 4 - data)
//   Step 4: Prepare checkpoints + metrics   (Layer 6 - infra)
//   Step 5: Run the training loop           (Layer 5 - ml)
//
// Reference: Burn Book §5 (Training)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::application::preprocess_use_case::{PreprocessConfig, PreprocessUseCase};
use crate::data::{
    dataset::ProcessedDataset,
    density::DensityConfig,
    prefetch::{DataPipeline, PipelineConfig},
};
use crate::infra::{
    checkpoint::CheckpointManager, metrics::MetricsLogger, signal::StopSignal, store::ProcessedStore,
};
use crate::ml::{
    evaluator::PatchSettings,
    model::DensityNetConfig,
    trainer::{Trainer, TrainingOutcome},
    ComputeDevice,
};

// ─── Training Configuration ──────────────────────────────────────────────────
// Everything a run depends on. Saved as train_config.json next to
// the checkpoints so a run can be inspected or repeated later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Processed training store
    pub train_dir: PathBuf,
    /// Processed held-out store; no periodic evaluation without it
    pub eval_dir: Option<PathBuf>,
    /// Raw datasets used to build the stores above when missing
    pub raw_train_dir: Option<PathBuf>,
    pub raw_eval_dir: Option<PathBuf>,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
    pub run_id: String,
    pub epochs: usize,
    pub lr: f64,
    pub epsilon: f32,
    /// Steps between checkpoints
    pub checkpoint_interval: usize,
    /// Steps between train/loss rows
    pub log_interval: usize,
    /// Epochs between evaluations, 0 to disable
    pub eval_interval: usize,
    pub resume: bool,
    pub pipeline: PipelineConfig,
    pub density: DensityConfig,
    pub model: DensityNetConfig,
    pub eval_patch: Option<PatchSettings>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("data/processed/train"),
            eval_dir: None,
            raw_train_dir: None,
            raw_eval_dir: None,
            checkpoint_dir: PathBuf::from("checkpoints"),
            log_dir: PathBuf::from("logs"),
            run_id: "crowd-density".to_string(),
            epochs: 100,
            lr: 1e-4,
            epsilon: 1e-8,
            checkpoint_interval: 500,
            log_interval: 10,
            eval_interval: 1,
            resume: false,
            pipeline: PipelineConfig::default(),
            density: DensityConfig::default(),
            model: DensityNetConfig::new(),
            eval_patch: None,
        }
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Run to completion, or until `stop` is tripped.
    pub fn execute(&self, stop: StopSignal) -> Result<TrainingOutcome> {
        let cfg = &self.config;

        // ── Step 1: Build missing processed stores ────────────────────────────
        ensure_processed(cfg.raw_train_dir.as_deref(), &cfg.train_dir, cfg.density)?;
        if let Some(eval_dir) = &cfg.eval_dir {
            ensure_processed(cfg.raw_eval_dir.as_deref(), eval_dir, cfg.density)?;
        }

        // ── Step 2: Open datasets ─────────────────────────────────────────────
        let train_set = ProcessedDataset::open(&cfg.train_dir)
            .with_context(|| format!("Cannot open training data '{}'", cfg.train_dir.display()))?;
        anyhow::ensure!(
            !train_set.records().is_empty(),
            "training data '{}' holds no samples; run 'preprocess' first",
            cfg.train_dir.display()
        );
        let eval_set = match &cfg.eval_dir {
            Some(dir) => Some(
                ProcessedDataset::open(dir)
                    .with_context(|| format!("Cannot open evaluation data '{}'", dir.display()))?,
            ),
            None => None,
        };

        // ── Step 3: Pipelines ─────────────────────────────────────────────────
        // Evaluation sees full images at the training downsample factor
        let train = DataPipeline::new(Arc::new(train_set), cfg.pipeline.clone())?;
        let eval = match eval_set {
            Some(ds) if !ds.records().is_empty() => Some(DataPipeline::new(
                Arc::new(ds),
                PipelineConfig::evaluation(cfg.pipeline.downsample, cfg.pipeline.workers),
            )?),
            Some(_) => {
                tracing::warn!("Evaluation data is empty; periodic evaluation disabled");
                None
            }
            None => None,
        };
        tracing::info!(
            "Train: {} samples, eval: {} samples",
            train.len(),
            eval.as_ref().map_or(0, |e| e.len())
        );

        // ── Step 4: Checkpoints and metrics ───────────────────────────────────
        let checkpoints = CheckpointManager::new(&cfg.checkpoint_dir)?;
        if cfg.resume {
            warn_on_config_drift(&checkpoints, cfg);
        }
        checkpoints.save_config(cfg)?;
        let metrics = MetricsLogger::new(&cfg.log_dir, &cfg.run_id)?;
        tracing::info!("Metrics stream: '{}'", metrics.csv_path().display());

        // ── Step 5: Train ─────────────────────────────────────────────────────
        let device = ComputeDevice::default();
        let mut trainer = Trainer::new(cfg, &checkpoints, &metrics, stop, device);
        trainer.run(&train, eval.as_ref())
    }
}

/// Resuming with different data settings is allowed but rarely intended.
fn warn_on_config_drift(checkpoints: &CheckpointManager, cfg: &TrainConfig) {
    let Ok(saved) = checkpoints.load_config() else {
        return;
    };
    if saved.pipeline != cfg.pipeline {
        tracing::warn!("Resuming with a different pipeline config: was {:?}", saved.pipeline);
    }
    if saved.density != cfg.density {
        tracing::warn!("Resuming with a different density config: was {:?}", saved.density);
    }
    if saved.train_dir != cfg.train_dir {
        tracing::warn!("Resuming on different data: was '{}'", saved.train_dir.display());
    }
}

fn ensure_processed(raw: Option<&Path>, processed: &Path, density: DensityConfig) -> Result<()> {
    match raw {
        Some(raw) if !ProcessedStore::new(processed).exists() => {
            tracing::info!("'{}' does not exist yet; preprocessing '{}'", processed.display(), raw.display());
            PreprocessUseCase::new(PreprocessConfig {
                raw_dir: raw.to_path_buf(),
                out_dir: processed.to_path_buf(),
                density,
            })
            .execute()?;
            Ok(())
        }
        _ => Ok(()),
    }
}
