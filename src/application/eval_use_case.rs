// ============================================================
// Layer 2 — EvalUseCase
// ============================================================
// Scores a saved checkpoint on a processed dataset:
//
//   Step 1: Recover training data settings  (Layer 6 - infra)
//   Step 2: Preprocess raw data if needed   (Layer 2 - preprocess)
//   Step 3: Load the checkpoint             (Layer 6 - infra)
//   Step 4: Build the evaluation pipeline   (Layer 4 - data)
//   Step 5: Evaluate and report             (Layer 5 - ml)
//
// The density kernel and downsample factor come from the
// train_config.json saved with the checkpoints, so evaluation
// data is built the way the model's training data was. An
// explicit --downsample still wins, with a warning if it
// disagrees. Nothing here writes to the checkpoint directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::application::preprocess_use_case::{PreprocessConfig, PreprocessUseCase};
use crate::application::train_use_case::TrainConfig;
use crate::data::{
    dataset::ProcessedDataset,
    density::DensityConfig,
    prefetch::{DataPipeline, PipelineConfig},
};
use crate::infra::{checkpoint::CheckpointManager, store::ProcessedStore};
use crate::ml::{
    evaluator::{EvalReport, Evaluator, PatchSettings},
    ComputeBackend, ComputeDevice,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Checkpoint root (follows latest.json) or one checkpoint directory
    pub checkpoint: PathBuf,
    pub data_dir: PathBuf,
    pub raw_dir: Option<PathBuf>,
    /// None to use the factor the model was trained with
    pub downsample: Option<usize>,
    pub batch_size: usize,
    pub workers: usize,
    pub patch: Option<PatchSettings>,
    /// Where to write the JSON report, if anywhere
    pub report: Option<PathBuf>,
}

pub struct EvalUseCase {
    config: EvalConfig,
}

impl EvalUseCase {
    pub fn new(config: EvalConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<EvalReport> {
        let cfg = &self.config;

        // ── Step 1: Training settings ─────────────────────────────────────────
        let trained = saved_train_config(&cfg.checkpoint);
        let density = match &trained {
            Some(t) => t.density,
            None => {
                tracing::warn!("No train_config.json near the checkpoint; using default data settings");
                DensityConfig::default()
            }
        };
        let downsample = resolve_downsample(cfg.downsample, trained.as_ref());

        // ── Step 2: Processed data ────────────────────────────────────────────
        if let (Some(raw), false) = (&cfg.raw_dir, ProcessedStore::new(&cfg.data_dir).exists()) {
            PreprocessUseCase::new(PreprocessConfig {
                raw_dir: raw.clone(),
                out_dir: cfg.data_dir.clone(),
                density,
            })
            .execute()?;
        }

        // ── Step 3: Checkpoint ────────────────────────────────────────────────
        let checkpoints = CheckpointManager::open(&cfg.checkpoint);
        let (evaluator, meta) =
            Evaluator::<ComputeBackend>::from_checkpoint(&checkpoints, ComputeDevice::default(), cfg.patch)?;
        tracing::info!("Evaluating checkpoint at step {} (epoch {})", meta.step, meta.epoch);

        // ── Step 4: Pipeline ──────────────────────────────────────────────────
        let dataset = ProcessedDataset::open(&cfg.data_dir)
            .with_context(|| format!("Cannot open evaluation data '{}'", cfg.data_dir.display()))?;
        let mut pipeline_cfg = PipelineConfig::evaluation(downsample, cfg.workers);
        pipeline_cfg.batch_size = cfg.batch_size.max(1);
        let pipeline = DataPipeline::new(Arc::new(dataset), pipeline_cfg)?;

        // ── Step 5: Evaluate ──────────────────────────────────────────────────
        let report = evaluator.evaluate(&pipeline)?;
        tracing::info!(
            "{} images: MAE={:.3} MSE={:.3} RMSE={:.3} MAPE={:.3}",
            report.images,
            report.mae,
            report.mse,
            report.rmse,
            report.mape
        );

        if let Some(path) = &cfg.report {
            report.write_json(path)?;
            tracing::info!("Report written to '{}'", path.display());
        }
        Ok(report)
    }
}

/// `path` is either the checkpoint root or one step directory inside it.
fn saved_train_config(path: &Path) -> Option<TrainConfig> {
    [Some(path), path.parent()]
        .into_iter()
        .flatten()
        .find_map(|dir| CheckpointManager::open(dir).load_config().ok())
}

fn resolve_downsample(requested: Option<usize>, trained: Option<&TrainConfig>) -> usize {
    let trained = trained.map(|t| t.pipeline.downsample);
    match (requested, trained) {
        (Some(r), Some(t)) if r != t => {
            tracing::warn!("--downsample {r} differs from the factor {t} the model was trained with");
            r
        }
        (Some(r), _) => r,
        (None, Some(t)) => t,
        (None, None) => 1,
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::loader::tests::write_raw_sample;
    use crate::domain::annotation::Point;
    use crate::domain::error::CrowdError;
    use crate::infra::checkpoint::{CheckpointMeta, OptimizerMeta, SCHEMA_VERSION};
    use crate::ml::{model::DensityNet, model::DensityNetConfig, TrainBackend};
    use burn::optim::AdamConfig;

    fn save_checkpoint(dir: &std::path::Path) {
        let cfg = DensityNetConfig::new().with_width(4).with_depth(1);
        let model: DensityNet<TrainBackend> = cfg.init(&Default::default());
        let optim = AdamConfig::new().init::<TrainBackend, DensityNet<TrainBackend>>();
        let meta = CheckpointMeta {
            schema_version: SCHEMA_VERSION,
            epoch: 1,
            epoch_step: 7,
            step: 7,
            model: cfg,
            params: model.param_shapes(),
            optimizer: OptimizerMeta { kind: "adam".into(), learning_rate: 1e-4, epsilon: 1e-8 },
            train_loss: None,
        };
        CheckpointManager::new(dir).unwrap().save(&model, &optim, &meta).unwrap();
    }

    fn config(root: &std::path::Path) -> EvalConfig {
        EvalConfig {
            checkpoint: root.join("ckpt"),
            data_dir: root.join("processed"),
            raw_dir: Some(root.join("raw")),
            downsample: None,
            batch_size: 2,
            workers: 2,
            patch: None,
            report: Some(root.join("report.json")),
        }
    }

    #[test]
    fn test_eval_writes_report_and_leaves_checkpoint_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        save_checkpoint(&cfg.checkpoint);
        write_raw_sample(&cfg.raw_dir.clone().unwrap(), "IMG_1", 12, 10, Some(("json", "[[2, 2], [8, 6]]")));
        write_raw_sample(&cfg.raw_dir.clone().unwrap(), "IMG_2", 12, 10, Some(("json", "[[5, 5]]")));

        let latest = std::fs::read_to_string(cfg.checkpoint.join("latest.json")).unwrap();
        let report = EvalUseCase::new(cfg.clone()).execute().unwrap();

        assert_eq!(report.images, 2);
        assert!(cfg.report.as_ref().unwrap().is_file());
        assert_eq!(std::fs::read_to_string(cfg.checkpoint.join("latest.json")).unwrap(), latest);
    }

    #[test]
    fn test_eval_preprocesses_with_the_training_settings() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        save_checkpoint(&cfg.checkpoint);
        let trained = TrainConfig {
            density: DensityConfig { sigma_max: 2.0, ..DensityConfig::default() },
            pipeline: PipelineConfig { downsample: 2, ..PipelineConfig::default() },
            ..TrainConfig::default()
        };
        CheckpointManager::new(&cfg.checkpoint).unwrap().save_config(&trained).unwrap();
        write_raw_sample(&cfg.raw_dir.clone().unwrap(), "IMG_1", 12, 10, Some(("json", "[[2, 2], [8, 6]]")));

        // a single step directory finds the config one level up
        let step_dir = CheckpointManager::open(&cfg.checkpoint).resolve().unwrap();
        assert_eq!(saved_train_config(&step_dir).unwrap().density, trained.density);

        let report = EvalUseCase::new(cfg.clone()).execute().unwrap();
        assert_eq!(report.images, 1);
        assert!((report.per_image[0].truth - 2.0).abs() < 1e-3);

        // the stored map is the one the training kernel produces
        let expected = crate::data::density::DensityMapGenerator::new(trained.density)
            .unwrap()
            .generate(&[Point::new(2.0, 2.0), Point::new(8.0, 6.0)], 12, 10)
            .unwrap();
        let store = ProcessedStore::new(&cfg.data_dir);
        let stored = store.read_density(&store.read_record("IMG_1").unwrap()).unwrap();
        assert_eq!(stored, expected);
    }

    #[test]
    fn test_downsample_falls_back_to_training_factor() {
        let trained = TrainConfig {
            pipeline: PipelineConfig { downsample: 4, ..PipelineConfig::default() },
            ..TrainConfig::default()
        };
        assert_eq!(resolve_downsample(None, Some(&trained)), 4);
        assert_eq!(resolve_downsample(Some(2), Some(&trained)), 2);
        assert_eq!(resolve_downsample(None, None), 1);
    }

    #[test]
    fn test_missing_checkpoint_is_checkpoint_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        write_raw_sample(&cfg.raw_dir.clone().unwrap(), "IMG_1", 8, 8, Some(("json", "[[2, 2]]")));

        let err = EvalUseCase::new(cfg).execute().unwrap_err();
        assert!(matches!(err.downcast_ref::<CrowdError>(), Some(CrowdError::CheckpointLoad { .. })));
    }
}
