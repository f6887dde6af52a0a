// ============================================================
// Layer 5 — Evaluator
// ============================================================
// Runs a trained model over a held-out pipeline with no weight
// updates and compares counts:
//
//   predicted count = sum of the predicted density map
//   true count      = sum of the ground-truth map
//
// Aggregates over the whole set:
//   MAE  = mean |pred - true|
//   MSE  = mean (pred - true)²
//   RMSE = √MSE   (what crowd-counting papers usually call "MSE")
//   MAPE = mean |pred - true| / (true + 1e-6)
//
// Two ways to run an image through the model:
//   whole   — the padded batch goes through in one pass; each
//             item is summed over its own valid region only
//   patches — each image is cut into overlapping tiles, the
//             tile predictions are averaged back into one map
//
// The evaluator owns its own copy of the parameters, built from
// a checkpoint or from `model.valid()`, so it never touches the
// live training model.

use anyhow::{anyhow, Context, Result};
use burn::{prelude::*, tensor::TensorData};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::data::{
    batcher::{DensityBatcher, SampleBatch},
    patches::PatchGrid,
    prefetch::DataPipeline,
};
use crate::domain::error::CrowdResult;
use crate::domain::image::{CrowdImage, CHANNELS};
use crate::infra::checkpoint::{CheckpointManager, CheckpointMeta};
use crate::ml::model::DensityNet;

const MAPE_EPSILON: f64 = 1e-6;
/// Patches pushed through the model per forward pass
const PATCHES_PER_PASS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatchSettings {
    pub size: usize,
    /// Fraction shared by neighbouring patches, in [0, 1)
    pub overlap: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCount {
    pub id: String,
    pub predicted: f64,
    pub truth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub images: usize,
    pub mae: f64,
    pub mse: f64,
    pub rmse: f64,
    pub mape: f64,
    pub per_image: Vec<ImageCount>,
}

impl EvalReport {
    pub fn from_counts(per_image: Vec<ImageCount>) -> Result<Self> {
        anyhow::ensure!(!per_image.is_empty(), "no samples were evaluated");
        let n = per_image.len() as f64;

        let mut abs = 0.0;
        let mut sq = 0.0;
        let mut rel = 0.0;
        for c in &per_image {
            let err = (c.predicted - c.truth).abs();
            abs += err;
            sq += err * err;
            rel += err / (c.truth + MAPE_EPSILON);
        }
        let mse = sq / n;

        Ok(Self {
            images: per_image.len(),
            mae: abs / n,
            mse,
            rmse: mse.sqrt(),
            mape: rel / n,
            per_image,
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Cannot write report '{}'", path.display()))
    }
}

// ─── Evaluator ────────────────────────────────────────────────────────────────
pub struct Evaluator<B: Backend> {
    model: DensityNet<B>,
    batcher: DensityBatcher<B>,
    patch: Option<PatchSettings>,
}

impl<B: Backend> Evaluator<B> {
    pub fn new(model: DensityNet<B>, device: B::Device, patch: Option<PatchSettings>) -> Self {
        Self { model, batcher: DensityBatcher::new(device), patch }
    }

    /// Load the checkpoint that `checkpoints` points at (a checkpoint
    /// directory, or a root with latest.json).
    pub fn from_checkpoint(
        checkpoints: &CheckpointManager,
        device: B::Device,
        patch: Option<PatchSettings>,
    ) -> CrowdResult<(Self, CheckpointMeta)> {
        let ckpt = checkpoints.resolve()?;
        let (model, meta) = checkpoints.load_model::<B>(&ckpt, None, &device)?;
        Ok((Self::new(model, device, patch), meta))
    }

    /// One full, unshuffled pass over `pipeline`.
    pub fn evaluate(&self, pipeline: &DataPipeline) -> Result<EvalReport> {
        let mut counts = Vec::with_capacity(pipeline.len());
        for batch in pipeline.epoch(0)? {
            let ids = batch.ids.clone();
            let truths = batch.counts.clone();
            let predicted = match self.patch {
                Some(p) => self.predict_patched(&batch, p)?,
                None => self.predict_whole(batch)?,
            };
            counts.extend(
                ids.into_iter()
                    .zip(truths)
                    .zip(predicted)
                    .map(|((id, truth), predicted)| ImageCount { id, predicted, truth }),
            );
        }
        EvalReport::from_counts(counts)
    }

    fn predict_whole(&self, batch: SampleBatch) -> Result<Vec<f64>> {
        let (h, w) = (batch.height, batch.width);
        let sizes = batch.sizes.clone();
        let tensors = self.batcher.batch(batch);

        let values = to_vec(self.model.forward(tensors.images))?;
        let plane = h * w;

        Ok(sizes
            .iter()
            .enumerate()
            .map(|(i, &(vh, vw))| {
                let item = &values[i * plane..(i + 1) * plane];
                (0..vh)
                    .map(|y| item[y * w..y * w + vw].iter().map(|&v| v as f64).sum::<f64>())
                    .sum()
            })
            .collect())
    }

    fn predict_patched(&self, batch: &SampleBatch, settings: PatchSettings) -> Result<Vec<f64>> {
        let (h, w) = (batch.height, batch.width);
        let mut counts = Vec::with_capacity(batch.len());

        for (i, &(vh, vw)) in batch.sizes.iter().enumerate() {
            let image = CrowdImage::from_fn(vh, vw, |(c, y, x)| {
                batch.images[((i * CHANNELS + c) * h + y) * w + x]
            });
            let grid = PatchGrid::new(vh, vw, settings.size, settings.overlap)?;
            let ps = grid.patch_size();
            let patches = grid.extract(&image);
            tracing::debug!(
                "{}: {} patches of {ps}px, stride {}",
                batch.ids[i],
                patches.len(),
                grid.stride()
            );

            let mut predictions = Vec::with_capacity(patches.len());
            for group in patches.chunks(PATCHES_PER_PASS) {
                let flat: Vec<f32> = group.iter().flat_map(|p| p.as_array().iter().copied()).collect();
                let input = Tensor::<B, 4>::from_data(
                    TensorData::new(flat, [group.len(), CHANNELS, ps, ps]),
                    &self.batcher.device,
                );
                let values = to_vec(self.model.forward(input))?;
                for chunk in values.chunks(ps * ps) {
                    predictions.push(Array2::from_shape_vec((ps, ps), chunk.to_vec())?);
                }
            }

            let full = grid.assemble(&predictions)?;
            counts.push(full.iter().map(|&v| v as f64).sum());
        }
        Ok(counts)
    }
}

fn to_vec<B: Backend>(t: Tensor<B, 4>) -> Result<Vec<f32>> {
    t.into_data().to_vec::<f32>().map_err(|e| anyhow!("cannot read prediction: {e:?}"))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::prefetch::{tests::numbered_samples, PipelineConfig};
    use crate::ml::{model::DensityNetConfig, ComputeBackend as B};
    use burn::data::dataset::InMemDataset;
    use std::sync::Arc;

    fn eval_pipeline(n: usize, batch_size: usize) -> DataPipeline {
        let mut cfg = PipelineConfig::evaluation(1, 2);
        cfg.batch_size = batch_size;
        DataPipeline::new(Arc::new(InMemDataset::new(numbered_samples(n))), cfg).unwrap()
    }

    fn model() -> DensityNet<B> {
        DensityNetConfig::new().with_width(4).with_depth(1).init(&Default::default())
    }

    #[test]
    fn test_metrics_from_counts() {
        let report = EvalReport::from_counts(vec![
            ImageCount { id: "a".into(), predicted: 10.0, truth: 12.0 },
            ImageCount { id: "b".into(), predicted: 5.0, truth: 5.0 },
        ])
        .unwrap();
        assert_eq!(report.images, 2);
        assert!((report.mae - 1.0).abs() < 1e-12);
        assert!((report.mse - 2.0).abs() < 1e-12);
        assert!((report.rmse - 2f64.sqrt()).abs() < 1e-12);
        assert!((report.mape - (2.0 / (12.0 + MAPE_EPSILON)) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_set_is_an_error() {
        assert!(EvalReport::from_counts(Vec::new()).is_err());
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let pipeline = eval_pipeline(6, 1);
        let evaluator = Evaluator::new(model(), Default::default(), None);
        let first = evaluator.evaluate(&pipeline).unwrap();
        let second = evaluator.evaluate(&pipeline).unwrap();

        assert_eq!(first.images, 6);
        assert_eq!(first, second);
        assert!(first.per_image.iter().all(|c| (c.truth - 1.0).abs() < 1e-6));
        assert_eq!(first.per_image[0].id, "s000");
    }

    #[test]
    fn test_patch_mode_covers_every_image() {
        let pipeline = eval_pipeline(3, 2);
        let settings = PatchSettings { size: 4, overlap: 0.5 };
        let evaluator = Evaluator::new(model(), Default::default(), Some(settings));
        let report = evaluator.evaluate(&pipeline).unwrap();
        assert_eq!(report.images, 3);
        assert!(report.mae.is_finite());
        assert_eq!(report, evaluator.evaluate(&pipeline).unwrap());
    }

    #[test]
    fn test_report_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let report = EvalReport::from_counts(vec![ImageCount {
            id: "x".into(),
            predicted: 2.5,
            truth: 2.0,
        }])
        .unwrap();
        let path = dir.path().join("reports").join("eval.json");
        report.write_json(&path).unwrap();
        let back: EvalReport = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back, report);
    }
}
