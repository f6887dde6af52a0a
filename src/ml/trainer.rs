// ============================================================
// Layer 5 — Training Loop
// ============================================================
// One logical loop; the data pipeline prefetches on its own
// threads, but only this loop ever touches the parameters.
//
// Per step:
//   batch → forward → MSE loss → (finite?) → backward → Adam step
//
// State machine:
//
//   Idle ──► Running(epoch, step) ──► Checkpointed ──► Running …
//                 │                                       │
//                 ├── NaN / ∞ loss ──► Failed             │
//                 ├── stop signal  ──► Stopped            │
//                 └── epochs done  ──► Done ◄─────────────┘
//
// Ordering: metrics and checkpoints written at step N already
// include the update of step N. The stop signal is checked
// before each step, never in the middle of one, and the last
// completed step is checkpointed before returning.
//
// A non-finite loss is reported with its epoch and step and the
// run ends there; the update that would have used it is never
// applied, so the previous checkpoint stays the resumable state.
//
// Key Burn insight:
//   - Training runs on TrainBackend (Autodiff<ComputeBackend>)
//   - model.valid() gives a detached copy on ComputeBackend,
//     which is what the periodic evaluation uses
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam

use anyhow::{Context, Result};
use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
};
use std::path::PathBuf;

use crate::application::train_use_case::TrainConfig;
use crate::data::{batcher::DensityBatcher, prefetch::DataPipeline};
use crate::domain::error::CrowdError;
use crate::infra::{
    checkpoint::{CheckpointManager, CheckpointMeta, OptimizerMeta, SCHEMA_VERSION},
    metrics::{MetricPoint, MetricsLogger},
    signal::StopSignal,
};
use crate::ml::{
    evaluator::{EvalReport, Evaluator},
    model::DensityNet,
    ComputeDevice, TrainBackend,
};

/// Per-image counts echoed to the log after each evaluation
const LOGGED_EXAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Idle,
    Running { epoch: usize, step: usize },
    Checkpointed { epoch: usize, step: usize },
    Done { step: usize },
    Stopped { step: usize },
    Failed { step: usize },
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub state: TrainerState,
    /// Global steps completed
    pub step: usize,
    pub last_checkpoint: Option<PathBuf>,
    pub best_mae: Option<f64>,
}

/// Where the loop is; also what goes into a checkpoint's meta.json.
#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    epoch: usize,
    epoch_step: usize,
    step: usize,
    last_loss: Option<f64>,
}

pub struct Trainer<'a> {
    cfg: &'a TrainConfig,
    checkpoints: &'a CheckpointManager,
    metrics: &'a MetricsLogger,
    stop: StopSignal,
    device: ComputeDevice,
    state: TrainerState,
    last_saved: Option<(usize, PathBuf)>,
}

impl<'a> Trainer<'a> {
    pub fn new(
        cfg: &'a TrainConfig,
        checkpoints: &'a CheckpointManager,
        metrics: &'a MetricsLogger,
        stop: StopSignal,
        device: ComputeDevice,
    ) -> Self {
        Self { cfg, checkpoints, metrics, stop, device, state: TrainerState::Idle, last_saved: None }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn run(&mut self, train: &DataPipeline, eval: Option<&DataPipeline>) -> Result<TrainingOutcome> {
        let cfg = self.cfg;
        let device = self.device.clone();
        let batcher = DensityBatcher::<TrainBackend>::new(device.clone());

        let per_epoch = train.batches_per_epoch();
        anyhow::ensure!(per_epoch > 0, "training set yields no batches");
        let log_every = cfg.log_interval.max(1);
        let ckpt_every = cfg.checkpoint_interval.max(1);

        // ── Model + Adam ──────────────────────────────────────────────────────
        // m = β1*m + (1-β1)*g        (mean)
        // v = β2*v + (1-β2)*g²       (variance)
        // θ = θ - lr * m / (√v + ε)  (update)
        let mut model: DensityNet<TrainBackend> = cfg.model.init(&device);
        let mut optim = AdamConfig::new()
            .with_epsilon(cfg.epsilon)
            .init::<TrainBackend, DensityNet<TrainBackend>>();

        let mut progress = Progress::default();
        let mut start_epoch = 1;
        let mut skip_batches = 0;
        let mut best_mae = None;

        // ── Resume ────────────────────────────────────────────────────────────
        if cfg.resume {
            if self.checkpoints.latest()?.is_some() {
                let ckpt = self.checkpoints.resolve()?;
                let (loaded, meta) =
                    self.checkpoints.load_model::<TrainBackend>(&ckpt, Some(&cfg.model), &device)?;
                model = loaded;
                optim = self.checkpoints.load_optimizer::<TrainBackend, _>(&ckpt, optim, &device)?;

                progress = Progress {
                    epoch: meta.epoch,
                    epoch_step: meta.epoch_step,
                    step: meta.step,
                    last_loss: meta.train_loss,
                };
                if meta.epoch_step >= per_epoch {
                    start_epoch = meta.epoch + 1;
                } else {
                    start_epoch = meta.epoch;
                    skip_batches = meta.epoch_step;
                }
                best_mae = self.checkpoints.best()?.and_then(|b| b.mae);
                self.last_saved = Some((meta.step, ckpt));
                tracing::info!(
                    "Resuming from step {} (epoch {}, {} of {} batches done)",
                    meta.step,
                    meta.epoch,
                    meta.epoch_step.min(per_epoch),
                    per_epoch
                );
            } else {
                tracing::warn!(
                    "--resume given but '{}' holds no checkpoint; starting fresh",
                    self.checkpoints.dir().display()
                );
            }
        }

        tracing::info!(
            "Training for epochs {}..={} ({} batches of {} per epoch)",
            start_epoch,
            cfg.epochs,
            per_epoch,
            train.config().batch_size
        );

        // ── Epoch loop ────────────────────────────────────────────────────────
        let mut stopped = false;
        for epoch in start_epoch..=cfg.epochs {
            let skip = if epoch == start_epoch { skip_batches } else { 0 };
            progress.epoch = epoch;
            progress.epoch_step = skip;

            let mut loss_sum = 0.0f64;
            let mut loss_count = 0usize;

            let mut stream = train.epoch_from(epoch, skip)?;
            while let Some(cpu_batch) = stream.next() {
                if self.stop.is_stopped() {
                    stopped = true;
                    break;
                }
                let step = progress.step + 1;
                self.state = TrainerState::Running { epoch, step };

                let batch = batcher.batch(cpu_batch);
                let (loss, _) = model.forward_loss(&batch);
                let value = loss.clone().into_scalar().elem::<f64>();

                if !value.is_finite() {
                    self.state = TrainerState::Failed { step };
                    tracing::error!(
                        "Non-finite loss {value} at epoch {epoch}, step {step}; last checkpoint: {}",
                        self.last_saved
                            .as_ref()
                            .map(|(_, p)| p.display().to_string())
                            .unwrap_or_else(|| "none".to_string())
                    );
                    return Err(CrowdError::NonFiniteLoss { epoch, step, value }.into());
                }

                // Backward pass + Adam update
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(cfg.lr, model, grads);

                progress.step = step;
                progress.epoch_step = stream.consumed();
                progress.last_loss = Some(value);
                loss_sum += value;
                loss_count += 1;

                if step % log_every == 0 {
                    self.metrics.record(step, "train/loss", value)?;
                    tracing::info!("epoch {epoch} step {step} loss={value:.6}");
                }
                if step % ckpt_every == 0 {
                    self.checkpoint(&model, &optim, progress)?;
                }
            }

            if stopped {
                break;
            }
            // unloadable batches after the last step still finish the epoch
            progress.epoch_step = stream.consumed();
            drop(stream);

            if loss_count > 0 {
                let mean = loss_sum / loss_count as f64;
                self.metrics.record(progress.step, "train/epoch_loss", mean)?;
                tracing::info!("Epoch {:>3}/{} | train_loss={:.6}", epoch, cfg.epochs, mean);
            }

            // ── Periodic evaluation on a detached copy ────────────────────────
            let eval_due = cfg.eval_interval > 0 && epoch % cfg.eval_interval == 0;
            if let (Some(eval), true) = (eval, eval_due) {
                let evaluator = Evaluator::new(model.valid(), device.clone(), cfg.eval_patch);
                let report = evaluator.evaluate(eval).context("Periodic evaluation failed")?;
                self.log_eval(progress.step, &report)?;

                if best_mae.map_or(true, |best| report.mae < best) {
                    if self.saved_step() != Some(progress.step) {
                        self.checkpoint(&model, &optim, progress)?;
                    }
                    self.checkpoints.mark_best(progress.step, report.mae)?;
                    best_mae = Some(report.mae);
                    tracing::info!("New best MAE {:.3} at step {}", report.mae, progress.step);
                }
            }
        }

        // ── Final checkpoint ──────────────────────────────────────────────────
        if progress.step > 0 && self.saved_step() != Some(progress.step) {
            self.checkpoint(&model, &optim, progress)?;
        }

        self.state = if stopped {
            tracing::warn!("Training stopped after step {}", progress.step);
            TrainerState::Stopped { step: progress.step }
        } else {
            tracing::info!("Training complete after {} steps", progress.step);
            TrainerState::Done { step: progress.step }
        };

        Ok(TrainingOutcome {
            state: self.state,
            step: progress.step,
            last_checkpoint: self.last_saved.as_ref().map(|(_, p)| p.clone()),
            best_mae,
        })
    }

    fn saved_step(&self) -> Option<usize> {
        self.last_saved.as_ref().map(|(s, _)| *s)
    }

    fn checkpoint<O>(&mut self, model: &DensityNet<TrainBackend>, optim: &O, progress: Progress) -> Result<()>
    where
        O: Optimizer<DensityNet<TrainBackend>, TrainBackend>,
    {
        let meta = CheckpointMeta {
            schema_version: SCHEMA_VERSION,
            epoch: progress.epoch,
            epoch_step: progress.epoch_step,
            step: progress.step,
            model: self.cfg.model.clone(),
            params: model.param_shapes(),
            optimizer: OptimizerMeta {
                kind: "adam".to_string(),
                learning_rate: self.cfg.lr,
                epsilon: self.cfg.epsilon,
            },
            train_loss: progress.last_loss,
        };

        let path = self.checkpoints.save(model, optim, &meta)?;
        tracing::info!("Checkpoint saved: step {} → '{}'", progress.step, path.display());
        self.state = TrainerState::Checkpointed { epoch: progress.epoch, step: progress.step };
        self.last_saved = Some((progress.step, path));
        Ok(())
    }

    fn log_eval(&self, step: usize, report: &EvalReport) -> Result<()> {
        self.metrics.log_all(&[
            MetricPoint::new(step, "eval/mae", report.mae),
            MetricPoint::new(step, "eval/mse", report.mse),
            MetricPoint::new(step, "eval/rmse", report.rmse),
            MetricPoint::new(step, "eval/mape", report.mape),
        ])?;
        tracing::info!(
            "eval @ step {step}: MAE={:.3} MSE={:.3} RMSE={:.3} MAPE={:.3} over {} images",
            report.mae,
            report.mse,
            report.rmse,
            report.mape,
            report.images
        );
        for c in report.per_image.iter().take(LOGGED_EXAMPLES) {
            tracing::info!("  {}: predicted {:.2}, true {:.2}", c.id, c.predicted, c.truth);
        }
        Ok(())
    }
}
