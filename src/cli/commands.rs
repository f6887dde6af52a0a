// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the four subcommands and all their flags:
//   preprocess, train, eval, clean
//
// Each Args struct converts with `From` into the matching
// application config, so the layers below never see clap.
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::{
    eval_use_case::EvalConfig, preprocess_use_case::PreprocessConfig, train_use_case::TrainConfig,
};
use crate::data::{density::DensityConfig, prefetch::PipelineConfig};
use crate::ml::{evaluator::PatchSettings, model::DensityNetConfig};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate density maps for a raw ShanghaiTech-style dataset
    Preprocess(PreprocessArgs),

    /// Train the density network on a processed dataset
    Train(TrainArgs),

    /// Evaluate a checkpoint's counts on a processed dataset
    Eval(EvalArgs),

    /// Remove processed sample stores
    Clean(CleanArgs),
}

// ─── Density kernel flags (shared) ───────────────────────────────────────────
#[derive(Args, Debug, Clone)]
pub struct DensityArgs {
    /// Neighbours averaged for each point's bandwidth
    #[arg(long, default_value_t = 3)]
    pub k: usize,

    /// sigma = beta * mean neighbour distance + sigma_offset
    #[arg(long, default_value_t = 0.3)]
    pub beta: f32,

    #[arg(long, default_value_t = 0.0)]
    pub sigma_offset: f32,

    #[arg(long, default_value_t = 1.0)]
    pub sigma_min: f32,

    #[arg(long, default_value_t = 15.0)]
    pub sigma_max: f32,

    /// Kernel radius in multiples of sigma
    #[arg(long, default_value_t = 3.0)]
    pub truncate: f32,
}

impl From<DensityArgs> for DensityConfig {
    fn from(a: DensityArgs) -> Self {
        DensityConfig {
            k: a.k,
            beta: a.beta,
            sigma_offset: a.sigma_offset,
            sigma_min: a.sigma_min,
            sigma_max: a.sigma_max,
            truncate: a.truncate,
        }
    }
}

// ─── preprocess ──────────────────────────────────────────────────────────────
#[derive(Args, Debug)]
pub struct PreprocessArgs {
    /// Raw dataset root containing images/ and ground-truth/
    #[arg(long)]
    pub raw_dir: PathBuf,

    /// Processed store to write
    #[arg(long)]
    pub out_dir: PathBuf,

    #[command(flatten)]
    pub density: DensityArgs,
}

impl From<PreprocessArgs> for PreprocessConfig {
    fn from(a: PreprocessArgs) -> Self {
        PreprocessConfig { raw_dir: a.raw_dir, out_dir: a.out_dir, density: a.density.into() }
    }
}

// ─── train ───────────────────────────────────────────────────────────────────
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Processed training store
    #[arg(long, default_value = "data/processed/train")]
    pub train_dir: PathBuf,

    /// Processed held-out store for periodic evaluation
    #[arg(long)]
    pub eval_dir: Option<PathBuf>,

    /// Raw training set, preprocessed into --train-dir if that is missing
    #[arg(long)]
    pub raw_train_dir: Option<PathBuf>,

    /// Raw held-out set, preprocessed into --eval-dir if that is missing
    #[arg(long)]
    pub raw_eval_dir: Option<PathBuf>,

    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Metrics go to <log-dir>/<run-id>/metrics.csv
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    #[arg(long, default_value = "crowd-density")]
    pub run_id: String,

    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    /// Adam epsilon
    #[arg(long, default_value_t = 1e-8)]
    pub epsilon: f32,

    #[arg(long, default_value_t = 4)]
    pub batch_size: usize,

    /// Square random crop side; 0 trains on full images
    #[arg(long, default_value_t = 256)]
    pub crop_size: usize,

    #[arg(long, default_value_t = 0.5)]
    pub flip_probability: f64,

    /// Downsampling factor for image and density map
    #[arg(long, default_value_t = 1)]
    pub downsample: usize,

    /// Loader threads
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Batches buffered ahead of the training step
    #[arg(long, default_value_t = 2)]
    pub prefetch: usize,

    #[arg(long)]
    pub drop_last: bool,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Steps between checkpoints
    #[arg(long, default_value_t = 500)]
    pub checkpoint_interval: usize,

    /// Steps between train/loss metric rows
    #[arg(long, default_value_t = 10)]
    pub log_interval: usize,

    /// Epochs between evaluations (0 disables)
    #[arg(long, default_value_t = 1)]
    pub eval_interval: usize,

    /// Continue from the latest checkpoint in --checkpoint-dir
    #[arg(long)]
    pub resume: bool,

    /// Hidden channels of the network
    #[arg(long, default_value_t = 16)]
    pub width: usize,

    /// Dilated body convolutions
    #[arg(long, default_value_t = 3)]
    pub depth: usize,

    #[arg(long, default_value_t = 2)]
    pub dilation: usize,

    /// Evaluate on overlapping patches of this size instead of whole images
    #[arg(long)]
    pub eval_patch_size: Option<usize>,

    #[arg(long, default_value_t = 0.5)]
    pub eval_patch_overlap: f32,

    #[command(flatten)]
    pub density: DensityArgs,
}

impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            train_dir: a.train_dir,
            eval_dir: a.eval_dir,
            raw_train_dir: a.raw_train_dir,
            raw_eval_dir: a.raw_eval_dir,
            checkpoint_dir: a.checkpoint_dir,
            log_dir: a.log_dir,
            run_id: a.run_id,
            epochs: a.epochs,
            lr: a.lr,
            epsilon: a.epsilon,
            checkpoint_interval: a.checkpoint_interval,
            log_interval: a.log_interval,
            eval_interval: a.eval_interval,
            resume: a.resume,
            pipeline: PipelineConfig {
                batch_size: a.batch_size,
                shuffle: true,
                crop_size: (a.crop_size > 0).then_some(a.crop_size),
                flip_probability: a.flip_probability,
                downsample: a.downsample,
                workers: a.workers,
                prefetch: a.prefetch,
                drop_last: a.drop_last,
                seed: a.seed,
            },
            density: a.density.into(),
            model: DensityNetConfig::new()
                .with_width(a.width)
                .with_depth(a.depth)
                .with_dilation(a.dilation),
            eval_patch: a
                .eval_patch_size
                .map(|size| PatchSettings { size, overlap: a.eval_patch_overlap }),
        }
    }
}

// ─── eval ────────────────────────────────────────────────────────────────────
#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Checkpoint root (uses latest.json) or a single step_* directory
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint: PathBuf,

    /// Processed evaluation store
    #[arg(long, default_value = "data/processed/test")]
    pub data_dir: PathBuf,

    /// Raw evaluation set, preprocessed into --data-dir if that is missing
    #[arg(long)]
    pub raw_dir: Option<PathBuf>,

    /// Defaults to the factor in the checkpoint's train_config.json
    #[arg(long)]
    pub downsample: Option<usize>,

    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Evaluate on overlapping patches of this size
    #[arg(long)]
    pub patch_size: Option<usize>,

    #[arg(long, default_value_t = 0.5)]
    pub patch_overlap: f32,

    /// Write the full report (with per-image counts) as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl From<EvalArgs> for EvalConfig {
    fn from(a: EvalArgs) -> Self {
        EvalConfig {
            checkpoint: a.checkpoint,
            data_dir: a.data_dir,
            raw_dir: a.raw_dir,
            downsample: a.downsample,
            batch_size: a.batch_size,
            workers: a.workers,
            patch: a.patch_size.map(|size| PatchSettings { size, overlap: a.patch_overlap }),
            report: a.report,
        }
    }
}

// ─── clean ───────────────────────────────────────────────────────────────────
#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Processed stores to remove
    #[arg(long = "processed-dir", default_values = ["data/processed/train", "data/processed/test"])]
    pub processed_dirs: Vec<PathBuf>,
}
