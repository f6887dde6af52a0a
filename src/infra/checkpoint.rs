// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores trainable state with Burn's named
// MessagePack recorder at full precision, so a reloaded model
// predicts bit-for-bit what the saved one did.
//
// What gets saved per checkpoint:
//   1. model.mpk.gz — all DensityNet parameters
//   2. optim.mpk.gz — Adam moment estimates
//   3. meta.json    — versioned schema: epoch, step, model
//                     config, parameter shapes, optimizer fields
//
// File layout:
//   checkpoints/
//     step_00000010/
//       model.mpk.gz
//       optim.mpk.gz
//       meta.json
//     step_00000020/ ...
//     latest.json        ← points at the newest checkpoint
//     best.json          ← lowest eval MAE so far
//     train_config.json  ← full run configuration
//
// Atomicity:
//   A checkpoint is written into `.staging-step_…` and renamed
//   into place only when all three files exist. Pointer files are
//   written to a temp file and renamed over the old one. A crash
//   mid-write leaves at worst a staging directory that is never
//   read.
//
// Loading checks meta.json field-by-field (unknown fields are an
// error), then the schema version, model config and every
// parameter shape. Any mismatch is a CheckpointLoad error.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{Context, Result};
use burn::{
    module::Module,
    optim::Optimizer,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::application::train_use_case::TrainConfig;
use crate::domain::error::{CrowdError, CrowdResult};
use crate::ml::model::{DensityNet, DensityNetConfig};

pub const SCHEMA_VERSION: u32 = 1;

const MODEL_FILE: &str = "model";
const OPTIM_FILE: &str = "optim";
const META_FILE: &str = "meta.json";
const LATEST_FILE: &str = "latest.json";
const BEST_FILE: &str = "best.json";
const CONFIG_FILE: &str = "train_config.json";
const STAGING_PREFIX: &str = ".staging-";

type CheckpointRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

// ─── Schema ───────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerMeta {
    pub kind: String,
    pub learning_rate: f64,
    pub epsilon: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointMeta {
    pub schema_version: u32,
    /// Epoch the last completed step belongs to (1-based)
    pub epoch: usize,
    /// Steps completed within that epoch
    pub epoch_step: usize,
    /// Global step count
    pub step: usize,
    pub model: DensityNetConfig,
    pub params: BTreeMap<String, Vec<usize>>,
    pub optimizer: OptimizerMeta,
    pub train_loss: Option<f64>,
}

/// Contents of latest.json / best.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointPointer {
    pub step: usize,
    /// Directory name relative to the checkpoint root
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mae: Option<f64>,
}

pub fn checkpoint_name(step: usize) -> String {
    format!("step_{step:08}")
}

// ─── CheckpointManager ────────────────────────────────────────────────────────
pub struct CheckpointManager {
    dir: PathBuf,
    recorder: CheckpointRecorder,
}

impl CheckpointManager {
    /// Open (and create if needed) a checkpoint directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
        Ok(Self { dir, recorder: CheckpointRecorder::new() })
    }

    /// Open an existing location for reading only. `path` may be the
    /// checkpoint root or one checkpoint directory inside it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { dir: path.into(), recorder: CheckpointRecorder::new() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Save ──────────────────────────────────────────────────────────────────

    /// Write model + optimizer + meta as one checkpoint and move
    /// latest.json to it. Returns the checkpoint directory.
    pub fn save<AB, O>(&self, model: &DensityNet<AB>, optim: &O, meta: &CheckpointMeta) -> Result<PathBuf>
    where
        AB: AutodiffBackend,
        O: Optimizer<DensityNet<AB>, AB>,
    {
        let name = checkpoint_name(meta.step);
        let staging = self.dir.join(format!("{STAGING_PREFIX}{name}"));
        let target = self.dir.join(&name);

        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)
            .with_context(|| format!("Cannot create '{}'", staging.display()))?;

        model
            .clone()
            .save_file(staging.join(MODEL_FILE), &self.recorder)
            .with_context(|| format!("Failed to save model weights to '{}'", staging.display()))?;

        Recorder::<AB>::record(&self.recorder, optim.to_record(), staging.join(OPTIM_FILE))
            .with_context(|| format!("Failed to save optimizer state to '{}'", staging.display()))?;

        fs::write(staging.join(META_FILE), serde_json::to_string_pretty(meta)?)
            .with_context(|| format!("Failed to write meta.json in '{}'", staging.display()))?;

        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&staging, &target)
            .with_context(|| format!("Failed to move checkpoint into '{}'", target.display()))?;

        self.write_pointer(LATEST_FILE, &CheckpointPointer { step: meta.step, name, mae: None })?;

        tracing::debug!("Saved checkpoint: step {} (epoch {})", meta.step, meta.epoch);
        Ok(target)
    }

    /// Record the checkpoint at `step` as the best one so far.
    pub fn mark_best(&self, step: usize, mae: f64) -> Result<()> {
        let name = checkpoint_name(step);
        anyhow::ensure!(
            self.dir.join(&name).join(META_FILE).is_file(),
            "cannot mark missing checkpoint '{name}' as best"
        );
        self.write_pointer(BEST_FILE, &CheckpointPointer { step, name, mae: Some(mae) })
    }

    fn write_pointer(&self, file: &str, pointer: &CheckpointPointer) -> Result<()> {
        write_json_atomic(&self.dir.join(file), pointer)
    }

    /// Save the training configuration next to the checkpoints.
    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        let path = self.dir.join(CONFIG_FILE);
        write_json_atomic(&path, cfg)?;
        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    pub fn load_config(&self) -> Result<TrainConfig> {
        read_json(&self.dir.join(CONFIG_FILE))
    }

    // ── Locate ────────────────────────────────────────────────────────────────

    pub fn latest(&self) -> Result<Option<CheckpointPointer>> {
        let path = self.dir.join(LATEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn best(&self) -> Result<Option<CheckpointPointer>> {
        let path = self.dir.join(BEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Turn the managed path into a concrete checkpoint directory:
    /// itself if it holds a meta.json, otherwise whatever latest.json
    /// points to.
    pub fn resolve(&self) -> CrowdResult<PathBuf> {
        if self.dir.join(META_FILE).is_file() {
            return Ok(self.dir.clone());
        }
        let pointer = self
            .latest()
            .map_err(|e| CrowdError::checkpoint(&self.dir, format!("{e:#}")))?
            .ok_or_else(|| CrowdError::checkpoint(&self.dir, "no checkpoint found (missing latest.json)"))?;
        let dir = self.dir.join(&pointer.name);
        if !dir.join(META_FILE).is_file() {
            return Err(CrowdError::checkpoint(&dir, "latest.json points to a missing checkpoint"));
        }
        Ok(dir)
    }

    // ── Load ──────────────────────────────────────────────────────────────────

    pub fn load_meta(&self, ckpt: &Path) -> CrowdResult<CheckpointMeta> {
        let path = ckpt.join(META_FILE);
        let json = fs::read_to_string(&path)
            .map_err(|e| CrowdError::checkpoint(&path, format!("cannot read: {e}")))?;
        let meta: CheckpointMeta = serde_json::from_str(&json)
            .map_err(|e| CrowdError::checkpoint(&path, format!("schema mismatch: {e}")))?;

        if meta.schema_version != SCHEMA_VERSION {
            return Err(CrowdError::checkpoint(
                &path,
                format!(
                    "schema version {} is not supported (expected {SCHEMA_VERSION})",
                    meta.schema_version
                ),
            ));
        }
        Ok(meta)
    }

    /// Rebuild the model described by meta.json and load its weights.
    /// With `expected` set, the stored config must match it exactly.
    pub fn load_model<B: Backend>(
        &self,
        ckpt: &Path,
        expected: Option<&DensityNetConfig>,
        device: &B::Device,
    ) -> CrowdResult<(DensityNet<B>, CheckpointMeta)> {
        let meta = self.load_meta(ckpt)?;

        if let Some(expected) = expected {
            if &meta.model != expected {
                return Err(CrowdError::checkpoint(
                    ckpt,
                    format!("model config {:?} does not match {:?}", meta.model, expected),
                ));
            }
        }

        let fresh: DensityNet<B> = meta.model.init(device);
        check_shapes(ckpt, &meta.params, &fresh.param_shapes())?;

        let model = fresh
            .load_file(ckpt.join(MODEL_FILE), &self.recorder, device)
            .map_err(|e| CrowdError::checkpoint(ckpt, format!("cannot load weights: {e}")))?;
        check_shapes(ckpt, &meta.params, &model.param_shapes())?;

        tracing::info!("Loaded checkpoint '{}' (step {})", ckpt.display(), meta.step);
        Ok((model, meta))
    }

    pub fn load_optimizer<AB, O>(&self, ckpt: &Path, optim: O, device: &AB::Device) -> CrowdResult<O>
    where
        AB: AutodiffBackend,
        O: Optimizer<DensityNet<AB>, AB>,
    {
        let record = Recorder::<AB>::load(&self.recorder, ckpt.join(OPTIM_FILE), device)
            .map_err(|e| CrowdError::checkpoint(ckpt, format!("cannot load optimizer state: {e}")))?;
        Ok(optim.load_record(record))
    }
}

fn check_shapes(
    ckpt: &Path,
    stored: &BTreeMap<String, Vec<usize>>,
    model: &BTreeMap<String, Vec<usize>>,
) -> CrowdResult<()> {
    for (name, shape) in model {
        match stored.get(name) {
            None => return Err(CrowdError::checkpoint(ckpt, format!("missing parameter '{name}'"))),
            Some(s) if s != shape => {
                return Err(CrowdError::checkpoint(
                    ckpt,
                    format!("parameter '{name}' has shape {s:?}, model expects {shape:?}"),
                ))
            }
            Some(_) => {}
        }
    }
    if let Some(extra) = stored.keys().find(|k| !model.contains_key(*k)) {
        return Err(CrowdError::checkpoint(ckpt, format!("unknown parameter '{extra}'")));
    }
    Ok(())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Cannot write '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Cannot replace '{}'", path.display()))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Cannot read '{}'. Have you run 'train' first?", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Cannot parse '{}'", path.display()))
}
