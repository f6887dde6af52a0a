// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All training and inference math lives here:
//
//   model.rs     — DensityNet, a dilated fully-convolutional
//                  regressor from RGB to density
//
//   trainer.rs   — The training loop: forward, MSE loss,
//                  backward, Adam step, periodic metrics,
//                  checkpoints and evaluation, stop/resume
//
//   evaluator.rs — Read-only count evaluation of a checkpoint:
//                  MAE / MSE / RMSE / MAPE, whole images or
//                  overlapping patches
//
// Backends:
//   default      NdArray (CPU)
//   --features wgpu  Wgpu (GPU)
//   Training wraps the compute backend in Autodiff; evaluation
//   runs on the compute backend itself via model.valid().
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)

use burn::tensor::backend::Backend;

#[cfg(not(feature = "wgpu"))]
pub type ComputeBackend = burn::backend::NdArray<f32>;

#[cfg(feature = "wgpu")]
pub type ComputeBackend = burn::backend::Wgpu;

pub type TrainBackend = burn::backend::Autodiff<ComputeBackend>;

pub type ComputeDevice = <ComputeBackend as Backend>::Device;

/// Density regression network
pub mod model;

/// Training loop with checkpointing, evaluation and cooperative stop
pub mod trainer;

/// Count-level evaluation of a trained model
pub mod evaluator;
