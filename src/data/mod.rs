// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything between raw annotated images and tensor batches.
//
//   images/ + ground-truth/
//       │
//       ▼
//   AnnotationLoader     → points + image geometry
//       │
//       ▼
//   DensityMapGenerator  → ground-truth density map
//       │                  (written to the processed store)
//       ▼
//   ProcessedDataset     → implements Burn's Dataset trait
//       │
//       ▼
//   TransformPipeline    → crop / flip / downsample
//       │
//       ▼
//   DataPipeline         → bounded prefetch queue of SampleBatch
//       │
//       ▼
//   DensityBatcher       → tensors on the training device
//
// PatchGrid sits to the side: the evaluator uses it to cut
// large images into overlapping tiles and stitch them back.
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Reads point annotations and image dimensions
pub mod loader;

/// MATLAB v5 container reader for .mat ground truth
pub mod mat;

/// Geometry-adaptive Gaussian density maps
pub mod density;

/// Pure (image, density) transforms and their pipeline
pub mod augment;

/// Overlapping patch split / reassembly for evaluation
pub mod patches;

/// Implements Burn's Dataset trait over the processed store
pub mod dataset;

/// Pads and stacks samples, then builds tensors
pub mod batcher;

/// Producer thread + bounded channel feeding the trainer
pub mod prefetch;
