// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The seams between layers:
//   - AnnotationSource: where raw point annotations come from
//   - Transform:        one step of the augmentation pipeline
//
// Samples themselves are served through burn's Dataset trait
// (see data/dataset.rs), so no extra trait is needed for them.

use anyhow::Result;
use rand::rngs::StdRng;

use crate::domain::annotation::AnnotatedImage;
use crate::domain::error::CrowdResult;
use crate::domain::sample::Sample;

// ─── AnnotationSource ─────────────────────────────────────────────────────────
/// Anything that can list image ids and hand back their annotations.
///
/// Implementations:
///   - AnnotationLoader → ShanghaiTech-style images/ + ground-truth/ folders
pub trait AnnotationSource {
    /// All image ids available in this source, sorted.
    fn image_ids(&self) -> Result<Vec<String>>;

    /// Points and image geometry for one id. Read-only.
    fn load(&self, image_id: &str) -> CrowdResult<AnnotatedImage>;
}

// ─── Transform ────────────────────────────────────────────────────────────────
/// A pure (Image, DensityMap) → (Image, DensityMap) step.
/// Randomness comes only from the RNG passed in, so the same seed
/// always gives the same output.
pub trait Transform {
    fn apply(&self, sample: Sample, rng: &mut StdRng) -> Sample;
}
