// ============================================================
// Layer 4 — Augmentation Transforms
// ============================================================
// Each transform is a pure (Image, DensityMap) → (Image, DensityMap)
// step. Whatever happens to the image happens to the map at the
// same pixels, so the map stays aligned with the heads it counts.
//
// A TransformPipeline is an ordered list of Augmentation values
// (a closed enum, no boxed trait objects):
//
//   training:   RandomCrop → HorizontalFlip → Downsample
//   evaluation: Downsample
//
// Mass bookkeeping:
//   RandomCrop     keeps only the mass inside the window
//   HorizontalFlip keeps all of it
//   Downsample     keeps all of it (sum-pooled, not resampled)
//
// Randomness comes from a StdRng seeded per (seed, epoch, item),
// so a run is reproducible whatever order the workers finish in.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::domain::sample::Sample;
use crate::domain::traits::Transform;

// ─── RandomCrop ───────────────────────────────────────────────────────────────
/// Cut a fixed-size window at a random position. Images smaller than
/// the window are zero-padded on the bottom/right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomCrop {
    pub height: usize,
    pub width: usize,
}

impl Transform for RandomCrop {
    fn apply(&self, sample: Sample, rng: &mut StdRng) -> Sample {
        let (h, w) = sample.dims();
        let top = rng.gen_range(0..=h.saturating_sub(self.height));
        let left = rng.gen_range(0..=w.saturating_sub(self.width));

        Sample {
            image: sample.image.crop_padded(top, left, self.height, self.width),
            density: sample.density.crop_padded(top, left, self.height, self.width),
            id: sample.id,
        }
    }
}

// ─── HorizontalFlip ───────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizontalFlip {
    /// Chance of mirroring, in [0, 1]
    pub probability: f64,
}

impl Transform for HorizontalFlip {
    fn apply(&self, sample: Sample, rng: &mut StdRng) -> Sample {
        // Always draw, so later steps see the same RNG stream either way
        let flip = rng.gen_bool(self.probability.clamp(0.0, 1.0));
        if !flip {
            return sample;
        }
        Sample {
            image: sample.image.flip_horizontal(),
            density: sample.density.flip_horizontal(),
            id: sample.id,
        }
    }
}

// ─── Downsample ───────────────────────────────────────────────────────────────
/// Reduce resolution by an integer factor: the image is average-pooled,
/// the density map is re-derived by sum-pooling so its count is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Downsample {
    pub factor: usize,
}

impl Transform for Downsample {
    fn apply(&self, sample: Sample, _rng: &mut StdRng) -> Sample {
        if self.factor <= 1 {
            return sample;
        }
        Sample {
            image: sample.image.downsample(self.factor),
            density: sample.density.downsample(self.factor),
            id: sample.id,
        }
    }
}

// ─── Augmentation ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Augmentation {
    Crop(RandomCrop),
    Flip(HorizontalFlip),
    Downsample(Downsample),
}

impl Transform for Augmentation {
    fn apply(&self, sample: Sample, rng: &mut StdRng) -> Sample {
        match self {
            Augmentation::Crop(t) => t.apply(sample, rng),
            Augmentation::Flip(t) => t.apply(sample, rng),
            Augmentation::Downsample(t) => t.apply(sample, rng),
        }
    }
}

// ─── TransformPipeline ────────────────────────────────────────────────────────
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformPipeline {
    steps: Vec<Augmentation>,
}

impl TransformPipeline {
    /// crop (optional) → flip (skipped when probability is 0) → downsample
    pub fn training(crop: Option<(usize, usize)>, flip_probability: f64, factor: usize) -> Self {
        let mut steps = Vec::new();
        if let Some((height, width)) = crop {
            steps.push(Augmentation::Crop(RandomCrop { height, width }));
        }
        if flip_probability > 0.0 {
            steps.push(Augmentation::Flip(HorizontalFlip { probability: flip_probability }));
        }
        steps.push(Augmentation::Downsample(Downsample { factor }));
        Self { steps }
    }

    /// Downsampling only: evaluation must see every pixel.
    pub fn evaluation(factor: usize) -> Self {
        Self { steps: vec![Augmentation::Downsample(Downsample { factor })] }
    }

    #[cfg(test)]
    pub fn steps(&self) -> &[Augmentation] {
        &self.steps
    }
}

impl Transform for TransformPipeline {
    fn apply(&self, sample: Sample, rng: &mut StdRng) -> Sample {
        self.steps.iter().fold(sample, |s, step| step.apply(s, rng))
    }
}

/// RNG for one item of one epoch. Mixing with splitmix64 keeps nearby
/// (epoch, position) pairs from producing correlated streams.
pub fn item_rng(seed: u64, epoch: usize, position: usize) -> StdRng {
    let mut z = seed
        ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (position as u64).wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    StdRng::seed_from_u64(z ^ (z >> 31))
}
