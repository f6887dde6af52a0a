// ============================================================
// Layer 4 — Density Batcher
// ============================================================
// Two halves:
//
//   SampleBatch   — plain CPU buffers, built on a loader thread
//                   and sent through the prefetch channel
//   DensityBatcher — turns a SampleBatch into backend tensors on
//                   the training device
//
// Samples in one batch can differ in size (evaluation never
// crops), so every item is zero-padded to the largest height
// and width in the batch. Each item keeps its own valid size so
// predictions can be summed over real pixels only.
//
// Tensor layout:
//   images    [batch, 3, height, width]
//   densities [batch, 1, height, width]
//
// Reference: Burn Book §4 (Batcher)

use burn::prelude::*;
use burn::tensor::TensorData;
use ndarray::s;

use crate::domain::image::CHANNELS;
use crate::domain::sample::Sample;

// ─── SampleBatch ──────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub ids: Vec<String>,
    /// Row-major [batch, 3, height, width]
    pub images: Vec<f32>,
    /// Row-major [batch, height, width]
    pub densities: Vec<f32>,
    pub height: usize,
    pub width: usize,
    /// Unpadded (height, width) of each item
    pub sizes: Vec<(usize, usize)>,
    /// Ground-truth count of each item
    pub counts: Vec<f64>,
}

impl SampleBatch {
    /// Pad and stack samples. Returns None for an empty list.
    pub fn from_samples(samples: Vec<Sample>) -> Option<Self> {
        let height = samples.iter().map(|s| s.dims().0).max()?;
        let width = samples.iter().map(|s| s.dims().1).max()?;
        let n = samples.len();

        let plane = height * width;
        let mut images = vec![0.0f32; n * CHANNELS * plane];
        let mut densities = vec![0.0f32; n * plane];
        let mut ids = Vec::with_capacity(n);
        let mut sizes = Vec::with_capacity(n);
        let mut counts = Vec::with_capacity(n);

        for (i, sample) in samples.into_iter().enumerate() {
            let (h, w) = sample.dims();
            let img = sample.image.as_array();
            for c in 0..CHANNELS {
                let base = (i * CHANNELS + c) * plane;
                for (y, row) in img.slice(s![c, .., ..]).rows().into_iter().enumerate() {
                    let start = base + y * width;
                    for (dst, &v) in images[start..start + w].iter_mut().zip(row.iter()) {
                        *dst = v;
                    }
                }
            }

            let base = i * plane;
            for (y, row) in sample.density.as_array().rows().into_iter().enumerate() {
                let start = base + y * width;
                for (dst, &v) in densities[start..start + w].iter_mut().zip(row.iter()) {
                    *dst = v;
                }
            }

            counts.push(sample.count());
            sizes.push((h, w));
            ids.push(sample.id);
        }

        Some(Self { ids, images, densities, height, width, sizes, counts })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// ─── DensityBatch ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct DensityBatch<B: Backend> {
    /// [batch, 3, height, width]
    pub images: Tensor<B, 4>,
    /// [batch, 1, height, width]
    pub densities: Tensor<B, 4>,
    pub ids: Vec<String>,
    pub sizes: Vec<(usize, usize)>,
    pub counts: Vec<f64>,
}

// ─── DensityBatcher ───────────────────────────────────────────────────────────
/// Holds the target device so tensors land on the right CPU/GPU.
#[derive(Clone, Debug)]
pub struct DensityBatcher<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> DensityBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    pub fn batch(&self, batch: SampleBatch) -> DensityBatch<B> {
        let n = batch.len();
        let (h, w) = (batch.height, batch.width);

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(batch.images, [n, CHANNELS, h, w]),
            &self.device,
        );
        let densities =
            Tensor::<B, 4>::from_data(TensorData::new(batch.densities, [n, 1, h, w]), &self.device);

        DensityBatch { images, densities, ids: batch.ids, sizes: batch.sizes, counts: batch.counts }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{density::DensityMap, image::CrowdImage};
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn sample(id: &str, h: usize, w: usize, mass: f32) -> Sample {
        let mut density = DensityMap::zeros(h, w);
        density.as_array_mut()[[h - 1, w - 1]] = mass;
        Sample::new(id, CrowdImage::filled(h, w, 0.5), density)
    }

    #[test]
    fn test_pads_to_largest_item() {
        let batch =
            SampleBatch::from_samples(vec![sample("a", 2, 3, 1.0), sample("b", 4, 2, 2.0)]).unwrap();
        assert_eq!((batch.height, batch.width), (4, 3));
        assert_eq!(batch.sizes, vec![(2, 3), (4, 2)]);
        assert_eq!(batch.counts, vec![1.0, 2.0]);
        assert_eq!(batch.images.len(), 2 * 3 * 4 * 3);

        // item a: valid (2x3), bottom rows padded with zeros
        assert_eq!(batch.images[0], 0.5);
        assert_eq!(batch.images[2 * 3], 0.0);
        assert_eq!(batch.densities[3 + 2], 1.0);
        // item b: last valid column is 1, column 2 is padding
        assert_eq!(batch.densities[12 + 3 * 3 + 1], 2.0);
        assert_eq!(batch.densities[12 + 3 * 3 + 2], 0.0);
    }

    #[test]
    fn test_empty_list_gives_no_batch() {
        assert!(SampleBatch::from_samples(Vec::new()).is_none());
    }

    #[test]
    fn test_tensor_shapes() {
        let cpu = SampleBatch::from_samples(vec![sample("a", 3, 5, 1.0); 2]).unwrap();
        let batch = DensityBatcher::<B>::new(Default::default()).batch(cpu);
        assert_eq!(batch.images.dims(), [2, 3, 3, 5]);
        assert_eq!(batch.densities.dims(), [2, 1, 3, 5]);
        let total: f32 = batch.densities.sum().into_scalar();
        assert!((total - 2.0).abs() < 1e-6);
    }
}
