// ============================================================
// Layer 5 — Density Regression Network
// ============================================================
// A small fully-convolutional network mapping an RGB image to a
// one-channel density map of the same height and width:
//
//   [N, 3, H, W]
//     stem   3x3 conv, 3 → width, ReLU
//     body   depth × (3x3 dilated conv, width → width, ReLU)
//     head   1x1 conv, width → 1
//   [N, 1, H, W]
//
// Padding equals the dilation, so every layer keeps the spatial
// size and predictions line up pixel for pixel with the target.
//
// Reference: Li et al. (2018) CSRNet — dilated back-end

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::{MseLoss, Reduction},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};
use std::collections::BTreeMap;

use crate::data::batcher::DensityBatch;

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug, PartialEq)]
pub struct DensityNetConfig {
    /// Channels in every hidden layer
    #[config(default = 16)]
    pub width: usize,
    /// Number of dilated body convolutions
    #[config(default = 3)]
    pub depth: usize,
    #[config(default = 2)]
    pub dilation: usize,
}

impl DensityNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DensityNet<B> {
        let stem = Conv2dConfig::new([3, self.width], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let d = self.dilation.max(1);
        let body = (0..self.depth)
            .map(|_| {
                Conv2dConfig::new([self.width, self.width], [3, 3])
                    .with_dilation([d, d])
                    .with_padding(PaddingConfig2d::Explicit(d, d))
                    .init(device)
            })
            .collect();

        let head = Conv2dConfig::new([self.width, 1], [1, 1])
            .with_padding(PaddingConfig2d::Valid)
            .init(device);

        DensityNet { stem, body, head }
    }
}

#[derive(Module, Debug)]
pub struct DensityNet<B: Backend> {
    pub stem: Conv2d<B>,
    pub body: Vec<Conv2d<B>>,
    pub head: Conv2d<B>,
}

impl<B: Backend> DensityNet<B> {
    /// images: [N, 3, H, W] → density: [N, 1, H, W]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = relu(self.stem.forward(images));
        for conv in &self.body {
            x = relu(conv.forward(x));
        }
        self.head.forward(x)
    }

    /// Pixel-wise mean squared error against the ground-truth maps.
    pub fn forward_loss(&self, batch: &DensityBatch<B>) -> (Tensor<B, 1>, Tensor<B, 4>) {
        let predicted = self.forward(batch.images.clone());
        let loss = MseLoss::new().forward(predicted.clone(), batch.densities.clone(), Reduction::Mean);
        (loss, predicted)
    }

    /// Parameter name → shape, used to check a checkpoint against this model.
    pub fn param_shapes(&self) -> BTreeMap<String, Vec<usize>> {
        let mut shapes = BTreeMap::new();
        let mut add = |name: String, conv: &Conv2d<B>| {
            shapes.insert(format!("{name}.weight"), conv.weight.val().dims().to_vec());
            if let Some(bias) = &conv.bias {
                shapes.insert(format!("{name}.bias"), bias.val().dims().to_vec());
            }
        };

        add("stem".to_string(), &self.stem);
        for (i, conv) in self.body.iter().enumerate() {
            add(format!("body.{i}"), conv);
        }
        add("head".to_string(), &self.head);
        shapes
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ComputeBackend as B;

    #[test]
    fn test_output_keeps_spatial_size() {
        let device = Default::default();
        let model = DensityNetConfig::new().init::<B>(&device);
        for (h, w) in [(8, 8), (13, 7), (1, 1)] {
            let out = model.forward(Tensor::zeros([2, 3, h, w], &device));
            assert_eq!(out.dims(), [2, 1, h, w]);
        }
    }

    #[test]
    fn test_param_shapes_follow_config() {
        let device = Default::default();
        let cfg = DensityNetConfig::new().with_width(8).with_depth(2);
        let shapes = cfg.init::<B>(&device).param_shapes();

        assert_eq!(shapes["stem.weight"], vec![8, 3, 3, 3]);
        assert_eq!(shapes["body.1.weight"], vec![8, 8, 3, 3]);
        assert_eq!(shapes["head.weight"], vec![1, 8, 1, 1]);
        assert_eq!(shapes["head.bias"], vec![1]);
        assert!(!shapes.contains_key("body.2.weight"));
    }
}
