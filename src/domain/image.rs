// ============================================================
// Layer 3 — Crowd Image
// ============================================================
// A 3-channel raster stored channel-first ([3, height, width])
// with values in [0, 1]. Immutable once loaded: every operation
// returns a new image.

use ndarray::{s, Array3, Axis};

pub const CHANNELS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct CrowdImage {
    pixels: Array3<f32>,
}

impl CrowdImage {
    /// Wrap a CHW array. Returns None unless it has exactly 3 channels.
    pub fn from_array(pixels: Array3<f32>) -> Option<Self> {
        (pixels.len_of(Axis(0)) == CHANNELS).then_some(Self { pixels })
    }

    /// Solid-colour image
    #[cfg(test)]
    pub fn filled(height: usize, width: usize, value: f32) -> Self {
        Self { pixels: Array3::from_elem((CHANNELS, height, width), value) }
    }

    /// Build an image from a `(channel, y, x) -> value` function.
    pub fn from_fn(height: usize, width: usize, f: impl FnMut((usize, usize, usize)) -> f32) -> Self {
        Self { pixels: Array3::from_shape_fn((CHANNELS, height, width), f) }
    }

    pub fn height(&self) -> usize {
        self.pixels.len_of(Axis(1))
    }

    pub fn width(&self) -> usize {
        self.pixels.len_of(Axis(2))
    }

    pub fn as_array(&self) -> &Array3<f32> {
        &self.pixels
    }

    /// Average-pool `factor x factor` blocks; edge blocks average only
    /// the pixels they actually cover.
    pub fn downsample(&self, factor: usize) -> CrowdImage {
        let f = factor.max(1);
        if f == 1 {
            return self.clone();
        }
        let (h, w) = (self.height(), self.width());
        let (out_h, out_w) = (h.div_ceil(f), w.div_ceil(f));
        let mut sums = Array3::<f32>::zeros((CHANNELS, out_h, out_w));
        for ((c, y, x), &v) in self.pixels.indexed_iter() {
            sums[[c, y / f, x / f]] += v;
        }
        for ((_, oy, ox), v) in sums.indexed_iter_mut() {
            let rows = (h - oy * f).min(f);
            let cols = (w - ox * f).min(f);
            *v /= (rows * cols) as f32;
        }
        CrowdImage { pixels: sums }
    }

    pub fn flip_horizontal(&self) -> CrowdImage {
        CrowdImage { pixels: self.pixels.slice(s![.., .., ..;-1]).to_owned() }
    }

    /// Window of `height x width` at (top, left), zero outside the source.
    pub fn crop_padded(&self, top: usize, left: usize, height: usize, width: usize) -> CrowdImage {
        let mut out = Array3::<f32>::zeros((CHANNELS, height, width));
        let y_end = (top + height).min(self.height());
        let x_end = (left + width).min(self.width());
        if top < y_end && left < x_end {
            out.slice_mut(s![.., ..y_end - top, ..x_end - left])
                .assign(&self.pixels.slice(s![.., top..y_end, left..x_end]));
        }
        CrowdImage { pixels: out }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_wrong_channel_count() {
        assert!(CrowdImage::from_array(Array3::zeros((1, 4, 4))).is_none());
        assert!(CrowdImage::from_array(Array3::zeros((3, 4, 4))).is_some());
    }

    #[test]
    fn test_downsample_averages_partial_blocks() {
        let img = CrowdImage::filled(5, 3, 0.5);
        let down = img.downsample(2);
        assert_eq!((down.height(), down.width()), (3, 2));
        for &v in down.as_array().iter() {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_flip_and_crop() {
        let mut arr = Array3::<f32>::zeros((3, 2, 3));
        arr[[0, 0, 0]] = 1.0;
        let img = CrowdImage::from_array(arr).unwrap();
        assert_eq!(img.flip_horizontal().as_array()[[0, 0, 2]], 1.0);

        let crop = img.crop_padded(0, 0, 4, 4);
        assert_eq!((crop.height(), crop.width()), (4, 4));
        assert_eq!(crop.as_array()[[0, 0, 0]], 1.0);
        assert_eq!(crop.as_array()[[0, 3, 3]], 0.0);
    }
}
