// ============================================================
// Layer 4 — Patch Grid
// ============================================================
// Splits a large image into overlapping square patches for
// evaluation, then stitches per-patch predictions back into one
// full-size density map.
//
// Sliding window with overlap, per axis:
//   stride = patch - floor(patch * overlap)   (at least 1)
//   starts = 0, stride, 2*stride, ... until a window reaches the edge
//
// Example with patch=4, overlap=0.5 on a 9px axis:
//   stride = 2
//   windows: [0..4) [2..6) [4..8) [6..10)
//   the last window runs 1px past the edge → reflect padding
//
// Padding mirrors the image without repeating the border pixel
// (…c b a | b c…). Overlapping predictions are averaged, then the
// canvas is cropped back to the original size, so the padded
// region never contributes to a count.

use anyhow::{bail, Result};
use ndarray::{s, Array2};

use crate::domain::image::CrowdImage;

#[derive(Debug, Clone, PartialEq)]
pub struct PatchGrid {
    patch: usize,
    stride: usize,
    height: usize,
    width: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl PatchGrid {
    /// `overlap` is the fraction of a patch shared with its neighbour, in [0, 1).
    pub fn new(height: usize, width: usize, patch: usize, overlap: f32) -> Result<Self> {
        if patch == 0 {
            bail!("patch size must be positive");
        }
        if !(0.0..1.0).contains(&overlap) {
            bail!("patch overlap must be in [0, 1), got {overlap}");
        }
        if height == 0 || width == 0 {
            bail!("cannot split an empty {width}x{height} image into patches");
        }

        let shared = (patch as f32 * overlap).floor() as usize;
        let stride = patch.saturating_sub(shared).max(1);

        Ok(Self {
            patch,
            stride,
            height,
            width,
            rows: window_starts(height, patch, stride),
            cols: window_starts(width, patch, stride),
        })
    }

    pub fn patch_size(&self) -> usize {
        self.patch
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Top-left corner of every patch, row-major.
    pub fn origins(&self) -> Vec<(usize, usize)> {
        self.rows
            .iter()
            .flat_map(|&r| self.cols.iter().map(move |&c| (r, c)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len() * self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn padded_dims(&self) -> (usize, usize) {
        let last_row = self.rows.last().copied().unwrap_or(0);
        let last_col = self.cols.last().copied().unwrap_or(0);
        (last_row + self.patch, last_col + self.patch)
    }

    /// Cut the image into patches, reflect-padding past the bottom/right edge.
    pub fn extract(&self, image: &CrowdImage) -> Vec<CrowdImage> {
        let src = image.as_array();
        let (h, w) = (image.height(), image.width());

        self.origins()
            .into_iter()
            .map(|(top, left)| {
                CrowdImage::from_fn(self.patch, self.patch, |(c, y, x)| {
                    src[[c, reflect(top + y, h), reflect(left + x, w)]]
                })
            })
            .collect()
    }

    /// Average overlapping patch predictions into an `height x width` map.
    /// `predictions` must be in `origins()` order, each `patch x patch`.
    pub fn assemble(&self, predictions: &[Array2<f32>]) -> Result<Array2<f32>> {
        if predictions.len() != self.len() {
            bail!("expected {} patch predictions, got {}", self.len(), predictions.len());
        }

        let (ph, pw) = self.padded_dims();
        let mut sum = Array2::<f32>::zeros((ph, pw));
        let mut hits = Array2::<f32>::zeros((ph, pw));

        for ((top, left), pred) in self.origins().into_iter().zip(predictions) {
            if pred.dim() != (self.patch, self.patch) {
                bail!("patch prediction has shape {:?}, expected {}x{}", pred.dim(), self.patch, self.patch);
            }
            let window = s![top..top + self.patch, left..left + self.patch];
            sum.slice_mut(window).zip_mut_with(pred, |acc, &v| *acc += v);
            hits.slice_mut(window).mapv_inplace(|n| n + 1.0);
        }

        let averaged = &sum / &hits.mapv(|n| n.max(1.0));
        Ok(averaged.slice(s![..self.height, ..self.width]).to_owned())
    }
}

fn window_starts(len: usize, patch: usize, stride: usize) -> Vec<usize> {
    let mut starts = vec![0];
    let mut start = 0;
    while start + patch < len {
        start += stride;
        starts.push(start);
    }
    starts
}

/// Mirror index `i` into `[0, len)` without repeating the edge pixel.
fn reflect(i: usize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let m = i % period;
    if m < len {
        m
    } else {
        period - m
    }
}
