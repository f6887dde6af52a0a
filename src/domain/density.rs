// ============================================================
// Layer 3 — Density Map
// ============================================================
// A 2D grid of non-negative values, one per pixel (row-major,
// shape [height, width]). Summing the grid gives the number of
// people in the frame.
//
// Every geometric operation here keeps track of mass:
//   - flip / crop move mass around (crop drops what falls outside)
//   - downsample re-derives the coarse grid by summing blocks,
//     so the total is unchanged
//   - resample_nearest (tests only) is the naive alternative and
//     does NOT keep the total; rescaled_to restores it afterwards

use ndarray::{s, Array2};

#[derive(Debug, Clone, PartialEq)]
pub struct DensityMap {
    grid: Array2<f32>,
}

impl DensityMap {
    pub fn zeros(height: usize, width: usize) -> Self {
        Self { grid: Array2::zeros((height, width)) }
    }

    pub fn from_array(grid: Array2<f32>) -> Self {
        Self { grid }
    }

    pub fn height(&self) -> usize {
        self.grid.nrows()
    }

    pub fn width(&self) -> usize {
        self.grid.ncols()
    }

    pub fn as_array(&self) -> &Array2<f32> {
        &self.grid
    }

    pub fn as_array_mut(&mut self) -> &mut Array2<f32> {
        &mut self.grid
    }

    /// Total mass, accumulated in f64
    pub fn count(&self) -> f64 {
        self.grid.iter().map(|&v| v as f64).sum()
    }

    /// Sum-pool `factor x factor` blocks. Partial blocks at the right and
    /// bottom edges are kept, so the output is `ceil(h/f) x ceil(w/f)`
    /// and no mass is lost.
    pub fn downsample(&self, factor: usize) -> DensityMap {
        let f = factor.max(1);
        if f == 1 {
            return self.clone();
        }
        let out_h = self.height().div_ceil(f);
        let out_w = self.width().div_ceil(f);
        let mut out = Array2::<f32>::zeros((out_h, out_w));
        for ((y, x), &v) in self.grid.indexed_iter() {
            out[[y / f, x / f]] += v;
        }
        DensityMap { grid: out }
    }

    /// Nearest-neighbour resize. Mass scales with the area ratio.
    #[cfg(test)]
    pub fn resample_nearest(&self, out_h: usize, out_w: usize) -> DensityMap {
        let (h, w) = self.grid.dim();
        let mut out = Array2::<f32>::zeros((out_h, out_w));
        if h == 0 || w == 0 {
            return DensityMap { grid: out };
        }
        for ((y, x), v) in out.indexed_iter_mut() {
            let sy = (y * h / out_h.max(1)).min(h - 1);
            let sx = (x * w / out_w.max(1)).min(w - 1);
            *v = self.grid[[sy, sx]];
        }
        DensityMap { grid: out }
    }

    /// Scale all cells so the total equals `target`.
    /// An all-zero map stays all-zero.
    #[cfg(test)]
    pub fn rescaled_to(&self, target: f64) -> DensityMap {
        let current = self.count();
        if current <= 0.0 {
            return self.clone();
        }
        let k = (target / current) as f32;
        DensityMap { grid: self.grid.mapv(|v| v * k) }
    }

    pub fn flip_horizontal(&self) -> DensityMap {
        DensityMap { grid: self.grid.slice(s![.., ..;-1]).to_owned() }
    }

    /// Window of `height x width` starting at (top, left). Cells outside
    /// the source are zero.
    pub fn crop_padded(&self, top: usize, left: usize, height: usize, width: usize) -> DensityMap {
        let mut out = Array2::<f32>::zeros((height, width));
        let y_end = (top + height).min(self.height());
        let x_end = (left + width).min(self.width());
        if top < y_end && left < x_end {
            out.slice_mut(s![..y_end - top, ..x_end - left])
                .assign(&self.grid.slice(s![top..y_end, left..x_end]));
        }
        DensityMap { grid: out }
    }
}
