// ============================================================
// Layer 4 — Density Map Generator
// ============================================================
// Turns a sparse point set into a dense ground-truth map using
// geometry-adaptive Gaussian kernels.
//
// For every point p:
//
//   d(p)  = mean distance to its k nearest neighbours
//           (fewer if the image has fewer other points)
//   σ(p)  = clamp(beta * d(p) + sigma_offset, sigma_min, sigma_max)
//           (sigma_max when p has no neighbours at all)
//
// The kernel is centred on the pixel containing p and spans
// ceil(truncate * σ) pixels each way. It is separable, so the
// 2D footprint is the outer product of two 1D Gaussians, each
// normalised over the part of the window inside the image.
// The footprint therefore always sums to exactly 1 and the map
// sums to the point count, borders included.
//
// Example with two heads 10px apart, beta = 0.3:
//   d = 10  →  σ = 3.0  →  window = 9px each side
//
// Reference: Zhang et al. (2016) MCNN, geometry-adaptive kernels

use anyhow::{bail, Result};
use ndarray::s;
use serde::{Deserialize, Serialize};

use crate::domain::annotation::Point;
use crate::domain::density::DensityMap;
use crate::domain::error::{CrowdError, CrowdResult};

// ─── DensityConfig ────────────────────────────────────────────────────────────
/// Tunables for the kernel bandwidth. All values are in pixels
/// except `beta` (dimensionless) and `truncate` (in units of σ).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensityConfig {
    /// Number of nearest neighbours averaged per point
    pub k: usize,
    /// Slope of the distance → σ map
    pub beta: f32,
    /// Intercept of the distance → σ map
    pub sigma_offset: f32,
    pub sigma_min: f32,
    pub sigma_max: f32,
    /// Kernel half-width in multiples of σ
    pub truncate: f32,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            k: 3,
            beta: 0.3,
            sigma_offset: 0.0,
            sigma_min: 1.0,
            sigma_max: 15.0,
            truncate: 3.0,
        }
    }
}

impl DensityConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            bail!("k must be at least 1");
        }
        if !(self.sigma_min > 0.0 && self.sigma_min.is_finite()) {
            bail!("sigma_min must be positive, got {}", self.sigma_min);
        }
        if !(self.sigma_max >= self.sigma_min && self.sigma_max.is_finite()) {
            bail!(
                "sigma_max ({}) must be finite and >= sigma_min ({})",
                self.sigma_max,
                self.sigma_min
            );
        }
        if !(self.truncate > 0.0 && self.truncate.is_finite()) {
            bail!("truncate must be positive, got {}", self.truncate);
        }
        if !self.beta.is_finite() || !self.sigma_offset.is_finite() {
            bail!("beta and sigma_offset must be finite");
        }
        Ok(())
    }
}

// ─── DensityMapGenerator ──────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct DensityMapGenerator {
    config: DensityConfig,
}

impl DensityMapGenerator {
    /// Fails if the configuration could produce a zero or inverted σ range.
    pub fn new(config: DensityConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DensityConfig {
        &self.config
    }

    /// Per-point kernel bandwidth, in the same order as `points`.
    pub fn bandwidths(&self, points: &[Point]) -> Vec<f32> {
        let cfg = &self.config;
        let mut distances = Vec::with_capacity(points.len().saturating_sub(1));

        points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                distances.clear();
                distances.extend(
                    points
                        .iter()
                        .enumerate()
                        .filter(|&(j, _)| j != i)
                        .map(|(_, q)| p.distance(q)),
                );
                if distances.is_empty() {
                    return cfg.sigma_max;
                }

                let k = cfg.k.min(distances.len());
                if k < distances.len() {
                    distances.select_nth_unstable_by(k - 1, f32::total_cmp);
                }
                let mean = distances[..k].iter().sum::<f32>() / k as f32;
                (cfg.beta * mean + cfg.sigma_offset).clamp(cfg.sigma_min, cfg.sigma_max)
            })
            .collect()
    }

    /// Build the density map for an image of `width x height` pixels.
    ///
    /// Returns `InvalidGeometry` if either dimension is zero. An empty
    /// point set gives an all-zero map.
    pub fn generate(&self, points: &[Point], width: usize, height: usize) -> CrowdResult<DensityMap> {
        if width == 0 || height == 0 {
            return Err(CrowdError::InvalidGeometry { width, height });
        }

        let mut map = DensityMap::zeros(height, width);
        if points.is_empty() {
            return Ok(map);
        }

        let sigmas = self.bandwidths(points);
        let grid = map.as_array_mut();

        for (p, &sigma) in points.iter().zip(&sigmas) {
            let radius = (self.config.truncate * sigma).ceil() as usize;
            let cx = pixel_index(p.x, width);
            let cy = pixel_index(p.y, height);

            let (x0, gx) = kernel_1d(cx, radius, width, sigma);
            let (y0, gy) = kernel_1d(cy, radius, height, sigma);

            let mut window = grid.slice_mut(s![y0..y0 + gy.len(), x0..x0 + gx.len()]);
            for ((dy, dx), cell) in window.indexed_iter_mut() {
                *cell += (gy[dy] * gx[dx]) as f32;
            }
        }

        Ok(map)
    }
}

/// Pixel containing coordinate `v`; the far edge belongs to the last pixel.
fn pixel_index(v: f32, len: usize) -> usize {
    (v.max(0.0).floor() as usize).min(len - 1)
}

/// Normalised 1D Gaussian over `[centre - radius, centre + radius] ∩ [0, len)`.
/// Returns the first index of the window and its weights.
fn kernel_1d(centre: usize, radius: usize, len: usize, sigma: f32) -> (usize, Vec<f64>) {
    let start = centre.saturating_sub(radius);
    let end = (centre + radius).min(len - 1);
    let two_var = 2.0 * (sigma as f64).powi(2);

    let mut weights: Vec<f64> = (start..=end)
        .map(|i| {
            let d = i as f64 - centre as f64;
            (-d * d / two_var).exp()
        })
        .collect();

    let total: f64 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= total);
    (start, weights)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn generator() -> DensityMapGenerator {
        DensityMapGenerator::new(DensityConfig::default()).unwrap()
    }

    fn random_points(n: usize, width: f32, height: f32, seed: u64) -> Vec<Point> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| Point::new(rng.gen_range(0.0..=width), rng.gen_range(0.0..=height)))
            .collect()
    }

    fn assert_mass(map: &DensityMap, expected: usize) {
        let total = map.count();
        let tol = 1e-3 * (expected as f64).max(1.0);
        assert!(
            (total - expected as f64).abs() <= tol,
            "mass {total} != {expected}"
        );
    }

    #[test]
    fn test_empty_annotation_gives_zero_map() {
        let map = generator().generate(&[], 32, 24).unwrap();
        assert_eq!((map.height(), map.width()), (24, 32));
        assert_eq!(map.count(), 0.0);
        assert!(map.as_array().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_zero_dimensions_are_invalid_geometry() {
        let pts = [Point::new(1.0, 1.0)];
        for (w, h) in [(0, 10), (10, 0), (0, 0)] {
            let err = generator().generate(&pts, w, h).unwrap_err();
            assert!(matches!(err, CrowdError::InvalidGeometry { .. }));
        }
    }

    #[test]
    fn test_mass_equals_count_including_borders() {
        let g = generator();
        for (n, seed) in [(1, 1), (5, 2), (40, 3), (300, 4)] {
            let pts = random_points(n, 80.0, 60.0, seed);
            assert_mass(&g.generate(&pts, 80, 60).unwrap(), n);
        }

        // corners and far edges
        let edges = vec![
            Point::new(0.0, 0.0),
            Point::new(80.0, 60.0),
            Point::new(80.0, 0.0),
            Point::new(0.0, 60.0),
        ];
        assert_mass(&g.generate(&edges, 80, 60).unwrap(), 4);
    }

    #[test]
    fn test_mass_holds_across_config_range() {
        let pts = random_points(60, 100.0, 70.0, 9);
        for (k, beta, sigma_min, sigma_max) in
            [(1, 0.1, 0.5, 4.0), (3, 0.3, 1.0, 15.0), (5, 1.0, 2.0, 40.0), (8, 0.05, 0.3, 0.3)]
        {
            let cfg = DensityConfig { k, beta, sigma_min, sigma_max, ..Default::default() };
            let map = DensityMapGenerator::new(cfg).unwrap().generate(&pts, 100, 70).unwrap();
            assert_mass(&map, pts.len());
        }
    }

    #[test]
    fn test_duplicates_and_large_counts() {
        let g = generator();

        let stacked = vec![Point::new(10.0, 10.0); 25];
        let sigmas = g.bandwidths(&stacked);
        assert!(sigmas.iter().all(|&s| s == 1.0));
        assert_mass(&g.generate(&stacked, 20, 20).unwrap(), 25);

        let crowd = random_points(2500, 128.0, 96.0, 77);
        assert_mass(&g.generate(&crowd, 128, 96).unwrap(), 2500);
    }

    #[test]
    fn test_single_point_uses_sigma_max() {
        let sigmas = generator().bandwidths(&[Point::new(5.0, 5.0)]);
        assert_eq!(sigmas, vec![15.0]);
    }

    #[test]
    fn test_fewer_than_k_neighbours_uses_all_available() {
        let pts = [Point::new(0.0, 0.0), Point::new(10.0, 0.0)];
        let sigmas = generator().bandwidths(&pts);
        assert!((sigmas[0] - 3.0).abs() < 1e-5);
        assert!((sigmas[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_clamping_law_as_spacing_grows() {
        let g = generator();
        let cfg = *g.config();
        let mut previous = 0.0f32;

        for spacing in [0.01f32, 0.5, 2.0, 5.0, 10.0, 20.0, 50.0, 200.0, 1000.0] {
            // 4x4 lattice, at least k + 1 points
            let pts: Vec<Point> = (0..16)
                .map(|i| Point::new((i % 4) as f32 * spacing, (i / 4) as f32 * spacing))
                .collect();
            let sigmas = g.bandwidths(&pts);

            for &s in &sigmas {
                assert!(s >= cfg.sigma_min && s <= cfg.sigma_max, "σ={s} at spacing {spacing}");
            }
            let max = sigmas.iter().copied().fold(f32::MIN, f32::max);
            assert!(max >= previous, "σ shrank when spacing grew");
            previous = max;

            if spacing <= 0.5 {
                assert!(sigmas.iter().all(|&s| s == cfg.sigma_min));
            }
            if spacing >= 200.0 {
                assert!(sigmas.iter().all(|&s| s == cfg.sigma_max));
            }
        }
    }

    #[test]
    fn test_three_points_give_three_local_maxima() {
        let pts = vec![Point::new(16.0, 16.0), Point::new(48.0, 16.0), Point::new(32.0, 48.0)];
        let map = generator().generate(&pts, 64, 64).unwrap();
        assert!((map.count() - 3.0).abs() <= 1e-3);

        let grid = map.as_array();
        for p in &pts {
            let (px, py) = (p.x as usize, p.y as usize);
            let mut best = (0usize, 0usize, f32::MIN);
            for y in py.saturating_sub(6)..=(py + 6).min(63) {
                for x in px.saturating_sub(6)..=(px + 6).min(63) {
                    if grid[[y, x]] > best.2 {
                        best = (y, x, grid[[y, x]]);
                    }
                }
            }
            let dy = best.0 as f32 - py as f32;
            let dx = best.1 as f32 - px as f32;
            assert!((dx * dx + dy * dy).sqrt() <= 1.5, "peak for {p:?} at {best:?}");
        }
    }

    #[test]
    fn test_rejects_inverted_sigma_range() {
        let cfg = DensityConfig { sigma_min: 5.0, sigma_max: 2.0, ..Default::default() };
        assert!(DensityMapGenerator::new(cfg).is_err());
        let cfg = DensityConfig { sigma_min: 0.0, ..Default::default() };
        assert!(DensityMapGenerator::new(cfg).is_err());
    }
}
