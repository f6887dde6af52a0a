// ============================================================
// Layer 4 — Processed Dataset
// ============================================================
// Serves (image, density map) samples out of the processed
// store through burn's Dataset trait. Nothing is cached: each
// `get` decodes the source image and reads the .npy map, which
// keeps memory flat and lets the loader pool do the work in
// parallel.
//
// A sample that cannot be loaded (image gone, shape drift) is
// logged and skipped; it never aborts the epoch.
//
// Reference: Burn Book §4 (Datasets)

use anyhow::Result;
use burn::data::dataset::Dataset;
use std::path::{Path, PathBuf};

use crate::domain::error::{CrowdError, CrowdResult};
use crate::domain::image::CrowdImage;
use crate::domain::sample::Sample;
use crate::infra::store::{ProcessedStore, SampleRecord};

/// Decode an image file into a [3, H, W] tensor with values in [0, 1].
pub fn load_image(path: &Path) -> CrowdResult<CrowdImage> {
    let rgb = image::open(path)
        .map_err(|source| CrowdError::Image { path: path.to_path_buf(), source })?
        .to_rgb8();
    let (w, h) = rgb.dimensions();

    Ok(CrowdImage::from_fn(h as usize, w as usize, |(c, y, x)| {
        rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    }))
}

pub struct ProcessedDataset {
    store: ProcessedStore,
    records: Vec<SampleRecord>,
}

impl ProcessedDataset {
    /// Index every readable sample under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = ProcessedStore::new(root);
        let mut records = Vec::new();

        for id in store.ids()? {
            match store.read_record(&id) {
                Ok(rec) => records.push(rec),
                Err(e) => tracing::warn!("Skipping processed sample '{id}': {e}"),
            }
        }

        tracing::info!(
            "Opened processed dataset '{}' with {} samples",
            store.root().display(),
            records.len()
        );
        Ok(Self { store, records })
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn load(&self, index: usize) -> CrowdResult<Option<Sample>> {
        let Some(rec) = self.records.get(index) else {
            return Ok(None);
        };

        let density = self.store.read_density(rec)?;
        let image = load_image(&rec.image)?;
        if (image.height(), image.width()) != (rec.height, rec.width) {
            return Err(CrowdError::Store {
                path: rec.image.clone(),
                reason: format!(
                    "image is {}x{} but was processed as {}x{}",
                    image.width(),
                    image.height(),
                    rec.width,
                    rec.height
                ),
            });
        }

        Ok(Some(Sample::new(rec.id.clone(), image, density)))
    }
}

impl Dataset<Sample> for ProcessedDataset {
    fn get(&self, index: usize) -> Option<Sample> {
        self.load(index).unwrap_or_else(|e| {
            let id = self.records.get(index).map(|r| r.id.as_str()).unwrap_or("?");
            tracing::warn!("Skipping sample '{id}': {e}");
            None
        })
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::density::DensityMap;

    fn write_png(path: &Path, w: u32, h: u32) {
        image::RgbImage::from_fn(w, h, |x, _| image::Rgb([if x == 0 { 255 } else { 0 }, 0, 0]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_loads_sample_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("a.png");
        write_png(&img_path, 5, 4);

        let store = ProcessedStore::new(dir.path().join("processed"));
        let mut density = DensityMap::zeros(4, 5);
        density.as_array_mut()[[2, 2]] = 1.0;
        let rec = SampleRecord { id: "a".into(), image: img_path, width: 5, height: 4, count: 1 };
        store.write(&rec, &density).unwrap();

        let ds = ProcessedDataset::open(dir.path().join("processed")).unwrap();
        assert_eq!(ds.len(), 1);
        let s = ds.get(0).unwrap();
        assert_eq!(s.dims(), (4, 5));
        assert_eq!(s.image.as_array()[[0, 0, 0]], 1.0);
        assert_eq!(s.image.as_array()[[0, 0, 1]], 0.0);
        assert!((s.count() - 1.0).abs() < 1e-6);
        assert!(ds.get(1).is_none());
    }

    #[test]
    fn test_missing_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProcessedStore::new(dir.path());
        let rec = SampleRecord {
            id: "gone".into(),
            image: dir.path().join("nope.png"),
            width: 2,
            height: 2,
            count: 0,
        };
        store.write(&rec, &DensityMap::zeros(2, 2)).unwrap();

        let ds = ProcessedDataset::open(dir.path()).unwrap();
        assert_eq!(ds.len(), 1);
        assert!(ds.get(0).is_none());
        assert!(matches!(ds.load(0), Err(CrowdError::Image { .. })));
    }
}
