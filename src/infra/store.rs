// ============================================================
// Layer 6 — Processed Sample Store
// ============================================================
// One directory per sample, keyed by the original image id:
//
//   processed/
//     IMG_1/
//       density.npy   ← f32 [height, width], sums to the head count
//       sample.json   ← id, source image path, width, height, count
//     IMG_2/
//       ...
//
// Writes go to a hidden staging directory that is renamed into
// place once both files are complete, so a failed or interrupted
// sample never shows up half-written. `remove` drops one sample,
// `clean` removes everything.
//
// Reference: ndarray-npy (write_npy / read_npy)

use anyhow::{Context, Result};
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::domain::density::DensityMap;
use crate::domain::error::{CrowdError, CrowdResult};

const DENSITY_FILE: &str = "density.npy";
const RECORD_FILE: &str = "sample.json";
const STAGING_PREFIX: &str = ".staging-";

/// Metadata stored next to each density map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SampleRecord {
    pub id: String,
    /// Source raster the density map was generated for
    pub image: PathBuf,
    pub width: usize,
    pub height: usize,
    /// Number of annotated heads
    pub count: usize,
}

pub struct ProcessedStore {
    root: PathBuf,
}

impl ProcessedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    fn sample_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Persist one sample atomically, replacing any previous version.
    pub fn write(&self, record: &SampleRecord, density: &DensityMap) -> CrowdResult<PathBuf> {
        if (density.height(), density.width()) != (record.height, record.width) {
            return Err(CrowdError::Store {
                path: self.sample_dir(&record.id),
                reason: format!(
                    "density is {}x{} but record says {}x{}",
                    density.width(),
                    density.height(),
                    record.width,
                    record.height
                ),
            });
        }

        fs::create_dir_all(&self.root).map_err(|e| CrowdError::io(&self.root, e))?;

        let staging = self.root.join(format!("{STAGING_PREFIX}{}", record.id));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| CrowdError::io(&staging, e))?;
        }
        fs::create_dir(&staging).map_err(|e| CrowdError::io(&staging, e))?;

        let npy_path = staging.join(DENSITY_FILE);
        write_npy(&npy_path, density.as_array()).map_err(|e| CrowdError::Store {
            path: npy_path.clone(),
            reason: e.to_string(),
        })?;

        let json_path = staging.join(RECORD_FILE);
        let json = serde_json::to_string_pretty(record).map_err(|e| CrowdError::Store {
            path: json_path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&json_path, json).map_err(|e| CrowdError::io(&json_path, e))?;

        let target = self.sample_dir(&record.id);
        if target.exists() {
            fs::remove_dir_all(&target).map_err(|e| CrowdError::io(&target, e))?;
        }
        fs::rename(&staging, &target).map_err(|e| CrowdError::io(&target, e))?;

        tracing::debug!("Stored sample '{}' ({} heads)", record.id, record.count);
        Ok(target)
    }

    /// Drop one sample. Returns false if it was not stored.
    pub fn remove(&self, id: &str) -> CrowdResult<bool> {
        let dir = self.sample_dir(id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).map_err(|e| CrowdError::io(&dir, e))?;
        Ok(true)
    }

    pub fn read_record(&self, id: &str) -> CrowdResult<SampleRecord> {
        let path = self.sample_dir(id).join(RECORD_FILE);
        let json = fs::read_to_string(&path).map_err(|e| CrowdError::io(&path, e))?;
        serde_json::from_str(&json)
            .map_err(|e| CrowdError::Store { path, reason: e.to_string() })
    }

    /// Load a density map and check it against the record's geometry.
    pub fn read_density(&self, record: &SampleRecord) -> CrowdResult<DensityMap> {
        let path = self.sample_dir(&record.id).join(DENSITY_FILE);
        let grid: Array2<f32> = read_npy(&path)
            .map_err(|e| CrowdError::Store { path: path.clone(), reason: e.to_string() })?;

        if grid.dim() != (record.height, record.width) {
            return Err(CrowdError::Store {
                path,
                reason: format!(
                    "array shape {:?} does not match {}x{}",
                    grid.dim(),
                    record.width,
                    record.height
                ),
            });
        }
        Ok(DensityMap::from_array(grid))
    }

    /// Ids of all completed samples, sorted. Staging leftovers are ignored.
    pub fn ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.root).with_context(|| {
            format!(
                "Cannot read processed store '{}'. Have you run 'preprocess'?",
                self.root.display()
            )
        })?;

        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !path.join(RECORD_FILE).is_file() {
                continue;
            }
            ids.push(name.to_string());
        }

        ids.sort();
        Ok(ids)
    }

    /// Remove the whole store. Returns false if there was nothing to remove.
    pub fn clean(&self) -> Result<bool> {
        if !self.root.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&self.root)
            .with_context(|| format!("Cannot remove '{}'", self.root.display()))?;
        tracing::info!("Removed processed store '{}'", self.root.display());
        Ok(true)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, width: usize, height: usize) -> SampleRecord {
        SampleRecord { id: id.into(), image: PathBuf::from("img.png"), width, height, count: 2 }
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProcessedStore::new(dir.path().join("processed"));

        let mut density = DensityMap::zeros(3, 4);
        density.as_array_mut()[[1, 2]] = 1.25;
        density.as_array_mut()[[2, 3]] = 0.75;
        let rec = record("IMG_1", 4, 3);
        store.write(&rec, &density).unwrap();

        assert_eq!(store.ids().unwrap(), vec!["IMG_1".to_string()]);
        let back = store.read_record("IMG_1").unwrap();
        assert_eq!(back, rec);
        assert_eq!(store.read_density(&back).unwrap(), density);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProcessedStore::new(dir.path());
        let err = store.write(&record("bad", 5, 5), &DensityMap::zeros(2, 2)).unwrap_err();
        assert!(matches!(err, CrowdError::Store { .. }));
        assert!(store.ids().unwrap().is_empty());
    }

    #[test]
    fn test_staging_leftovers_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProcessedStore::new(dir.path());
        fs::create_dir_all(dir.path().join(".staging-half")).unwrap();
        fs::write(dir.path().join(".staging-half").join(RECORD_FILE), "{}").unwrap();
        store.write(&record("ok", 1, 1), &DensityMap::zeros(1, 1)).unwrap();
        assert_eq!(store.ids().unwrap(), vec!["ok".to_string()]);
    }

    #[test]
    fn test_remove_single_sample() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProcessedStore::new(dir.path());
        store.write(&record("a", 1, 1), &DensityMap::zeros(1, 1)).unwrap();
        store.write(&record("b", 1, 1), &DensityMap::zeros(1, 1)).unwrap();

        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert_eq!(store.ids().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_clean_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProcessedStore::new(dir.path().join("processed"));
        store.write(&record("a", 1, 1), &DensityMap::zeros(1, 1)).unwrap();

        assert!(store.clean().unwrap());
        assert!(!store.exists());
        assert!(!store.clean().unwrap());
    }
}
