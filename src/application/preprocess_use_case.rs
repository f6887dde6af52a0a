// ============================================================
// Layer 2 — PreprocessUseCase / CleanUseCase
// ============================================================
// Turns a raw ShanghaiTech-style dataset into the processed
// sample store the training pipeline reads:
//
//   Step 1: List image ids                (Layer 4 - data)
//   Step 2: Per id, in parallel:
//             load points + geometry      (Layer 4 - data)
//             generate the density map    (Layer 4 - data)
//             write density.npy + json    (Layer 6 - infra)
//   Step 3: Summarise processed / skipped
//
// A missing or corrupt annotation, or an unreadable image, only
// costs that one sample: it is logged, skipped, and any copy a
// previous run left in the store is removed. Failing to write
// the store itself aborts the run.
//
// `clean` removes processed stores wholesale.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::data::{
    density::{DensityConfig, DensityMapGenerator},
    loader::AnnotationLoader,
};
use crate::domain::error::CrowdResult;
use crate::domain::traits::AnnotationSource;
use crate::infra::store::{ProcessedStore, SampleRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Raw dataset root holding images/ and ground-truth/
    pub raw_dir: PathBuf,
    /// Processed store to create
    pub out_dir: PathBuf,
    pub density: DensityConfig,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreprocessSummary {
    pub processed: Vec<String>,
    /// (id, reason) for every sample left out
    pub skipped: Vec<(String, String)>,
}

pub struct PreprocessUseCase {
    config: PreprocessConfig,
}

impl PreprocessUseCase {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<PreprocessSummary> {
        let cfg = &self.config;
        let generator = DensityMapGenerator::new(cfg.density)?;
        let loader = AnnotationLoader::new(&cfg.raw_dir);
        let store = ProcessedStore::new(&cfg.out_dir);

        // ── Step 1: List ids ──────────────────────────────────────────────────
        let ids = loader.image_ids()?;
        tracing::info!(
            "Preprocessing {} images from '{}' into '{}'",
            ids.len(),
            cfg.raw_dir.display(),
            cfg.out_dir.display()
        );
        tracing::debug!("Density kernel: {:?}", generator.config());

        // ── Step 2: Generate and store, one sample per task ───────────────────
        // collect() keeps id order regardless of which worker finished first
        let results: Vec<(String, CrowdResult<usize>)> = ids
            .par_iter()
            .map(|id| (id.clone(), process_one(&loader, &generator, &store, id)))
            .collect();

        // ── Step 3: Summarise ─────────────────────────────────────────────────
        let mut summary = PreprocessSummary::default();
        for (id, result) in results {
            match result {
                Ok(count) => {
                    tracing::debug!("'{id}': {count} heads");
                    summary.processed.push(id);
                }
                Err(e) if e.is_per_sample() => {
                    tracing::warn!("Skipping sample '{id}': {e}");
                    // an earlier run may have stored this id
                    if store.remove(&id)? {
                        tracing::warn!("Removed stale processed copy of '{id}'");
                    }
                    summary.skipped.push((id, e.to_string()));
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Preprocessing aborted at sample '{id}'"));
                }
            }
        }

        tracing::info!(
            "Preprocessing done: {} processed, {} skipped",
            summary.processed.len(),
            summary.skipped.len()
        );
        Ok(summary)
    }
}

fn process_one(
    loader: &AnnotationLoader,
    generator: &DensityMapGenerator,
    store: &ProcessedStore,
    id: &str,
) -> CrowdResult<usize> {
    let annotated = loader.load(id)?;
    let density = generator.generate(&annotated.annotation.points, annotated.width, annotated.height)?;

    // the record outlives the working directory the command ran from
    let image = std::fs::canonicalize(&annotated.image_path).unwrap_or(annotated.image_path);
    let record = SampleRecord {
        id: annotated.id,
        image,
        width: annotated.width,
        height: annotated.height,
        count: annotated.annotation.count(),
    };
    store.write(&record, &density)?;
    Ok(record.count)
}

// ─── CleanUseCase ─────────────────────────────────────────────────────────────
pub struct CleanUseCase {
    dirs: Vec<PathBuf>,
}

impl CleanUseCase {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Returns how many of the stores actually existed.
    pub fn execute(&self) -> Result<usize> {
        let mut removed = 0;
        for dir in &self.dirs {
            if ProcessedStore::new(dir).clean()? {
                removed += 1;
            } else {
                tracing::info!("Nothing to clean at '{}'", dir.display());
            }
        }
        Ok(removed)
    }
}
