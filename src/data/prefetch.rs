// ============================================================
// Layer 4 — Prefetching Data Pipeline
// ============================================================
// Producer / consumer with a bounded queue:
//
//   producer thread                       trainer
//   ───────────────                       ───────
//   for each batch of indices:
//     load + transform items   ──► [ bounded(prefetch) ] ──► next()
//     in parallel on the pool
//
// When the queue is full the producer blocks in `send`, so at
// most `prefetch` finished batches (plus the one being built)
// sit in memory. Batches come out in epoch order no matter how
// the workers are scheduled.
//
// Every batch position is sent, including ones where no item
// could be loaded, so `consumed()` counts positions the same
// way `batches_per_epoch()` does.
//
// Dropping a BatchStream closes the receiving end; the producer
// notices on its next send, stops, and is joined.
//
// Reference: crossbeam-channel (bounded), rayon (ThreadPool)

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use crossbeam_channel::{bounded, Receiver};
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, thread::JoinHandle};

use crate::data::augment::{item_rng, TransformPipeline};
use crate::data::batcher::SampleBatch;
use crate::domain::sample::Sample;
use crate::domain::traits::Transform;

// ─── PipelineConfig ───────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub batch_size: usize,
    /// Reshuffle every epoch; off for evaluation
    pub shuffle: bool,
    /// Square random crop side, None to keep full images
    pub crop_size: Option<usize>,
    pub flip_probability: f64,
    /// Applied identically to image and density map
    pub downsample: usize,
    /// Loader threads
    pub workers: usize,
    /// Finished batches allowed to wait in the queue
    pub prefetch: usize,
    pub drop_last: bool,
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            shuffle: true,
            crop_size: Some(256),
            flip_probability: 0.5,
            downsample: 1,
            workers: 4,
            prefetch: 2,
            drop_last: false,
            seed: 42,
        }
    }
}

impl PipelineConfig {
    /// Full images, one per batch, fixed order, no augmentation.
    pub fn evaluation(downsample: usize, workers: usize) -> Self {
        Self {
            batch_size: 1,
            shuffle: false,
            crop_size: None,
            flip_probability: 0.0,
            downsample,
            workers,
            prefetch: 2,
            drop_last: false,
            seed: 0,
        }
    }

    pub fn transforms(&self) -> TransformPipeline {
        match (self.crop_size, self.flip_probability > 0.0) {
            (None, false) => TransformPipeline::evaluation(self.downsample),
            (crop, _) => TransformPipeline::training(
                crop.map(|s| (s, s)),
                self.flip_probability,
                self.downsample,
            ),
        }
    }
}

// ─── DataPipeline ─────────────────────────────────────────────────────────────
pub struct DataPipeline {
    dataset: Arc<dyn Dataset<Sample>>,
    transforms: TransformPipeline,
    config: PipelineConfig,
    pool: Arc<rayon::ThreadPool>,
}

impl DataPipeline {
    pub fn new(dataset: Arc<dyn Dataset<Sample>>, config: PipelineConfig) -> Result<Self> {
        anyhow::ensure!(config.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(config.downsample > 0, "downsample factor must be positive");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("loader-{i}"))
            .build()
            .context("Failed to start loader thread pool")?;

        Ok(Self {
            dataset,
            transforms: config.transforms(),
            config,
            pool: Arc::new(pool),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.len() == 0
    }

    pub fn batches_per_epoch(&self) -> usize {
        let (n, bs) = (self.len(), self.config.batch_size);
        if self.config.drop_last {
            n / bs
        } else {
            n.div_ceil(bs)
        }
    }

    /// Dataset indices in the order `epoch` will visit them.
    pub fn order(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        if self.config.shuffle {
            indices.shuffle(&mut item_rng(self.config.seed, epoch, usize::MAX));
        }
        indices
    }

    pub fn epoch(&self, epoch: usize) -> Result<BatchStream> {
        self.epoch_from(epoch, 0)
    }

    /// Same batches as `epoch(epoch)` minus the first `skip_batches`.
    /// Used to resume an interrupted epoch.
    pub fn epoch_from(&self, epoch: usize, skip_batches: usize) -> Result<BatchStream> {
        let (sender, receiver) = bounded::<(usize, Option<SampleBatch>)>(self.config.prefetch.max(1));

        let order = self.order(epoch);
        let dataset = Arc::clone(&self.dataset);
        let pool = Arc::clone(&self.pool);
        let transforms = self.transforms.clone();
        let batch_size = self.config.batch_size;
        let drop_last = self.config.drop_last;
        let seed = self.config.seed;

        let producer = std::thread::Builder::new()
            .name(format!("batch-producer-{epoch}"))
            .spawn(move || {
                for (b, chunk) in order.chunks(batch_size).enumerate().skip(skip_batches) {
                    if drop_last && chunk.len() < batch_size {
                        break;
                    }

                    let items: Vec<Sample> = pool.install(|| {
                        chunk
                            .par_iter()
                            .enumerate()
                            .filter_map(|(i, &index)| {
                                let sample = dataset.get(index)?;
                                let mut rng = item_rng(seed, epoch, b * batch_size + i);
                                Some(transforms.apply(sample, &mut rng))
                            })
                            .collect()
                    });

                    let batch = SampleBatch::from_samples(items);
                    if batch.is_none() {
                        tracing::warn!("Epoch {epoch}: batch {b} had no loadable samples");
                    }
                    if sender.send((b, batch)).is_err() {
                        tracing::debug!("Batch stream dropped, producer for epoch {epoch} stops");
                        break;
                    }
                }
            })
            .context("Failed to spawn batch producer")?;

        Ok(BatchStream { receiver: Some(receiver), producer: Some(producer), consumed: skip_batches })
    }
}

// ─── BatchStream ──────────────────────────────────────────────────────────────
/// One epoch's batches, in order. Blocks while the producer catches up.
/// Positions whose items all failed to load are passed over.
pub struct BatchStream {
    receiver: Option<Receiver<(usize, Option<SampleBatch>)>>,
    producer: Option<JoinHandle<()>>,
    consumed: usize,
}

impl BatchStream {
    /// Batch positions of this epoch used up so far, yielded or not.
    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

impl Iterator for BatchStream {
    type Item = SampleBatch;

    fn next(&mut self) -> Option<SampleBatch> {
        loop {
            let (position, batch) = self.receiver.as_ref()?.recv().ok()?;
            self.consumed = position + 1;
            if batch.is_some() {
                return batch;
            }
        }
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        // Receiver first, so a producer blocked in send() wakes up
        drop(self.receiver.take());
        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                tracing::error!("Batch producer thread panicked");
            }
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{density::DensityMap, image::CrowdImage};
    use burn::data::dataset::InMemDataset;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 8x8 samples whose single pixel of mass encodes the index.
    pub(crate) fn numbered_samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let mut density = DensityMap::zeros(8, 8);
                density.as_array_mut()[[i % 8, (i / 8) % 8]] = 1.0;
                Sample::new(format!("s{i:03}"), CrowdImage::filled(8, 8, i as f32 / n as f32), density)
            })
            .collect()
    }

    fn config(batch_size: usize, shuffle: bool) -> PipelineConfig {
        PipelineConfig {
            batch_size,
            shuffle,
            crop_size: None,
            flip_probability: 0.0,
            downsample: 1,
            workers: 3,
            prefetch: 1,
            drop_last: false,
            seed: 7,
        }
    }

    fn pipeline(n: usize, cfg: PipelineConfig) -> DataPipeline {
        DataPipeline::new(Arc::new(InMemDataset::new(numbered_samples(n))), cfg).unwrap()
    }

    fn ids(stream: BatchStream) -> Vec<String> {
        stream.flat_map(|b| b.ids).collect()
    }

    #[test]
    fn test_unshuffled_epoch_is_in_order() {
        let p = pipeline(10, config(3, false));
        assert_eq!(p.batches_per_epoch(), 4);
        let batches: Vec<SampleBatch> = p.epoch(0).unwrap().collect();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[3].len(), 1);
        let expected: Vec<String> = (0..10).map(|i| format!("s{i:03}")).collect();
        assert_eq!(batches.into_iter().flat_map(|b| b.ids).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_shuffle_is_per_epoch_and_reproducible() {
        let p = pipeline(20, config(4, true));
        let e0 = ids(p.epoch(0).unwrap());
        let e0_again = ids(p.epoch(0).unwrap());
        let e1 = ids(p.epoch(1).unwrap());

        assert_eq!(e0, e0_again);
        assert_ne!(e0, e1);

        let mut sorted = e1.clone();
        sorted.sort();
        let expected: Vec<String> = (0..20).map(|i| format!("s{i:03}")).collect();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_resume_skips_consumed_batches() {
        let p = pipeline(17, config(4, true));
        let full: Vec<Vec<String>> = p.epoch(3).unwrap().map(|b| b.ids).collect();
        let resumed: Vec<Vec<String>> = p.epoch_from(3, 2).unwrap().map(|b| b.ids).collect();
        assert_eq!(resumed, full[2..].to_vec());
    }

    #[test]
    fn test_drop_last() {
        let mut cfg = config(4, false);
        cfg.drop_last = true;
        let p = pipeline(10, cfg);
        assert_eq!(p.batches_per_epoch(), 2);
        assert_eq!(p.epoch(0).unwrap().count(), 2);
    }

    /// Items whose index is listed come back as unloadable.
    struct Holes {
        inner: InMemDataset<Sample>,
        missing: Vec<usize>,
    }

    impl Dataset<Sample> for Holes {
        fn get(&self, index: usize) -> Option<Sample> {
            if self.missing.contains(&index) {
                return None;
            }
            self.inner.get(index)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    #[test]
    fn test_unloadable_batches_still_count_as_consumed() {
        let ds = Holes { inner: InMemDataset::new(numbered_samples(8)), missing: vec![2, 3, 6, 7] };
        let p = DataPipeline::new(Arc::new(ds), config(2, false)).unwrap();
        assert_eq!(p.batches_per_epoch(), 4);

        let mut stream = p.epoch(0).unwrap();
        assert_eq!(stream.next().unwrap().ids, vec!["s000", "s001"]);
        assert_eq!(stream.consumed(), 1);
        // position 1 is empty and skipped
        assert_eq!(stream.next().unwrap().ids, vec!["s004", "s005"]);
        assert_eq!(stream.consumed(), 3);
        // the trailing empty position is still accounted for
        assert!(stream.next().is_none());
        assert_eq!(stream.consumed(), 4);

        let resumed = p.epoch_from(0, 2).unwrap();
        assert_eq!(resumed.consumed(), 2);
    }

    struct CountingDataset {
        inner: InMemDataset<Sample>,
        loads: Arc<AtomicUsize>,
    }

    impl Dataset<Sample> for CountingDataset {
        fn get(&self, index: usize) -> Option<Sample> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(index)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    #[test]
    fn test_producer_is_bounded_by_queue_depth() {
        let loads = Arc::new(AtomicUsize::new(0));
        let ds = CountingDataset {
            inner: InMemDataset::new(numbered_samples(64)),
            loads: Arc::clone(&loads),
        };
        let cfg = config(2, false);
        let p = DataPipeline::new(Arc::new(ds), cfg.clone()).unwrap();

        let mut stream = p.epoch(0).unwrap();
        assert!(stream.next().is_some());
        std::thread::sleep(Duration::from_millis(200));

        // consumed + queued + the one blocked in send()
        let bound = (1 + cfg.prefetch + 1) * cfg.batch_size;
        assert!(loads.load(Ordering::SeqCst) <= bound);

        // dropping mid-epoch must not hang
        drop(stream);
        assert!(loads.load(Ordering::SeqCst) < 64);
    }

    #[test]
    fn test_transforms_apply_to_every_item() {
        let mut cfg = config(2, false);
        cfg.downsample = 2;
        let p = pipeline(4, cfg);
        for batch in p.epoch(0).unwrap() {
            assert_eq!((batch.height, batch.width), (4, 4));
            for c in batch.counts {
                assert!((c - 1.0).abs() < 1e-6);
            }
        }
    }
}
