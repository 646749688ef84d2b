//! Batching with background prefetch.
//!
//! A producer thread assembles batches on a dedicated rayon pool and hands
//! them over a bounded channel; the consumer blocks only when it asks for the
//! next batch.

use crate::error::{TrainingError, TrainingResult};
use crate::sample::SampleSource;
use crossbeam_channel::{bounded, Receiver};
use ndarray::{stack, Array3, Array4, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use std::thread;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub workers: usize,
    /// Reorder samples every epoch. Must be off when output order matters.
    pub shuffle: bool,
    pub seed: u64,
    /// Batches buffered ahead of the consumer.
    pub prefetch: usize,
}

impl LoaderConfig {
    #[must_use]
    pub fn new(batch_size: usize, workers: usize, shuffle: bool, seed: u64) -> Self {
        Self { batch_size, workers, shuffle, seed, prefetch: 2 }
    }
}

/// Stacked samples. `indices` are positions in the source.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array4<f32>,
    pub masks: Option<Array4<f32>>,
    pub indices: Vec<usize>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

pub struct BatchLoader {
    source: Arc<SampleSource>,
    config: LoaderConfig,
    pool: Arc<ThreadPool>,
}

impl BatchLoader {
    pub fn new(source: Arc<SampleSource>, config: LoaderConfig) -> TrainingResult<Self> {
        if config.batch_size == 0 {
            return Err(TrainingError::Configuration("batch size must be >= 1".to_string()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("roadseg-loader-{i}"))
            .build()
            .map_err(|e| TrainingError::Configuration(format!("loader pool: {e}")))?;
        Ok(Self { source, config, pool: Arc::new(pool) })
    }

    /// Number of batches per epoch (the last one may be short).
    #[must_use]
    pub fn len(&self) -> usize {
        self.source.len().div_ceil(self.config.batch_size)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    #[must_use]
    pub fn num_samples(&self) -> usize {
        self.source.len()
    }

    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Sample order for `epoch`: identity, or a seeded shuffle.
    #[must_use]
    pub fn order(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.source.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Starts producing the batches of one epoch.
    #[must_use]
    pub fn epoch(&self, epoch: u64) -> BatchStream {
        let order = self.order(epoch);
        let (tx, rx) = bounded(self.config.prefetch.max(1));
        let source = Arc::clone(&self.source);
        let pool = Arc::clone(&self.pool);
        let batch_size = self.config.batch_size;
        let seed = self.config.seed ^ epoch.rotate_left(32);

        thread::spawn(move || {
            for chunk in order.chunks(batch_size) {
                let batch = pool.install(|| assemble(&source, chunk, seed));
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    break;
                }
            }
        });
        debug!(epoch, batches = self.len(), "Started batch producer");
        BatchStream { rx }
    }
}

/// Per-sample augmentation seed.
fn sample_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn assemble(source: &SampleSource, chunk: &[usize], seed: u64) -> TrainingResult<Batch> {
    let mut loaded: Vec<_> = chunk
        .par_iter()
        .enumerate()
        .map(|(slot, &idx)| {
            let mut rng = StdRng::seed_from_u64(sample_seed(seed, idx));
            (slot, source.get(idx, &mut rng))
        })
        .collect();
    loaded.sort_by_key(|(slot, _)| *slot);

    let mut images: Vec<Array3<f32>> = Vec::with_capacity(chunk.len());
    let mut masks: Vec<Array3<f32>> = Vec::new();
    for (_, sample) in loaded {
        let sample = sample?;
        images.push(sample.image);
        if let Some(mask) = sample.mask {
            masks.push(mask);
        }
    }
    if !masks.is_empty() && masks.len() != images.len() {
        return Err(TrainingError::DataIntegrity("batch mixes samples with and without masks".into()));
    }

    Ok(Batch {
        images: stack_samples(&images)?,
        masks: if masks.is_empty() { None } else { Some(stack_samples(&masks)?) },
        indices: chunk.to_vec(),
    })
}

fn stack_samples(samples: &[Array3<f32>]) -> TrainingResult<Array4<f32>> {
    let views: Vec<ArrayView3<'_, f32>> = samples.iter().map(|s| s.view()).collect();
    stack(Axis(0), &views).map_err(|e| {
        TrainingError::ShapeMismatch(format!("samples in a batch differ in shape: {e}"))
    })
}

/// Batches of one epoch, in production order.
pub struct BatchStream {
    rx: Receiver<TrainingResult<Batch>>,
}

impl Iterator for BatchStream {
    type Item = TrainingResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}
