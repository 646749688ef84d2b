//! Roadseg Training
//!
//! The training core for satellite road segmentation:
//! - Inventory tables, presets and sites (`InventoryCatalog`, `PresetRegistry`, `SiteScope`)
//! - Dataset selection and stratified splitting (`DatasetSelector`, `stratified_split`)
//! - Sample decoding, augmentation and prefetching batches (`SampleSource`, `BatchLoader`)
//! - The composite loss, optimizers and the plateau scheduler
//! - The epoch loop with checkpoints, metrics and prediction output (`TrainingLoop`)

pub mod artifacts;
pub mod augment;
pub mod catalog;
pub mod checkpoint;
pub mod error;
pub mod job;
pub mod layout;
pub mod loader;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod predict;
pub mod preset;
pub mod sample;
pub mod scheduler;
pub mod selector;
pub mod sites;
pub mod split;
pub mod trainer;

pub use artifacts::{make_artifact, sha256_file, ArtifactKind, EpochRecord, RunArtifact, RunManifest};
pub use augment::{Augmentation, ResizeAugmentation, Transformed};
pub use catalog::{InventoryCatalog, InventoryTables, JoinedRecord, LineCounts, MaskRecord, TileRecord};
pub use checkpoint::{load_checkpoint, Checkpoint, CheckpointStore, INITIAL_BEST_LOSS};
pub use error::{TrainingError, TrainingResult};
pub use job::{HyperParams, RunId, RunMode, RunSpec};
pub use layout::RunLayout;
pub use loader::{Batch, BatchLoader, BatchStream, LoaderConfig};
pub use loss::{overlap, overlap_thresholded, CompositeLoss, LossKind, LossOutput};
pub use metrics::{FileMetricsSink, MetricsSink, NullMetricsSink, RunningMetric, TracingMetricsSink};
pub use optim::{build_optimizer, Adam, Optimizer, RmsProp};
pub use predict::PredictionWriter;
pub use preset::{Preset, PresetRegistry};
pub use sample::{ImageDecoder, ImageFileDecoder, SampleSource};
pub use scheduler::{LrScheduler, ReduceLrOnPlateau};
pub use selector::{
    CatalogPairing, DataRoots, DatasetSelector, MaskVariant, SelectedSample, Selection, SelectionMode,
};
pub use sites::{Site, SiteScope, SITES};
pub use split::{split_samples, stratified_split, SplitIndices};
pub use trainer::{BestTracker, FitPlan, LoopOptions, RunContext, TrainingLoop, ValidationSummary};
