//! Resolves flags and config into a validated run, and builds its parts.

use crate::config::RunConfig;
use crate::{Args, MetricsTarget};
use anyhow::{bail, Context, Result};
use roadseg_models::{ArchitectureRegistry, ModelOptions};
use roadseg_training::{
    build_optimizer, load_checkpoint, BatchLoader, CompositeLoss, DataRoots, DatasetSelector,
    FileMetricsSink, ImageFileDecoder, InventoryCatalog, LoaderConfig, LoopOptions, LossKind,
    MetricsSink, NullMetricsSink, Preset, ResizeAugmentation, RunId, RunLayout, RunMode, RunSpec,
    SampleSource, SelectedSample, Selection, SiteScope, TracingMetricsSink, TrainingLoop,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct RunSetup {
    pub spec: RunSpec,
    pub config: RunConfig,
    pub preset: Preset,
    pub scope: SiteScope,
    pub registry: ArchitectureRegistry,
    pub layout: RunLayout,
    pub resume: Option<PathBuf>,
    pub metrics: MetricsTarget,
}

impl RunSetup {
    /// Merges flags over the config file and validates every name before
    /// any data is read.
    pub fn resolve(args: &Args, config: RunConfig) -> Result<Self> {
        let mode = if args.evaluate {
            RunMode::Evaluate
        } else if args.predict {
            RunMode::Predict
        } else if args.predict_train {
            RunMode::PredictTrain
        } else {
            RunMode::Train
        };

        let mut hyper = config.training.clone();
        if let Some(optimizer) = &args.optimizer {
            hyper.optimizer.clone_from(optimizer);
        }
        if let Some(epochs) = args.epochs {
            hyper.epochs = epochs;
        }
        if let Some(start_epoch) = args.start_epoch {
            hyper.start_epoch = start_epoch;
        }
        if let Some(batch_size) = args.batch_size {
            hyper.batch_size = batch_size;
        }
        if let Some(lr) = args.lr {
            hyper.learning_rate = lr;
        }
        if let Some(workers) = args.workers {
            hyper.workers = workers;
        }
        if let Some(print_freq) = args.print_freq {
            hyper.print_freq = print_freq;
        }
        if let Some(seed) = args.seed {
            hyper.seed = seed;
        }
        if let Some(imsize) = args.imsize {
            hyper.image_size = imsize;
        }
        hyper.augment |= args.augs;
        hyper.log_images |= args.log_images;

        let spec = RunSpec {
            run_id: args.run_id.clone().map_or_else(RunId::new, RunId::from),
            mode,
            preset: args.preset.clone(),
            city: args.city.clone(),
            arch: args.arch.clone(),
            mask_variant: args.mask_variant.parse()?,
            loss: LossKind::parse(&args.loss, args.dice_weight)?,
            hyperparams: hyper,
        };
        spec.validate()?;

        let preset = config.preset_registry()?.get(&spec.preset)?.clone();
        let scope = SiteScope::parse(&spec.city)?;
        let registry = ArchitectureRegistry::builtin();
        registry.resolve(&spec.arch)?;
        build_optimizer(&spec.hyperparams.optimizer, spec.hyperparams.learning_rate)?;

        let output_root = &config.data.output_root;
        let layout = RunLayout::new(
            output_root.join("weights"),
            output_root.join("logs"),
            config.data.prediction_root(),
        );

        info!(
            run_id = %spec.run_id,
            mode = ?spec.mode,
            preset = %spec.preset,
            city = %scope,
            arch = %spec.arch,
            loss = %spec.loss,
            "Resolved run"
        );
        Ok(Self {
            spec,
            config,
            preset,
            scope,
            registry,
            layout,
            resume: args.resume.clone(),
            metrics: args.metrics,
        })
    }

    /// Samples for the current mode.
    pub fn select(&self) -> Result<Selection> {
        let catalog = InventoryCatalog::new(self.config.data.tables());
        let roots = DataRoots {
            train_root: self.config.data.train_root.clone(),
            test_root: self.config.data.test_root.clone(),
        };
        let selection = DatasetSelector::new(&catalog, roots)
            .select(self.spec.mode.selection_mode(), &self.preset, &self.scope, self.spec.mask_variant)
            .context("Failed to select dataset")?;
        if selection.is_empty() {
            bail!("No tiles match preset '{}' and city '{}'", self.spec.preset, self.scope);
        }
        Ok(selection)
    }

    pub fn source(&self, samples: &[SelectedSample], with_masks: bool, flips: bool) -> Result<Arc<SampleSource>> {
        let images = samples.iter().map(|s| s.image_path.clone()).collect();
        let masks = if with_masks {
            let masks: Option<Vec<PathBuf>> = samples.iter().map(|s| s.mask_path.clone()).collect();
            Some(masks.context("Selected samples have no mask paths")?)
        } else {
            None
        };
        let augmentation = ResizeAugmentation::new(self.spec.hyperparams.image_size, flips)?;
        let source = SampleSource::new(
            self.preset.clone(),
            images,
            masks,
            Arc::new(ImageFileDecoder),
            Arc::new(augmentation),
        )?;
        Ok(Arc::new(source))
    }

    pub fn loader(&self, source: Arc<SampleSource>, shuffle: bool) -> Result<BatchLoader> {
        let hyper = &self.spec.hyperparams;
        let config = LoaderConfig::new(hyper.batch_size, hyper.workers, shuffle, hyper.seed);
        Ok(BatchLoader::new(source, config)?)
    }

    fn sink(&self) -> Result<Arc<dyn MetricsSink>> {
        Ok(match self.metrics {
            MetricsTarget::None => Arc::new(NullMetricsSink),
            MetricsTarget::Log => Arc::new(TracingMetricsSink),
            MetricsTarget::File => {
                let dir = self.layout.log_dir(&self.spec.run_id);
                Arc::new(FileMetricsSink::new(dir, self.spec.mode == RunMode::Train)?)
            }
        })
    }

    pub fn build_loop(&self) -> Result<TrainingLoop> {
        let options = ModelOptions {
            in_channels: self.preset.input_channels(),
            output: self.spec.loss.output_kind(),
            seed: self.spec.hyperparams.seed,
        };
        let model = self.registry.create(&self.spec.arch, &options)?;
        let loop_options = LoopOptions {
            print_freq: self.spec.hyperparams.print_freq,
            log_images: self.spec.hyperparams.log_images,
        };
        Ok(TrainingLoop::new(model, CompositeLoss::new(self.spec.loss), self.sink()?, loop_options)?)
    }

    /// Applies `--resume` if given; returns the epoch to continue from.
    pub fn restore(&self, training_loop: &mut TrainingLoop) -> Result<Option<u64>> {
        let Some(path) = &self.resume else {
            return Ok(None);
        };
        match load_checkpoint(path)? {
            Some(checkpoint) => Ok(Some(training_loop.resume(&checkpoint)?)),
            None => Ok(None),
        }
    }
}
