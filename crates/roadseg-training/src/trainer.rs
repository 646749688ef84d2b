//! The epoch loop: train, validate, predict.

use crate::artifacts::EpochRecord;
use crate::checkpoint::{Checkpoint, CheckpointStore, INITIAL_BEST_LOSS};
use crate::error::{TrainingError, TrainingResult};
use crate::loader::{Batch, BatchLoader};
use crate::loss::{overlap_thresholded, probabilities, CompositeLoss};
use crate::metrics::{MetricsSink, RunningMetric};
use crate::optim::Optimizer;
use crate::predict::PredictionWriter;
use crate::scheduler::LrScheduler;
use crate::selector::SelectedSample;
use ndarray::{s, Array4, Axis};
use roadseg_abstraction::{Phase, SegmentationModel};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Images per validation batch sent to the metrics sink.
const LOGGED_IMAGES: usize = 5;

/// Counters used to tag metrics. Owned by the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunContext {
    pub epoch: u64,
    pub train_step: u64,
    pub valid_step: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOptions {
    /// Progress lines and validation images every `print_freq` batches.
    pub print_freq: usize,
    pub log_images: bool,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self { print_freq: 10, log_images: false }
    }
}

/// Lowest validation loss so far; only a strict improvement counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestTracker {
    best: f64,
}

impl Default for BestTracker {
    fn default() -> Self {
        Self::new(INITIAL_BEST_LOSS)
    }
}

impl BestTracker {
    #[must_use]
    pub fn new(best: f64) -> Self {
        Self { best }
    }

    /// Records `loss`; true when it beats everything seen before.
    pub fn observe(&mut self, loss: f64) -> bool {
        let is_best = loss < self.best;
        self.best = self.best.min(loss);
        is_best
    }

    #[must_use]
    pub fn best(&self) -> f64 {
        self.best
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSummary {
    pub loss: f64,
    /// Overlap of the rounded predictions; reporting only.
    pub dice_hard: f64,
}

/// Loaders, checkpoint slots and epoch range for [`TrainingLoop::fit`].
pub struct FitPlan<'a> {
    pub train: &'a BatchLoader,
    pub valid: &'a BatchLoader,
    pub store: &'a CheckpointStore,
    pub start_epoch: u64,
    /// Exclusive end of the epoch range.
    pub epochs: u64,
}

pub struct TrainingLoop {
    model: Box<dyn SegmentationModel>,
    loss: CompositeLoss,
    sink: Arc<dyn MetricsSink>,
    options: LoopOptions,
    ctx: RunContext,
    best: BestTracker,
}

impl TrainingLoop {
    pub fn new(
        model: Box<dyn SegmentationModel>,
        loss: CompositeLoss,
        sink: Arc<dyn MetricsSink>,
        options: LoopOptions,
    ) -> TrainingResult<Self> {
        if model.output_kind() != loss.kind().output_kind() {
            return Err(TrainingError::Configuration(format!(
                "loss '{}' expects {:?} but '{}' produces {:?}",
                loss.kind(),
                loss.kind().output_kind(),
                model.architecture(),
                model.output_kind()
            )));
        }
        if options.print_freq == 0 {
            return Err(TrainingError::Configuration("print_freq must be >= 1".to_string()));
        }
        Ok(Self {
            model,
            loss,
            sink,
            options,
            ctx: RunContext::default(),
            best: BestTracker::default(),
        })
    }

    #[must_use]
    pub fn model(&self) -> &dyn SegmentationModel {
        self.model.as_ref()
    }

    #[must_use]
    pub fn context(&self) -> RunContext {
        self.ctx
    }

    #[must_use]
    pub fn best_val_loss(&self) -> f64 {
        self.best.best()
    }

    /// Restores parameters and the best loss; returns the epoch to start at.
    pub fn resume(&mut self, checkpoint: &Checkpoint) -> TrainingResult<u64> {
        if checkpoint.arch != self.model.architecture() {
            return Err(TrainingError::Configuration(format!(
                "checkpoint was written by '{}', model is '{}'",
                checkpoint.arch,
                self.model.architecture()
            )));
        }
        self.model.load_state(&checkpoint.state_dict)?;
        self.best = BestTracker::new(checkpoint.best_val_loss);
        info!(
            epoch = checkpoint.epoch,
            best_val_loss = checkpoint.best_val_loss,
            "Resumed from checkpoint"
        );
        Ok(checkpoint.epoch)
    }

    /// One pass over `loader` with gradient updates; returns the mean loss.
    pub fn train_epoch(
        &mut self,
        loader: &BatchLoader,
        optimizer: &mut dyn Optimizer,
    ) -> TrainingResult<f64> {
        let mut batch_time = RunningMetric::new();
        let mut data_time = RunningMetric::new();
        let mut losses = RunningMetric::new();
        let total = loader.len();

        let mut end = Instant::now();
        for (i, batch) in loader.epoch(self.ctx.epoch).enumerate() {
            let batch = batch?;
            data_time.update(end.elapsed().as_secs_f64(), 1);

            let target = masks_of(&batch)?;
            let output = self.model.forward(&batch.images, Phase::Train)?;
            let loss = self.loss.compute(&output, target)?;
            losses.update(f64::from(loss.value), batch.len() as u64);

            self.model.zero_grad();
            self.model.backward(&loss.grad)?;
            optimizer.step(self.model.parameters_mut());

            batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();

            self.sink.scalar("train_loss", losses.val, self.ctx.train_step);
            self.ctx.train_step += 1;

            if i % self.options.print_freq == 0 {
                info!(
                    "Epoch: [{}][{i}/{total}]\tTime {:.3} ({:.3})\tData {:.3} ({:.3})\tLoss {:.4} ({:.4})",
                    self.ctx.epoch,
                    batch_time.val,
                    batch_time.avg,
                    data_time.val,
                    data_time.avg,
                    losses.val,
                    losses.avg
                );
            }
        }

        info!(" * Avg Train Loss {:.4}", losses.avg);
        Ok(losses.avg)
    }

    /// One pass over `loader` without updates.
    pub fn validate_epoch(&mut self, loader: &BatchLoader) -> TrainingResult<ValidationSummary> {
        let mut batch_time = RunningMetric::new();
        let mut losses = RunningMetric::new();
        let mut dice = RunningMetric::new();
        let total = loader.len();

        let mut end = Instant::now();
        for (i, batch) in loader.epoch(self.ctx.epoch).enumerate() {
            let batch = batch?;
            let target = masks_of(&batch)?;
            let output = self.model.forward(&batch.images, Phase::Eval)?;
            let probs = probabilities(&output, self.model.output_kind());

            if self.options.log_images && i % self.options.print_freq == 0 {
                self.log_images(&batch.images, target, &probs);
            }

            let loss = self.loss.compute(&output, target)?;
            let n = batch.len() as u64;
            losses.update(f64::from(loss.value), n);
            dice.update(f64::from(overlap_thresholded(&probs, target)?), n);

            batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();

            self.sink.scalar("valid_loss", losses.val, self.ctx.valid_step);
            self.ctx.valid_step += 1;

            if i % self.options.print_freq == 0 {
                info!(
                    "Test: [{i}/{total}]\tTime {:.3} ({:.3})\tLoss {:.4} ({:.4})\tDice {:.4} ({:.4})",
                    batch_time.val,
                    batch_time.avg,
                    losses.val,
                    losses.avg,
                    dice.val,
                    dice.avg
                );
            }
        }

        info!(" * Avg Val Loss {:.4}\tDice {:.4}", losses.avg, dice.avg);
        Ok(ValidationSummary { loss: losses.avg, dice_hard: dice.avg })
    }

    fn log_images(&self, images: &Array4<f32>, masks: &Array4<f32>, preds: &Array4<f32>) {
        let step = self.ctx.train_step;
        let k = images.len_of(Axis(0)).min(LOGGED_IMAGES);
        self.sink.image("images", images.slice(s![..k, .., .., ..]), step);
        self.sink.image("masks", masks.slice(s![..k, .., .., ..]), step);
        self.sink.image("preds", preds.slice(s![..k, .., .., ..]), step);
    }

    /// Validation only; never touches checkpoints.
    pub fn evaluate(&mut self, loader: &BatchLoader) -> TrainingResult<ValidationSummary> {
        let summary = self.validate_epoch(loader)?;
        info!(loss = summary.loss, dice_hard = summary.dice_hard, "Evaluation finished");
        Ok(summary)
    }

    /// Trains epochs `start_epoch..epochs`, checkpointing after each one.
    pub fn fit(
        &mut self,
        plan: &FitPlan<'_>,
        optimizer: &mut dyn Optimizer,
        scheduler: &mut dyn LrScheduler,
    ) -> TrainingResult<Vec<EpochRecord>> {
        let mut records = Vec::new();
        for epoch in plan.start_epoch..plan.epochs {
            self.ctx.epoch = epoch;
            let train_loss = self.train_epoch(plan.train, optimizer)?;
            let valid = self.validate_epoch(plan.valid)?;
            let learning_rate = scheduler.step(valid.loss, optimizer);

            let step = epoch + 1;
            self.sink.scalar("train_epoch_loss", train_loss, step);
            self.sink.scalar("valid_epoch_loss", valid.loss, step);
            self.sink.scalar("valid_dice_hard", valid.dice_hard, step);
            self.sink.scalar("learning_rate", learning_rate, step);

            let is_best = self.best.observe(valid.loss);
            let checkpoint = Checkpoint {
                epoch: step,
                arch: self.model.architecture().to_string(),
                state_dict: self.model.state(),
                best_val_loss: self.best.best(),
            };
            plan.store.save(&checkpoint, is_best)?;

            records.push(EpochRecord {
                epoch: step,
                train_loss,
                valid_loss: valid.loss,
                valid_dice_hard: valid.dice_hard,
                learning_rate,
                is_best,
            });
        }
        Ok(records)
    }

    /// Writes one mask per sample. `samples[k]` names the `k`-th output, so
    /// the loader must not shuffle.
    pub fn predict(
        &mut self,
        loader: &BatchLoader,
        samples: &[SelectedSample],
        writer: &PredictionWriter,
    ) -> TrainingResult<usize> {
        if loader.config().shuffle {
            return Err(TrainingError::Configuration(
                "prediction needs an order-preserving loader".to_string(),
            ));
        }
        if samples.len() != loader.num_samples() {
            return Err(TrainingError::DataIntegrity(format!(
                "{} prediction names for {} samples",
                samples.len(),
                loader.num_samples()
            )));
        }

        info!(samples = samples.len(), "Starting predictions");
        let mut counter = 0;
        for batch in loader.epoch(0) {
            let batch = batch?;
            let output = self.model.forward(&batch.images, Phase::Eval)?;
            let probs = probabilities(&output, self.model.output_kind());
            for map in probs.outer_iter() {
                let sample = samples.get(counter).ok_or_else(|| {
                    TrainingError::DataIntegrity(format!("output {counter} has no prediction name"))
                })?;
                writer.write(map.index_axis(Axis(0), 0), &sample.site_folder, &sample.file_name)?;
                counter += 1;
            }
        }
        info!(written = counter, "Finished predictions");
        Ok(counter)
    }
}

fn masks_of(batch: &Batch) -> TrainingResult<&Array4<f32>> {
    batch
        .masks
        .as_ref()
        .ok_or_else(|| TrainingError::DataIntegrity("batch has no masks".to_string()))
}
