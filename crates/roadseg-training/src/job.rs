use crate::error::{TrainingError, TrainingResult};
use crate::loss::LossKind;
use crate::selector::{MaskVariant, SelectionMode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Names a run; used for checkpoint, log and prediction paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.0.trim().is_empty() {
            return Err(TrainingError::Configuration("run id must not be empty".to_string()));
        }
        if self.0.contains(['/', '\\']) || self.0 == "." || self.0 == ".." {
            return Err(TrainingError::Configuration(format!(
                "run id '{}' must be a single path component",
                self.0
            )));
        }
        Ok(())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Train,
    /// One validation pass over the held-out split.
    Evaluate,
    /// Writes masks for the public test tiles.
    Predict,
    /// Writes masks for the training tiles.
    PredictTrain,
}

impl RunMode {
    #[must_use]
    pub fn selection_mode(self) -> SelectionMode {
        match self {
            Self::Train | Self::Evaluate => SelectionMode::Train,
            Self::Predict => SelectionMode::Test,
            Self::PredictTrain => SelectionMode::TrainForPredict,
        }
    }

    #[must_use]
    pub fn is_prediction(self) -> bool {
        matches!(self, Self::Predict | Self::PredictTrain)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParams {
    pub epochs: u64,
    pub start_epoch: u64,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub optimizer: String,
    pub workers: usize,
    pub print_freq: usize,
    pub seed: u64,
    pub image_size: usize,
    pub test_fraction: f64,
    /// Random flips during training.
    pub augment: bool,
    pub log_images: bool,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            epochs: 20,
            start_epoch: 0,
            batch_size: 256,
            learning_rate: 0.1,
            optimizer: "adam".to_string(),
            workers: 4,
            print_freq: 10,
            seed: 42,
            image_size: 320,
            test_fraction: 0.25,
            augment: false,
            log_images: false,
        }
    }
}

impl HyperParams {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::Configuration("epochs must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::Configuration("batch_size must be >= 1".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainingError::Configuration("learning_rate must be > 0".to_string()));
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(TrainingError::Configuration("test_fraction must be in (0, 1)".to_string()));
        }
        if self.print_freq == 0 {
            return Err(TrainingError::Configuration("print_freq must be >= 1".to_string()));
        }
        if self.image_size == 0 {
            return Err(TrainingError::Configuration("image_size must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Everything that identifies a run, resolved from flags and config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub run_id: RunId,
    pub mode: RunMode,
    pub preset: String,
    pub city: String,
    pub arch: String,
    pub mask_variant: MaskVariant,
    pub loss: LossKind,
    pub hyperparams: HyperParams,
}

impl RunSpec {
    pub fn validate(&self) -> TrainingResult<()> {
        self.run_id.validate()?;
        if self.preset.trim().is_empty() {
            return Err(TrainingError::Configuration("preset is required".to_string()));
        }
        if self.arch.trim().is_empty() {
            return Err(TrainingError::Configuration("arch is required".to_string()));
        }
        if let LossKind::BceDice { dice_weight } = self.loss {
            if !dice_weight.is_finite() || dice_weight < 0.0 {
                return Err(TrainingError::Configuration("dice_weight must be >= 0".to_string()));
            }
        }
        self.hyperparams.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RunSpec {
        RunSpec {
            run_id: RunId::from("test_model".to_string()),
            mode: RunMode::Train,
            preset: "mul_urban".to_string(),
            city: "all".to_string(),
            arch: "pixel_linear".to_string(),
            mask_variant: MaskVariant::Binary,
            loss: LossKind::BceDice { dice_weight: 1.0 },
            hyperparams: HyperParams::default(),
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(spec().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_hyperparams() {
        let mut s = spec();
        s.hyperparams.test_fraction = 1.0;
        assert!(s.validate().is_err());

        let mut s = spec();
        s.hyperparams.learning_rate = f64::NAN;
        assert!(s.validate().is_err());

        let mut s = spec();
        s.hyperparams.print_freq = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_run_id_is_one_path_component() {
        assert!(RunId::from("a/b".to_string()).validate().is_err());
        assert!(RunId::from("..".to_string()).validate().is_err());
        assert!(RunId::new().validate().is_ok());
    }

    #[test]
    fn test_mode_maps_to_selection() {
        assert_eq!(RunMode::Evaluate.selection_mode(), SelectionMode::Train);
        assert_eq!(RunMode::PredictTrain.selection_mode(), SelectionMode::TrainForPredict);
        assert!(RunMode::Predict.is_prediction());
    }
}
