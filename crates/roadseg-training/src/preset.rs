//! Channel/resolution presets.
//!
//! A preset pins the tile width, the number of physical channels, the channel
//! subfolder a tile lives in and the 1-based channels fed to the model.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub width: u32,
    pub channel_count: u32,
    pub subfolder: String,
    /// 1-based physical channel indices, in model input order.
    pub channels: Vec<usize>,
}

impl Preset {
    #[must_use]
    pub fn new(width: u32, channel_count: u32, subfolder: &str, channels: &[usize]) -> Self {
        Self { width, channel_count, subfolder: subfolder.to_string(), channels: channels.to_vec() }
    }

    /// Number of channels the model consumes.
    #[must_use]
    pub fn input_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn validate(&self, name: &str) -> TrainingResult<()> {
        if self.width == 0 {
            return Err(TrainingError::Configuration(format!("preset '{name}': width must be >= 1")));
        }
        if self.subfolder.trim().is_empty() {
            return Err(TrainingError::Configuration(format!(
                "preset '{name}': subfolder is required"
            )));
        }
        if self.channels.is_empty() {
            return Err(TrainingError::Configuration(format!(
                "preset '{name}': channels must not be empty"
            )));
        }
        if let Some(bad) =
            self.channels.iter().find(|&&c| c == 0 || c > self.channel_count as usize)
        {
            return Err(TrainingError::Configuration(format!(
                "preset '{name}': channel {bad} is outside 1..={}",
                self.channel_count
            )));
        }
        Ok(())
    }
}

/// Name -> preset lookup. Immutable once a run starts.
#[derive(Debug, Clone, Default)]
pub struct PresetRegistry {
    presets: BTreeMap<String, Preset>,
}

impl PresetRegistry {
    #[must_use]
    pub fn builtin() -> Self {
        let mut presets = BTreeMap::new();
        let all8 = [1, 2, 3, 4, 5, 6, 7, 8];
        presets.insert("rgb_ps".to_string(), Preset::new(1300, 3, "RGB-PanSharpen", &[1, 2, 3]));
        presets.insert("mul_urban".to_string(), Preset::new(1300, 8, "MUL-PanSharpen", &[5, 7, 8]));
        presets
            .insert("mul_vegetation".to_string(), Preset::new(1300, 8, "MUL-PanSharpen", &[7, 5, 3]));
        presets.insert("mul_ps_8channel".to_string(), Preset::new(1300, 8, "MUL-PanSharpen", &all8));
        presets.insert("mul_8channel".to_string(), Preset::new(325, 8, "MUL", &all8));
        presets.insert("pan".to_string(), Preset::new(1300, 1, "PAN", &[1]));
        Self { presets }
    }

    /// Adds or overrides a preset after validating it.
    pub fn insert(&mut self, name: &str, preset: Preset) -> TrainingResult<()> {
        preset.validate(name)?;
        self.presets.insert(name.to_string(), preset);
        Ok(())
    }

    pub fn get(&self, name: &str) -> TrainingResult<&Preset> {
        self.presets.get(name).ok_or_else(|| {
            TrainingError::Configuration(format!(
                "unknown preset '{name}' (known: {})",
                self.names().join(", ")
            ))
        })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.presets.keys().map(String::as_str).collect()
    }
}
