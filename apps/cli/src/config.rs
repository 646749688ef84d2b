//! Run configuration file loading.
//!
//! Precedence:
//! 1. CLI arguments
//! 2. Config file (`--config <path>`, or `./roadseg.toml` when present)
//! 3. Defaults

use anyhow::{Context, Result};
use roadseg_training::{HyperParams, InventoryTables, Preset, PresetRegistry};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "roadseg.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub data: DataConfig,
    pub training: HyperParams,
    /// Extra or overriding presets, by name.
    pub presets: BTreeMap<String, Preset>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataConfig {
    pub train_root: PathBuf,
    pub test_root: PathBuf,
    /// Parent of `weights/` and `logs/`.
    pub output_root: PathBuf,
    /// Defaults to `<output_root>/predictions`.
    pub prediction_root: Option<PathBuf>,
    /// Directory holding the tables under their conventional names.
    pub inventory_dir: PathBuf,
    pub metadata: Option<PathBuf>,
    pub masks: Option<PathBuf>,
    pub wide_masks: Option<PathBuf>,
    pub layered_masks: Option<PathBuf>,
    pub road_lines: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_root: PathBuf::from("."),
            test_root: PathBuf::from("."),
            output_root: PathBuf::from("."),
            prediction_root: None,
            inventory_dir: PathBuf::from("."),
            metadata: None,
            masks: None,
            wide_masks: None,
            layered_masks: None,
            road_lines: None,
        }
    }
}

impl DataConfig {
    pub fn tables(&self) -> InventoryTables {
        let mut tables = InventoryTables::in_dir(&self.inventory_dir);
        if let Some(path) = &self.metadata {
            tables.metadata.clone_from(path);
        }
        if let Some(path) = &self.masks {
            tables.masks.clone_from(path);
        }
        if self.wide_masks.is_some() {
            tables.wide_masks.clone_from(&self.wide_masks);
        }
        if self.layered_masks.is_some() {
            tables.layered_masks.clone_from(&self.layered_masks);
        }
        if self.road_lines.is_some() {
            tables.road_lines.clone_from(&self.road_lines);
        }
        tables
    }

    pub fn prediction_root(&self) -> PathBuf {
        self.prediction_root.clone().unwrap_or_else(|| self.output_root.join("predictions"))
    }
}

impl RunConfig {
    /// Loads `explicit`, or the default file if it exists, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.is_file() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Built-in presets with this file's entries applied on top.
    pub fn preset_registry(&self) -> Result<PresetRegistry> {
        let mut registry = PresetRegistry::builtin();
        for (name, preset) in &self.presets {
            registry.insert(name, preset.clone())?;
        }
        Ok(registry)
    }
}
