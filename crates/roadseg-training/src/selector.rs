//! Dataset selection: filters the joined inventory down to the samples of one
//! run and builds their on-disk paths.

use crate::catalog::{tile_id, InventoryCatalog, JoinedRecord, TileRecord};
use crate::error::{TrainingError, TrainingResult};
use crate::preset::Preset;
use crate::sites::SiteScope;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Public test tiles; no masks.
    Test,
    /// Labelled training tiles with masks.
    Train,
    /// Labelled training tiles, images only.
    TrainForPredict,
}

impl SelectionMode {
    #[must_use]
    pub fn needs_masks(self) -> bool {
        self == Self::Train
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskVariant {
    Binary,
    /// Width-annotated masks over verified, mostly unpaved tiles.
    Wide,
    /// Multi-layer masks over verified tiles.
    Layered,
    /// Full-coverage masks, including tiles without roads.
    All,
    /// As `All`, reading the 16-bit tiles.
    #[serde(rename = "all_16bit")]
    All16Bit,
}

impl MaskVariant {
    pub const NAMES: [&'static str; 5] = ["binary", "wide", "layered", "all", "all_16bit"];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Wide => "wide",
            Self::Layered => "layered",
            Self::All => "all",
            Self::All16Bit => "all_16bit",
        }
    }

    /// Full-coverage variants keep tiles whose mask has no positive pixel.
    #[must_use]
    pub fn keeps_empty_masks(self) -> bool {
        matches!(self, Self::All | Self::All16Bit)
    }

    #[must_use]
    pub fn reads_16bit(self) -> bool {
        self == Self::All16Bit
    }

    /// Replacement for the `_mask` token of a base mask path.
    #[must_use]
    pub fn mask_suffix(self) -> &'static str {
        match self {
            Self::Binary => "_mask",
            Self::Wide => "_width_mask",
            Self::Layered => "_layered_mask",
            Self::All | Self::All16Bit => "_all_mask",
        }
    }
}

impl FromStr for MaskVariant {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(Self::Binary),
            "wide" => Ok(Self::Wide),
            "layered" => Ok(Self::Layered),
            "all" => Ok(Self::All),
            "all_16bit" => Ok(Self::All16Bit),
            other => Err(TrainingError::Configuration(format!(
                "unknown mask variant '{other}' (known: {})",
                Self::NAMES.join(", ")
            ))),
        }
    }
}

impl fmt::Display for MaskVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Links a channel layout to the layout whose full-coverage masks it shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogPairing {
    pub from: String,
    pub to: String,
}

impl CatalogPairing {
    #[must_use]
    pub fn new(from: &str, to: &str) -> Self {
        Self { from: from.to_string(), to: to.to_string() }
    }

    /// Pairings used by the SpaceNet road inventories.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![Self::new("RGB-PanSharpen", "MUL-PanSharpen")]
    }
}

/// Dataset roots that relative inventory paths are resolved against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRoots {
    pub train_root: PathBuf,
    pub test_root: PathBuf,
}

/// One selected tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedSample {
    pub image_path: PathBuf,
    pub mask_path: Option<PathBuf>,
    /// Stratification label; only meaningful within one selection.
    pub site_id: usize,
    pub site_folder: String,
    pub file_name: String,
}

/// Ordered output of one selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub samples: Vec<SelectedSample>,
}

impl Selection {
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn image_paths(&self) -> Vec<PathBuf> {
        self.samples.iter().map(|s| s.image_path.clone()).collect()
    }

    /// Mask paths, or `None` if any sample has no mask.
    #[must_use]
    pub fn mask_paths(&self) -> Option<Vec<PathBuf>> {
        self.samples.iter().map(|s| s.mask_path.clone()).collect()
    }

    #[must_use]
    pub fn site_ids(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.site_id).collect()
    }

    #[must_use]
    pub fn site_folders(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.site_folder.clone()).collect()
    }

    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.file_name.clone()).collect()
    }
}

/// Assigns integers to labels in order of first appearance.
#[derive(Debug, Default)]
struct Factorizer {
    codes: HashMap<String, usize>,
}

impl Factorizer {
    fn code(&mut self, label: &str) -> usize {
        let next = self.codes.len();
        *self.codes.entry(label.to_string()).or_insert(next)
    }
}

pub struct DatasetSelector<'a> {
    catalog: &'a InventoryCatalog,
    roots: DataRoots,
    pairings: Vec<CatalogPairing>,
}

impl<'a> DatasetSelector<'a> {
    #[must_use]
    pub fn new(catalog: &'a InventoryCatalog, roots: DataRoots) -> Self {
        Self { catalog, roots, pairings: CatalogPairing::defaults() }
    }

    #[must_use]
    pub fn with_pairings(mut self, pairings: Vec<CatalogPairing>) -> Self {
        self.pairings = pairings;
        self
    }

    pub fn select(
        &self,
        mode: SelectionMode,
        preset: &Preset,
        scope: &SiteScope,
        variant: MaskVariant,
    ) -> TrainingResult<Selection> {
        let selection = match mode {
            SelectionMode::Test => self.select_test(preset, scope, variant)?,
            SelectionMode::Train | SelectionMode::TrainForPredict => {
                self.select_train(mode, preset, scope, variant)?
            }
        };
        info!(
            mode = ?mode,
            variant = %variant,
            scope = %scope,
            samples = selection.len(),
            "Selected dataset"
        );
        Ok(selection)
    }

    fn select_test(
        &self,
        preset: &Preset,
        scope: &SiteScope,
        variant: MaskVariant,
    ) -> TrainingResult<Selection> {
        let folders = scope.test_folders();
        let tiles = self.catalog.load_tiles()?;
        let mut sites = Factorizer::default();

        let samples = tiles
            .iter()
            .filter(|t| matches_tile(t, preset) && folders.contains(&t.site_folder))
            .map(|t| {
                let channel_dir = if variant.reads_16bit() {
                    t.subfolder.clone()
                } else {
                    format!("{}_8bit", t.subfolder)
                };
                SelectedSample {
                    image_path: self
                        .roots
                        .test_root
                        .join(&t.site_folder)
                        .join(channel_dir)
                        .join(&t.file_name),
                    mask_path: None,
                    site_id: sites.code(&t.site_folder),
                    site_folder: t.site_folder.clone(),
                    file_name: t.file_name.clone(),
                }
            })
            .collect();
        Ok(Selection { samples })
    }

    fn select_train(
        &self,
        mode: SelectionMode,
        preset: &Preset,
        scope: &SiteScope,
        variant: MaskVariant,
    ) -> TrainingResult<Selection> {
        let folders = scope.train_folders();
        let rows = self.catalog.load_joined()?;
        let extra = self.extra_filter(variant)?;
        let mut sites = Factorizer::default();

        let samples = rows
            .iter()
            .filter(|r| matches_row(r, preset) && folders.contains(&r.mask.site_folder))
            .filter(|r| variant.keeps_empty_masks() || r.mask.has_positive_pixels())
            .filter(|r| extra.keeps(&r.mask.file_name))
            .map(|r| {
                let image = if variant.reads_16bit() { &r.mask.img_path } else { &r.mask.bit8_path };
                let mask_path = mode
                    .needs_masks()
                    .then(|| self.roots.train_root.join(self.mask_path(&r.mask.mask_path, variant)));
                SelectedSample {
                    image_path: self.roots.train_root.join(image),
                    mask_path,
                    site_id: sites.code(&r.mask.site_folder),
                    site_folder: r.mask.site_folder.clone(),
                    file_name: r.mask.file_name.clone(),
                }
            })
            .collect();
        Ok(Selection { samples })
    }

    fn extra_filter(&self, variant: MaskVariant) -> TrainingResult<ExtraFilter> {
        Ok(match variant {
            MaskVariant::Wide => {
                let correct = self.catalog.load_correct_wide()?;
                let unpaved: HashSet<String> = self
                    .catalog
                    .load_line_counts()?
                    .into_iter()
                    .filter(|(_, c)| c.mostly_non_paved())
                    .map(|(id, _)| id)
                    .collect();
                debug!(correct = correct.len(), unpaved = unpaved.len(), "Wide mask filters");
                ExtraFilter { correct: Some(correct), unpaved: Some(unpaved) }
            }
            MaskVariant::Layered => {
                ExtraFilter { correct: Some(self.catalog.load_correct_layered()?), unpaved: None }
            }
            _ => ExtraFilter::default(),
        })
    }

    /// Rewrites a base mask path to the sibling file of `variant`.
    #[must_use]
    pub fn mask_path(&self, base: &str, variant: MaskVariant) -> String {
        let path = base.replace("_mask", variant.mask_suffix());
        if variant == MaskVariant::All { self.pair_catalog(&path) } else { path }
    }

    /// Points an RGB full-coverage mask at the multispectral mask it shares.
    ///
    /// Rewrites a `<from>_all_mask` directory component and the `<from>`
    /// prefix of the file name inside it.
    fn pair_catalog(&self, path: &str) -> String {
        let parts: Vec<&str> = path.split('/').collect();
        let mut out: Vec<String> = Vec::with_capacity(parts.len());
        let mut i = 0;
        while i < parts.len() {
            let paired = self.pairings.iter().find(|p| {
                parts[i] == format!("{}_all_mask", p.from)
                    && parts.get(i + 1).is_some_and(|next| next.starts_with(p.from.as_str()))
            });
            match paired {
                Some(p) => {
                    out.push(format!("{}_all_mask", p.to));
                    out.push(format!("{}{}", p.to, &parts[i + 1][p.from.len()..]));
                    i += 2;
                }
                None => {
                    out.push(parts[i].to_string());
                    i += 1;
                }
            }
        }
        out.join("/")
    }

    #[must_use]
    pub fn roots(&self) -> &DataRoots {
        &self.roots
    }
}

#[derive(Debug, Default)]
struct ExtraFilter {
    correct: Option<HashSet<String>>,
    unpaved: Option<HashSet<String>>,
}

impl ExtraFilter {
    fn keeps(&self, file_name: &str) -> bool {
        let correct = self.correct.as_ref().is_none_or(|set| set.contains(file_name));
        let unpaved = self
            .unpaved
            .as_ref()
            .is_none_or(|set| tile_id(file_name).is_some_and(|id| set.contains(id)));
        correct && unpaved
    }
}

fn matches_tile(tile: &TileRecord, preset: &Preset) -> bool {
    tile.width == preset.width
        && tile.channel_count == preset.channel_count
        && tile.subfolder == preset.subfolder
}

fn matches_row(row: &JoinedRecord, preset: &Preset) -> bool {
    row.width == Some(preset.width)
        && row.channel_count == Some(preset.channel_count)
        && row.mask.subfolder == preset.subfolder
}
