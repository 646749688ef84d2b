//! Inventory tables and the tile/mask join.
//!
//! Tables are delimited files with a header row. Every load re-reads the
//! files; nothing is cached between selections.

use crate::error::{TrainingError, TrainingResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One physical tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRecord {
    /// Site folder (e.g. `AOI_2_Vegas_Roads_Train`).
    #[serde(rename = "img_files")]
    pub site_folder: String,
    /// Channel subfolder (e.g. `RGB-PanSharpen`).
    #[serde(rename = "img_folders")]
    pub subfolder: String,
    /// Tile file name; the join key.
    #[serde(rename = "img_subfolders")]
    pub file_name: String,
    pub width: u32,
    #[serde(rename = "channels")]
    pub channel_count: u32,
}

/// One mask file, keyed to its tile by file name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskRecord {
    #[serde(rename = "img_file")]
    pub file_name: String,
    #[serde(rename = "img_folder")]
    pub site_folder: String,
    #[serde(rename = "img_subfolder")]
    pub subfolder: String,
    /// Largest mask value; zero means the mask has no road pixels.
    pub mask_max: f64,
    /// 8-bit tile path relative to the training root.
    pub bit8_path: String,
    pub mask_path: String,
    /// 16-bit tile path relative to the training root.
    pub img_path: String,
}

impl MaskRecord {
    #[must_use]
    pub fn has_positive_pixels(&self) -> bool {
        self.mask_max > 0.0
    }
}

/// A mask row with the geometry of its tile, if the tile was found.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRecord {
    pub mask: MaskRecord,
    pub width: Option<u32>,
    pub channel_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CorrectnessRow {
    img_names: String,
    correct: i64,
}

#[derive(Debug, Deserialize)]
struct RoadLineRow {
    img_id: String,
    paved: i64,
}

/// Paved and unpaved road-line counts of one tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineCounts {
    pub paved: usize,
    pub non_paved: usize,
}

impl LineCounts {
    #[must_use]
    pub fn mostly_non_paved(&self) -> bool {
        self.paved < self.non_paved
    }
}

/// Where the inventory tables live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTables {
    pub metadata: PathBuf,
    pub masks: PathBuf,
    #[serde(default)]
    pub wide_masks: Option<PathBuf>,
    #[serde(default)]
    pub layered_masks: Option<PathBuf>,
    #[serde(default)]
    pub road_lines: Option<PathBuf>,
}

impl InventoryTables {
    /// Conventional file names under one directory.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            metadata: dir.join("metadata.csv"),
            masks: dir.join("mask_df.csv"),
            wide_masks: Some(dir.join("new_masks.csv")),
            layered_masks: Some(dir.join("new_masks_layered.csv")),
            road_lines: Some(dir.join("geojson_df_full.csv")),
        }
    }
}

const TILE_COLUMNS: [&str; 5] = ["img_files", "img_folders", "img_subfolders", "width", "channels"];
const MASK_COLUMNS: [&str; 7] =
    ["img_file", "img_folder", "img_subfolder", "mask_max", "bit8_path", "mask_path", "img_path"];

#[derive(Debug, Clone)]
pub struct InventoryCatalog {
    tables: InventoryTables,
}

impl InventoryCatalog {
    #[must_use]
    pub fn new(tables: InventoryTables) -> Self {
        Self { tables }
    }

    #[must_use]
    pub fn tables(&self) -> &InventoryTables {
        &self.tables
    }

    pub fn load_tiles(&self) -> TrainingResult<Vec<TileRecord>> {
        read_table(&self.tables.metadata, &TILE_COLUMNS)
    }

    pub fn load_masks(&self) -> TrainingResult<Vec<MaskRecord>> {
        read_table(&self.tables.masks, &MASK_COLUMNS)
    }

    /// Loads the mask table and left-joins tile geometry onto it.
    pub fn load_joined(&self) -> TrainingResult<Vec<JoinedRecord>> {
        let tiles = self.load_tiles()?;
        let masks = self.load_masks()?;
        let joined = join(masks, &tiles)?;
        debug!(tiles = tiles.len(), masks = joined.len(), "Loaded inventory");
        Ok(joined)
    }

    /// File names flagged correct in the wide-mask table.
    pub fn load_correct_wide(&self) -> TrainingResult<HashSet<String>> {
        let path = required(self.tables.wide_masks.as_deref(), "wide_masks")?;
        load_correct_names(path)
    }

    /// File names flagged correct for layered masks.
    ///
    /// Falls back to the wide-mask table when no layered table is configured
    /// or the configured file does not exist.
    pub fn load_correct_layered(&self) -> TrainingResult<HashSet<String>> {
        match self.tables.layered_masks.as_deref() {
            Some(path) if path.is_file() => load_correct_names(path),
            Some(path) => {
                warn!(path = %path.display(), "Layered mask table not found, using wide mask table");
                self.load_correct_wide()
            }
            None => self.load_correct_wide(),
        }
    }

    /// Road-line counts aggregated per tile id.
    pub fn load_line_counts(&self) -> TrainingResult<BTreeMap<String, LineCounts>> {
        let path = required(self.tables.road_lines.as_deref(), "road_lines")?;
        let rows: Vec<RoadLineRow> = read_table(path, &["img_id", "paved", "linestring"])?;
        let mut counts: BTreeMap<String, LineCounts> = BTreeMap::new();
        for row in rows {
            let entry = counts.entry(row.img_id).or_default();
            if row.paved == 1 {
                entry.paved += 1;
            } else {
                entry.non_paved += 1;
            }
        }
        Ok(counts)
    }
}

/// Left-joins tile geometry onto mask rows by file name.
///
/// Mask rows without a tile keep `None` geometry and are dropped by any
/// width/channel filter. A mask whose file name matches several tiles is
/// rejected; repeated tile names no mask refers to are ignored.
pub fn join(masks: Vec<MaskRecord>, tiles: &[TileRecord]) -> TrainingResult<Vec<JoinedRecord>> {
    let mut by_name: HashMap<&str, &TileRecord> = HashMap::with_capacity(tiles.len());
    let mut repeated: HashSet<&str> = HashSet::new();
    for tile in tiles {
        if by_name.insert(tile.file_name.as_str(), tile).is_some() {
            repeated.insert(tile.file_name.as_str());
        }
    }

    masks
        .into_iter()
        .map(|mask| {
            if repeated.contains(mask.file_name.as_str()) {
                return Err(TrainingError::Configuration(format!(
                    "mask '{}' matches more than one tile in the metadata table",
                    mask.file_name
                )));
            }
            let tile = by_name.get(mask.file_name.as_str());
            Ok(JoinedRecord {
                width: tile.map(|t| t.width),
                channel_count: tile.map(|t| t.channel_count),
                mask,
            })
        })
        .collect()
}

/// Tile id used by the road-line table: the file stem from the first `AOI`.
#[must_use]
pub fn tile_id(file_name: &str) -> Option<&str> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    stem.find("AOI").map(|at| &stem[at..])
}

fn load_correct_names(path: &Path) -> TrainingResult<HashSet<String>> {
    let rows: Vec<CorrectnessRow> = read_table(path, &["img_names", "correct"])?;
    Ok(rows.into_iter().filter(|r| r.correct == 1).map(|r| r.img_names).collect())
}

fn required<'a>(path: Option<&'a Path>, name: &str) -> TrainingResult<&'a Path> {
    path.ok_or_else(|| TrainingError::InventoryLoad(format!("table '{name}' is not configured")))
}

fn read_table<T: DeserializeOwned>(path: &Path, columns: &[&str]) -> TrainingResult<Vec<T>> {
    if !path.is_file() {
        return Err(TrainingError::InventoryLoad(format!("table not found: {}", path.display())));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    if let Some(missing) = columns.iter().find(|c| !headers.iter().any(|h| h == **c)) {
        return Err(TrainingError::InventoryLoad(format!(
            "column '{missing}' missing from {}",
            path.display()
        )));
    }

    reader
        .deserialize()
        .enumerate()
        .map(|(idx, row)| {
            row.map_err(|e| {
                TrainingError::InventoryLoad(format!("{} row {}: {e}", path.display(), idx + 1))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_left_join_keeps_unmatched_masks_without_geometry() {
        let temp = TempDir::new().unwrap();
        let tables = InventoryTables {
            metadata: write(
                temp.path(),
                "metadata.csv",
                "img_files,img_folders,img_subfolders,width,channels\n\
                 AOI_2_Vegas_Roads_Train,RGB-PanSharpen,RGB_img1.tif,1300,3\n",
            ),
            masks: write(
                temp.path(),
                "mask_df.csv",
                ",img_file,img_folder,img_subfolder,mask_max,bit8_path,mask_path,img_path\n\
                 0,RGB_img1.tif,AOI_2_Vegas_Roads_Train,RGB-PanSharpen,255,a.tif,a_mask.png,a16.tif\n\
                 1,RGB_img9.tif,AOI_2_Vegas_Roads_Train,RGB-PanSharpen,0,b.tif,b_mask.png,b16.tif\n",
            ),
            wide_masks: None,
            layered_masks: None,
            road_lines: None,
        };
        let joined = InventoryCatalog::new(tables).load_joined().unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0].width, Some(1300));
        assert_eq!(joined[0].channel_count, Some(3));
        assert!(joined[0].mask.has_positive_pixels());
        assert_eq!(joined[1].width, None);
    }

    #[test]
    fn test_missing_table_and_column() {
        let temp = TempDir::new().unwrap();
        let mut tables = InventoryTables::in_dir(temp.path());
        let err = InventoryCatalog::new(tables.clone()).load_tiles().unwrap_err();
        assert!(matches!(err, TrainingError::InventoryLoad(_)));

        tables.metadata = write(temp.path(), "metadata.csv", "img_files,width\nx,1\n");
        let err = InventoryCatalog::new(tables).load_tiles().unwrap_err();
        assert!(err.to_string().contains("img_folders"));
    }

    fn tile(file_name: &str) -> TileRecord {
        TileRecord {
            site_folder: "s".to_string(),
            subfolder: "RGB".to_string(),
            file_name: file_name.to_string(),
            width: 1,
            channel_count: 1,
        }
    }

    fn mask(file_name: &str) -> MaskRecord {
        MaskRecord {
            file_name: file_name.to_string(),
            site_folder: "s".to_string(),
            subfolder: "RGB".to_string(),
            mask_max: 255.0,
            bit8_path: "a8.tif".to_string(),
            mask_path: "a_mask.png".to_string(),
            img_path: "a.tif".to_string(),
        }
    }

    #[test]
    fn test_duplicate_tile_is_rejected_only_when_joined() {
        let tiles = [tile("a.tif"), tile("a.tif"), tile("b.tif")];

        let joined = join(vec![mask("b.tif")], &tiles).unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].width, Some(1));

        let err = join(vec![mask("b.tif"), mask("a.tif")], &tiles).unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(_)));
        assert!(err.to_string().contains("a.tif"));
    }

    #[test]
    fn test_layered_table_falls_back_to_wide_when_missing() {
        let temp = TempDir::new().unwrap();
        let tables = InventoryTables::in_dir(temp.path());
        write(temp.path(), "new_masks.csv", "img_names,correct
w.tif,1
x.tif,0
");
        let catalog = InventoryCatalog::new(tables);
        assert_eq!(catalog.load_correct_layered().unwrap(), HashSet::from(["w.tif".to_string()]));

        write(temp.path(), "new_masks_layered.csv", "img_names,correct
l.tif,1
");
        assert_eq!(catalog.load_correct_layered().unwrap(), HashSet::from(["l.tif".to_string()]));
    }

    #[test]
    fn test_line_counts_and_tile_id() {
        let temp = TempDir::new().unwrap();
        let mut tables = InventoryTables::in_dir(temp.path());
        tables.road_lines = Some(write(
            temp.path(),
            "lines.csv",
            "img_id,paved,linestring\nAOI_2_Vegas_img1,1,L1\nAOI_2_Vegas_img1,2,L2\nAOI_2_Vegas_img1,2,L3\n",
        ));
        let counts = InventoryCatalog::new(tables).load_line_counts().unwrap();
        let c = counts["AOI_2_Vegas_img1"];
        assert_eq!(c, LineCounts { paved: 1, non_paved: 2 });
        assert!(c.mostly_non_paved());

        assert_eq!(tile_id("RGB-PanSharpen_AOI_2_Vegas_img1.tif"), Some("AOI_2_Vegas_img1"));
        assert_eq!(tile_id("no_site.tif"), None);
    }
}
