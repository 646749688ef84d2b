use crate::error::{TrainingError, TrainingResult};
use roadseg_abstraction::ModelState;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Validation loss a fresh run has to beat.
pub const INITIAL_BEST_LOSS: f64 = 100.0;

/// Snapshot written after every training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Number of completed epochs; a resumed run starts here.
    pub epoch: u64,
    pub arch: String,
    pub state_dict: ModelState,
    pub best_val_loss: f64,
}

/// The `latest` and `best` slots of one run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    latest: PathBuf,
    best: PathBuf,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(latest: PathBuf, best: PathBuf) -> Self {
        Self { latest, best }
    }

    #[must_use]
    pub fn latest_path(&self) -> &Path {
        &self.latest
    }

    #[must_use]
    pub fn best_path(&self) -> &Path {
        &self.best
    }

    /// Writes `checkpoint` to the latest slot, then copies it over the best
    /// slot when `is_best`.
    pub fn save(&self, checkpoint: &Checkpoint, is_best: bool) -> TrainingResult<()> {
        if let Some(parent) = self.latest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.latest, serde_json::to_vec(checkpoint)?)?;
        if is_best {
            if let Some(parent) = self.best.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&self.latest, &self.best)?;
            info!(
                epoch = checkpoint.epoch,
                best_val_loss = checkpoint.best_val_loss,
                "Saved new best checkpoint"
            );
        }
        Ok(())
    }
}

/// Reads a checkpoint for resuming.
///
/// A missing file is reported and yields `None`; a file that does not parse
/// as a complete checkpoint is an error.
pub fn load_checkpoint(path: &Path) -> TrainingResult<Option<Checkpoint>> {
    if !path.is_file() {
        warn!(path = %path.display(), "No checkpoint found, starting from scratch");
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
        TrainingError::DataIntegrity(format!("malformed checkpoint {}: {e}", path.display()))
    })?;
    info!(
        path = %path.display(),
        epoch = checkpoint.epoch,
        arch = %checkpoint.arch,
        "Loaded checkpoint"
    );
    Ok(Some(checkpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checkpoint(epoch: u64, loss: f64) -> Checkpoint {
        let mut state = ModelState::new();
        state.insert("w", vec![0.1, -2.5, f32::MIN_POSITIVE]);
        Checkpoint { epoch, arch: "pixel_linear".into(), state_dict: state, best_val_loss: loss }
    }

    #[test]
    fn test_save_then_load_is_identical() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(
            temp.path().join("w/run_checkpoint.json"),
            temp.path().join("w/run_best.json"),
        );
        let ckpt = checkpoint(3, 0.42);
        store.save(&ckpt, false).unwrap();

        assert_eq!(load_checkpoint(store.latest_path()).unwrap(), Some(ckpt));
        assert!(!store.best_path().exists());
    }

    #[test]
    fn test_best_slot_is_a_copy() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().join("a.json"), temp.path().join("b.json"));
        store.save(&checkpoint(1, 0.9), true).unwrap();
        store.save(&checkpoint(2, 0.9), false).unwrap();

        assert_eq!(load_checkpoint(store.best_path()).unwrap().unwrap().epoch, 1);
        assert_eq!(load_checkpoint(store.latest_path()).unwrap().unwrap().epoch, 2);
    }

    #[test]
    fn test_missing_file_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        assert_eq!(load_checkpoint(&temp.path().join("nope.json")).unwrap(), None);
    }

    #[test]
    fn test_missing_field_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.json");
        fs::write(&path, r#"{"epoch": 2, "arch": "pixel_linear", "state_dict": {}}"#).unwrap();
        assert!(matches!(load_checkpoint(&path), Err(TrainingError::DataIntegrity(_))));
    }
}
