use crate::checkpoint::CheckpointStore;
use crate::error::TrainingResult;
use crate::job::RunId;
use std::path::{Path, PathBuf};

/// Where a run keeps its checkpoints, logs and predictions.
///
/// Checkpoints live flat under `weights/` as `<run>_checkpoint.json` and
/// `<run>_best.json`; each run logs to `logs/<run>/`.
#[derive(Debug, Clone)]
pub struct RunLayout {
    weights_dir: PathBuf,
    log_root: PathBuf,
    prediction_root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(weights_dir: PathBuf, log_root: PathBuf, prediction_root: PathBuf) -> Self {
        Self { weights_dir, log_root, prediction_root }
    }

    /// `weights/`, `logs/` and `predictions/` under `root`.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self::new(root.join("weights"), root.join("logs"), root.join("predictions"))
    }

    #[must_use]
    pub fn weights_dir(&self) -> &Path {
        &self.weights_dir
    }

    #[must_use]
    pub fn prediction_root(&self) -> &Path {
        &self.prediction_root
    }

    #[must_use]
    pub fn checkpoint_path(&self, run: &RunId) -> PathBuf {
        self.weights_dir.join(format!("{run}_checkpoint.json"))
    }

    #[must_use]
    pub fn best_path(&self, run: &RunId) -> PathBuf {
        self.weights_dir.join(format!("{run}_best.json"))
    }

    #[must_use]
    pub fn manifest_path(&self, run: &RunId) -> PathBuf {
        self.weights_dir.join(format!("{run}_manifest.json"))
    }

    #[must_use]
    pub fn log_dir(&self, run: &RunId) -> PathBuf {
        self.log_root.join(run.as_str())
    }

    #[must_use]
    pub fn checkpoint_store(&self, run: &RunId) -> CheckpointStore {
        CheckpointStore::new(self.checkpoint_path(run), self.best_path(run))
    }

    pub fn ensure_run_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.weights_dir)?;
        std::fs::create_dir_all(&self.log_root)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = RunLayout::under(temp.path());
        let run = RunId::from("linknet_urban".to_string());

        assert_eq!(
            layout.checkpoint_path(&run),
            temp.path().join("weights/linknet_urban_checkpoint.json")
        );
        assert_eq!(layout.best_path(&run), temp.path().join("weights/linknet_urban_best.json"));
        assert_eq!(layout.log_dir(&run), temp.path().join("logs/linknet_urban"));

        layout.ensure_run_dirs().unwrap();
        assert!(layout.weights_dir().is_dir());
    }
}
