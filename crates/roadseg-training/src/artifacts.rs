use crate::error::{TrainingError, TrainingResult};
use crate::job::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    LatestCheckpoint,
    BestCheckpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

/// Losses of one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based.
    pub epoch: u64,
    pub train_loss: f64,
    pub valid_loss: f64,
    pub valid_dice_hard: f64,
    pub learning_rate: f64,
    pub is_best: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub arch: String,
    pub preset: String,
    pub mask_variant: String,
    pub loss: String,
    pub best_val_loss: f64,
    pub epochs: Vec<EpochRecord>,
    pub artifacts: Vec<RunArtifact>,
}

impl RunManifest {
    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> TrainingResult<RunArtifact> {
    if !path.exists() {
        return Err(TrainingError::DataIntegrity(format!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }

    let hash = sha256_file(&path)?;
    Ok(RunArtifact { kind, path, sha256: hash })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ckpt.json");
        std::fs::write(&path, b"abc").unwrap();

        let artifact = make_artifact(ArtifactKind::LatestCheckpoint, path).unwrap();
        assert_eq!(
            artifact.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(make_artifact(ArtifactKind::BestCheckpoint, temp.path().join("none")).is_err());
    }
}
