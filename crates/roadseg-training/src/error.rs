use roadseg_abstraction::ModelError;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    /// Unknown preset, site, mask variant, loss or optimizer; malformed join.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A required inventory table or column is missing.
    #[error("inventory load error: {0}")]
    InventoryLoad(String),

    /// Image/mask lists out of step, malformed checkpoint, unexpected image layout.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("insufficient samples: {0}")]
    InsufficientSamples(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Tiff(#[from] tiff::TiffError),
}
