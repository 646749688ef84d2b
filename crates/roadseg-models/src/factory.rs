//! Architecture registry for creating model instances from an identifier.
//!
//! Every architecture is registered under one exact identifier. Lookup is
//! case-sensitive and never falls back to a default.

use crate::{LocalConv3, PixelLinear};
use roadseg_abstraction::{ModelError, OutputKind, SegmentationModel};
use tracing::debug;

/// Options every architecture constructor receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOptions {
    /// Number of input channels the network consumes.
    pub in_channels: usize,
    /// Whether the network emits logits or probabilities.
    pub output: OutputKind,
    /// Seed for parameter initialisation.
    pub seed: u64,
}

/// Builds a fresh, randomly initialised network.
pub type ModelConstructor = fn(&ModelOptions) -> Result<Box<dyn SegmentationModel>, ModelError>;

/// One registered architecture.
#[derive(Debug, Clone, Copy)]
pub struct ArchitectureEntry {
    /// Identifier accepted on the command line and stored in checkpoints.
    pub id: &'static str,
    /// Human-readable summary.
    pub description: &'static str,
    /// Constructor.
    pub constructor: ModelConstructor,
}

/// Registry of available architectures.
#[derive(Debug, Clone, Default)]
pub struct ArchitectureRegistry {
    entries: Vec<ArchitectureEntry>,
}

impl ArchitectureRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in architectures.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ArchitectureEntry {
            id: PixelLinear::ID,
            description: "per-pixel logistic layer (1x1 convolution)",
            constructor: build_pixel_linear,
        });
        registry.register(ArchitectureEntry {
            id: LocalConv3::ID,
            description: "single 3x3 convolution with zero padding",
            constructor: build_local_conv3,
        });
        registry
    }

    /// Adds an entry, replacing any previous entry with the same id.
    pub fn register(&mut self, entry: ArchitectureEntry) {
        self.entries.retain(|e| e.id != entry.id);
        self.entries.push(entry);
    }

    /// Looks up an architecture by exact identifier.
    ///
    /// # Errors
    /// Returns `ModelError::UnknownArchitecture` if nothing is registered under `id`.
    pub fn resolve(&self, id: &str) -> Result<&ArchitectureEntry, ModelError> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| ModelError::UnknownArchitecture(id.to_string()))
    }

    /// Resolves `id` and constructs the network.
    ///
    /// # Errors
    /// Fails on an unknown identifier or invalid options.
    pub fn create(
        &self,
        id: &str,
        options: &ModelOptions,
    ) -> Result<Box<dyn SegmentationModel>, ModelError> {
        debug!(
            arch = %id,
            in_channels = options.in_channels,
            output = ?options.output,
            "Creating model instance"
        );
        let entry = self.resolve(id)?;
        (entry.constructor)(options)
    }

    /// Registered identifiers in registration order.
    pub fn ids(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// All entries in registration order.
    pub fn entries(&self) -> &[ArchitectureEntry] {
        &self.entries
    }
}

fn build_pixel_linear(options: &ModelOptions) -> Result<Box<dyn SegmentationModel>, ModelError> {
    Ok(Box::new(PixelLinear::new(options)?))
}

fn build_local_conv3(options: &ModelOptions) -> Result<Box<dyn SegmentationModel>, ModelError> {
    Ok(Box::new(LocalConv3::new(options)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ModelOptions {
        ModelOptions { in_channels: 3, output: OutputKind::Logits, seed: 42 }
    }

    #[test]
    fn test_builtin_ids() {
        let registry = ArchitectureRegistry::builtin();
        assert_eq!(registry.ids(), vec!["pixel_linear", "local_conv3"]);
    }

    #[test]
    fn test_create_known_architecture() {
        let registry = ArchitectureRegistry::builtin();
        let model = registry.create("local_conv3", &options()).unwrap();
        assert_eq!(model.architecture(), "local_conv3");
        assert_eq!(model.output_kind(), OutputKind::Logits);
        assert_eq!(model.parameters()[0].len(), 27);
    }

    #[test]
    fn test_unknown_architecture_is_rejected() {
        let registry = ArchitectureRegistry::builtin();
        let err = registry.create("Pixel_Linear", &options()).err();
        assert_eq!(err, Some(ModelError::UnknownArchitecture("Pixel_Linear".to_string())));
    }

    #[test]
    fn test_same_seed_gives_same_initial_state() {
        let registry = ArchitectureRegistry::builtin();
        let a = registry.create("pixel_linear", &options()).unwrap().state();
        let b = registry.create("pixel_linear", &options()).unwrap().state();
        assert_eq!(a, b);
    }
}
