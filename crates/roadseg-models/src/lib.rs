//! Built-in segmentation architectures and the architecture registry.
//!
//! Architectures are selected by identifier through [`ArchitectureRegistry`];
//! an unknown identifier is rejected before any training starts.

pub mod factory;
pub mod head;
pub mod local_conv;
pub mod pixel_linear;

pub use factory::{ArchitectureEntry, ArchitectureRegistry, ModelConstructor, ModelOptions};
pub use local_conv::LocalConv3;
pub use pixel_linear::PixelLinear;
