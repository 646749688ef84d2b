//! Tile/mask transforms applied after channel selection.

use crate::error::{TrainingError, TrainingResult};
use ndarray::{Array3, Axis};
use rand::rngs::StdRng;
use rand::Rng;

/// Model-ready sample: image `(C, S, S)` and optional mask `(L, S, S)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub image: Array3<f32>,
    pub mask: Option<Array3<f32>>,
}

/// Maps a channel-selected `(H, W, C)` tile and optional `(H, W, L)` mask to
/// model input.
///
/// Output shape must depend only on the configuration, and mask values must
/// stay in their original classes.
pub trait Augmentation: Send + Sync {
    fn transform(
        &self,
        image: Array3<u8>,
        mask: Option<Array3<u8>>,
        rng: &mut StdRng,
    ) -> TrainingResult<Transformed>;
}

/// Nearest-neighbour resize to a square, `/255` scaling and mask binarisation,
/// with optional random flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeAugmentation {
    size: usize,
    flips: bool,
}

impl ResizeAugmentation {
    pub fn new(size: usize, flips: bool) -> TrainingResult<Self> {
        if size == 0 {
            return Err(TrainingError::Configuration("image size must be >= 1".to_string()));
        }
        Ok(Self { size, flips })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Nearest-neighbour resize of an `(H, W, C)` array to `(size, size, C)`.
fn resize_nearest(src: &Array3<u8>, size: usize) -> Array3<u8> {
    let (h, w, c) = src.dim();
    if h == size && w == size {
        return src.clone();
    }
    Array3::from_shape_fn((size, size, c), |(y, x, ch)| src[[y * h / size, x * w / size, ch]])
}

/// `(H, W, C)` -> `(C, H, W)` in standard layout.
fn channels_first(src: Array3<u8>, f: impl Fn(u8) -> f32) -> Array3<f32> {
    src.permuted_axes([2, 0, 1]).as_standard_layout().mapv(f)
}

impl Augmentation for ResizeAugmentation {
    fn transform(
        &self,
        image: Array3<u8>,
        mask: Option<Array3<u8>>,
        rng: &mut StdRng,
    ) -> TrainingResult<Transformed> {
        if let Some(m) = &mask {
            if m.dim().0 != image.dim().0 || m.dim().1 != image.dim().1 {
                return Err(TrainingError::DataIntegrity(format!(
                    "mask {:?} does not cover image {:?}",
                    m.dim(),
                    image.dim()
                )));
            }
        }

        let mut image = resize_nearest(&image, self.size);
        let mut mask = mask.map(|m| resize_nearest(&m, self.size));

        if self.flips {
            for axis in [Axis(0), Axis(1)] {
                if rng.gen_bool(0.5) {
                    image.invert_axis(axis);
                    if let Some(m) = mask.as_mut() {
                        m.invert_axis(axis);
                    }
                }
            }
        }

        Ok(Transformed {
            image: channels_first(image, |v| f32::from(v) / 255.0),
            mask: mask.map(|m| channels_first(m, |v| if v > 0 { 1.0 } else { 0.0 })),
        })
    }
}
