//! Random-access samples: decode, select channels, normalise, transform.

use crate::augment::{Augmentation, Transformed};
use crate::error::{TrainingError, TrainingResult};
use crate::preset::Preset;
use image::DynamicImage;
use ndarray::{s, Array3, ArrayD, Axis, Ix3, IxDyn};
use rand::rngs::StdRng;
use regex::Regex;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tiff::decoder::{Decoder, DecodingResult};

/// Decodes an image file to `(H, W)` or `(H, W, C)` samples.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> TrainingResult<ArrayD<u16>>;
}

/// Decoder for tile and mask files.
///
/// TIFFs are read with the `tiff` crate so multiband tiles keep every
/// sample. Other formats go through the `image` crate (8/16-bit gray,
/// gray+alpha, RGB, RGBA).
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFileDecoder;

impl ImageDecoder for ImageFileDecoder {
    fn decode(&self, path: &Path) -> TrainingResult<ArrayD<u16>> {
        if is_tiff(path) {
            decode_tiff(path)
        } else {
            decode_image(path)
        }
    }
}

fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff"))
}

fn decode_tiff(path: &Path) -> TrainingResult<ArrayD<u16>> {
    let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
    let (w, h) = decoder.dimensions()?;
    let (w, h) = (w as usize, h as usize);
    let data = match decoder.read_image()? {
        DecodingResult::U8(v) => widen(v),
        DecodingResult::U16(v) => v,
        _ => {
            return Err(TrainingError::DataIntegrity(format!(
                "{}: only 8- and 16-bit unsigned TIFF samples are supported",
                path.display()
            )));
        }
    };
    let pixels = w * h;
    if pixels == 0 || data.len() % pixels != 0 {
        return Err(TrainingError::DataIntegrity(format!(
            "{}: {} samples do not fill a {h}x{w} image",
            path.display(),
            data.len()
        )));
    }
    let channels = data.len() / pixels;
    to_array(data, h, w, channels, path)
}

fn decode_image(path: &Path) -> TrainingResult<ArrayD<u16>> {
    let img = image::open(path)?;
    let (w, h) = (img.width() as usize, img.height() as usize);
    let (channels, data): (usize, Vec<u16>) = match img {
        DynamicImage::ImageLuma8(b) => (1, widen(b.into_raw())),
        DynamicImage::ImageLumaA8(b) => (2, widen(b.into_raw())),
        DynamicImage::ImageRgb8(b) => (3, widen(b.into_raw())),
        DynamicImage::ImageRgba8(b) => (4, widen(b.into_raw())),
        DynamicImage::ImageLuma16(b) => (1, b.into_raw()),
        DynamicImage::ImageLumaA16(b) => (2, b.into_raw()),
        DynamicImage::ImageRgb16(b) => (3, b.into_raw()),
        DynamicImage::ImageRgba16(b) => (4, b.into_raw()),
        other => (4, other.to_rgba16().into_raw()),
    };
    to_array(data, h, w, channels, path)
}

/// `(H, W)` for one channel, `(H, W, C)` otherwise, from interleaved samples.
fn to_array(
    data: Vec<u16>,
    h: usize,
    w: usize,
    channels: usize,
    path: &Path,
) -> TrainingResult<ArrayD<u16>> {
    let shape: Vec<usize> = if channels == 1 { vec![h, w] } else { vec![h, w, channels] };
    ArrayD::from_shape_vec(IxDyn(&shape), data)
        .map_err(|e| TrainingError::DataIntegrity(format!("{}: {e}", path.display())))
}

fn widen(raw: Vec<u8>) -> Vec<u16> {
    raw.into_iter().map(u16::from).collect()
}

static TILE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"img(\d+)").expect("tile number regex should be valid"));

/// Numeric tile id in a file name (`..._img123.tif` -> `123`).
#[must_use]
pub fn tile_number(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    TILE_NUMBER.captures(name)?.get(1)?.as_str().parse().ok()
}

/// Adds a trailing channel axis to 2-D arrays; rejects anything but 2-D/3-D.
pub fn ensure_channels(array: ArrayD<u16>, path: &Path) -> TrainingResult<Array3<u16>> {
    let ndim = array.ndim();
    let array = if ndim < 3 { array.insert_axis(Axis(ndim)) } else { array };
    array.into_dimensionality::<Ix3>().map_err(|_| {
        TrainingError::DataIntegrity(format!("{}: expected a 2-D or 3-D image", path.display()))
    })
}

/// Copies the preset's 1-based channels into a `(width, width, len)` u8 array.
///
/// Values above 255 saturate to 255; they do not wrap modulo 256.
pub fn select_channels(
    src: &Array3<u16>,
    preset: &Preset,
    path: &Path,
) -> TrainingResult<Array3<u8>> {
    let width = preset.width as usize;
    let (h, w, available) = src.dim();
    if h != width || w != width {
        return Err(TrainingError::DataIntegrity(format!(
            "{}: tile is {h}x{w}, preset expects {width}x{width}",
            path.display()
        )));
    }

    let mut out = Array3::<u8>::zeros((width, width, preset.channels.len()));
    for (i, &channel) in preset.channels.iter().enumerate() {
        if channel == 0 || channel > available {
            return Err(TrainingError::DataIntegrity(format!(
                "{}: channel {channel} requested but the tile has {available}",
                path.display()
            )));
        }
        out.slice_mut(s![.., .., i])
            .assign(&src.slice(s![.., .., channel - 1]).mapv(saturate));
    }
    Ok(out)
}

fn saturate(v: u16) -> u8 {
    u8::try_from(v).unwrap_or(u8::MAX)
}

/// Indexable collection of samples over ordered image (and mask) paths.
///
/// With masks, both lists are sorted and must correspond tile for tile.
/// Without masks the given order is kept.
pub struct SampleSource {
    preset: Preset,
    image_paths: Vec<PathBuf>,
    mask_paths: Option<Vec<PathBuf>>,
    decoder: Arc<dyn ImageDecoder>,
    augmentation: Arc<dyn Augmentation>,
}

impl SampleSource {
    pub fn new(
        preset: Preset,
        mut image_paths: Vec<PathBuf>,
        mask_paths: Option<Vec<PathBuf>>,
        decoder: Arc<dyn ImageDecoder>,
        augmentation: Arc<dyn Augmentation>,
    ) -> TrainingResult<Self> {
        let mask_paths = match mask_paths {
            Some(mut masks) => {
                image_paths.sort();
                masks.sort();
                check_correspondence(&image_paths, &masks)?;
                Some(masks)
            }
            None => None,
        };
        Ok(Self { preset, image_paths, mask_paths, decoder, augmentation })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.image_paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }

    #[must_use]
    pub fn has_masks(&self) -> bool {
        self.mask_paths.is_some()
    }

    #[must_use]
    pub fn image_paths(&self) -> &[PathBuf] {
        &self.image_paths
    }

    #[must_use]
    pub fn preset(&self) -> &Preset {
        &self.preset
    }

    fn path(&self, index: usize) -> TrainingResult<&Path> {
        self.image_paths.get(index).map(PathBuf::as_path).ok_or_else(|| {
            TrainingError::DataIntegrity(format!(
                "sample {index} out of range (len {})",
                self.image_paths.len()
            ))
        })
    }

    /// Decoded, channel-selected tile `(W, W, C)` and mask `(H, W, L)`, before
    /// the transform.
    pub fn raw(&self, index: usize) -> TrainingResult<(Array3<u8>, Option<Array3<u8>>)> {
        let path = self.path(index)?;
        let tile = ensure_channels(self.decoder.decode(path)?, path)?;
        let image = select_channels(&tile, &self.preset, path)?;

        let mask = match &self.mask_paths {
            Some(masks) => {
                let mask_path = &masks[index];
                let decoded = ensure_channels(self.decoder.decode(mask_path)?, mask_path)?;
                Some(decoded.mapv(saturate))
            }
            None => None,
        };
        Ok((image, mask))
    }

    /// Model-ready sample at `index`. Every call decodes from disk.
    pub fn get(&self, index: usize, rng: &mut StdRng) -> TrainingResult<Transformed> {
        let (image, mask) = self.raw(index)?;
        self.augmentation.transform(image, mask, rng)
    }
}

fn check_correspondence(images: &[PathBuf], masks: &[PathBuf]) -> TrainingResult<()> {
    if images.len() != masks.len() {
        return Err(TrainingError::DataIntegrity(format!(
            "{} images but {} masks",
            images.len(),
            masks.len()
        )));
    }
    for (image, mask) in images.iter().zip(masks) {
        let a = tile_number(image);
        if a.is_none() || a != tile_number(mask) {
            return Err(TrainingError::DataIntegrity(format!(
                "image {} and mask {} are not the same tile after sorting",
                image.display(),
                mask.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::ResizeAugmentation;
    use ndarray::Array2;
    use rand::SeedableRng;
    use std::collections::HashMap;

    /// Serves fixed arrays by path.
    struct MapDecoder(HashMap<PathBuf, ArrayD<u16>>);

    impl ImageDecoder for MapDecoder {
        fn decode(&self, path: &Path) -> TrainingResult<ArrayD<u16>> {
            self.0.get(path).cloned().ok_or_else(|| {
                TrainingError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))
            })
        }
    }

    fn source(
        preset: Preset,
        files: Vec<(&str, ArrayD<u16>)>,
        images: &[&str],
        masks: Option<&[&str]>,
    ) -> TrainingResult<SampleSource> {
        let decoder = MapDecoder(files.into_iter().map(|(p, a)| (PathBuf::from(p), a)).collect());
        SampleSource::new(
            preset,
            images.iter().map(PathBuf::from).collect(),
            masks.map(|m| m.iter().map(PathBuf::from).collect()),
            Arc::new(decoder),
            Arc::new(ResizeAugmentation::new(4, false).unwrap()),
        )
    }

    #[test]
    fn test_grayscale_tile_becomes_single_channel() {
        let gray = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as u16);
        let src = source(
            Preset::new(4, 1, "PAN", &[1]),
            vec![("a/PAN_img1.tif", gray.clone().into_dyn())],
            &["a/PAN_img1.tif"],
            None,
        )
        .unwrap();

        let (image, mask) = src.raw(0).unwrap();
        assert_eq!(image.dim(), (4, 4, 1));
        assert_eq!(image.index_axis(Axis(2), 0), gray.mapv(|v| v as u8));
        assert!(mask.is_none());
    }

    #[test]
    fn test_channels_are_selected_and_reordered() {
        let tile = Array3::from_shape_fn((2, 2, 8), |(_, _, c)| (c as u16 + 1) * 10);
        let src = source(
            Preset::new(2, 8, "MUL", &[7, 5, 3]),
            vec![("t_img1.tif", tile.into_dyn())],
            &["t_img1.tif"],
            None,
        )
        .unwrap();
        let (image, _) = src.raw(0).unwrap();
        assert_eq!(image[[0, 0, 0]], 70);
        assert_eq!(image[[1, 1, 1]], 50);
        assert_eq!(image[[0, 1, 2]], 30);
    }

    #[test]
    fn test_sixteen_bit_values_saturate() {
        let tile = Array2::from_elem((2, 2), 1000u16).into_dyn();
        let src =
            source(Preset::new(2, 1, "PAN", &[1]), vec![("img1.tif", tile)], &["img1.tif"], None)
                .unwrap();
        assert!(src.raw(0).unwrap().0.iter().all(|&v| v == 255));
    }

    #[test]
    fn test_masks_are_sorted_into_correspondence() {
        let preset = Preset::new(4, 1, "PAN", &[1]);
        let tile = |v| Array2::from_elem((4, 4), v).into_dyn();
        let src = source(
            preset,
            vec![
                ("img/PAN_img2.tif", tile(2)),
                ("img/PAN_img1.tif", tile(1)),
                ("mask/PAN_img1.png", tile(0)),
                ("mask/PAN_img2.png", tile(255)),
            ],
            &["img/PAN_img2.tif", "img/PAN_img1.tif"],
            Some(&["mask/PAN_img1.png", "mask/PAN_img2.png"]),
        )
        .unwrap();

        assert_eq!(src.image_paths()[0], PathBuf::from("img/PAN_img1.tif"));
        let mut rng = StdRng::seed_from_u64(0);
        let second = src.get(1, &mut rng).unwrap();
        assert_eq!(second.image.dim(), (1, 4, 4));
        assert!(second.mask.unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_mismatched_lists_are_rejected() {
        let preset = Preset::new(4, 1, "PAN", &[1]);
        let err = source(preset.clone(), vec![], &["a_img1.tif"], Some(&[])).err().unwrap();
        assert!(matches!(err, TrainingError::DataIntegrity(_)));

        let err = source(preset, vec![], &["a_img1.tif"], Some(&["m_img2.png"])).err().unwrap();
        assert!(matches!(err, TrainingError::DataIntegrity(_)));
    }

    #[test]
    fn test_wrong_tile_width_is_rejected() {
        let tile = Array2::from_elem((3, 3), 1u16).into_dyn();
        let src =
            source(Preset::new(4, 1, "PAN", &[1]), vec![("img1.tif", tile)], &["img1.tif"], None)
                .unwrap();
        assert!(matches!(src.raw(0), Err(TrainingError::DataIntegrity(_))));
    }

    #[test]
    fn test_image_file_decoder_reads_png() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("tile_img5.png");
        image::RgbImage::from_fn(3, 2, |x, y| image::Rgb([x as u8, y as u8, 9]))
            .save(&path)
            .unwrap();
        let decoded = ImageFileDecoder.decode(&path).unwrap();
        assert_eq!(decoded.shape(), &[2, 3, 3]);
        assert_eq!(decoded[[1, 2, 0]], 2);
        assert_eq!(decoded[[1, 2, 1]], 1);
        assert_eq!(tile_number(&path), Some(5));
    }

    fn ifd_entry(out: &mut Vec<u8>, tag: u16, kind: u16, count: u32, value: u32) {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }

    /// Uncompressed, pixel-interleaved, single-strip 16-bit TIFF.
    fn write_multiband_tiff(path: &Path, width: u16, height: u16, bands: u16, samples: &[u16]) {
        const SHORT: u16 = 3;
        const LONG: u16 = 4;
        let entries: u16 = 10;
        let bits_offset = 8 + 2 + u32::from(entries) * 12 + 4;
        let data_offset = bits_offset + u32::from(bands) * 2;
        let byte_count = u32::try_from(samples.len() * 2).unwrap();

        let mut out = Vec::new();
        out.extend_from_slice(b"II");
        out.extend_from_slice(&42u16.to_le_bytes());
        out.extend_from_slice(&8u32.to_le_bytes());
        out.extend_from_slice(&entries.to_le_bytes());
        ifd_entry(&mut out, 256, SHORT, 1, u32::from(width));
        ifd_entry(&mut out, 257, SHORT, 1, u32::from(height));
        ifd_entry(&mut out, 258, SHORT, u32::from(bands), bits_offset);
        ifd_entry(&mut out, 259, SHORT, 1, 1);
        ifd_entry(&mut out, 262, SHORT, 1, 1);
        ifd_entry(&mut out, 273, LONG, 1, data_offset);
        ifd_entry(&mut out, 277, SHORT, 1, u32::from(bands));
        ifd_entry(&mut out, 278, SHORT, 1, u32::from(height));
        ifd_entry(&mut out, 279, LONG, 1, byte_count);
        ifd_entry(&mut out, 284, SHORT, 1, 1);
        out.extend_from_slice(&0u32.to_le_bytes());
        for _ in 0..bands {
            out.extend_from_slice(&16u16.to_le_bytes());
        }
        for sample in samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        std::fs::write(path, out).unwrap();
    }

    #[test]
    fn test_multiband_tiff_keeps_every_band() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("MUL-PanSharpen_AOI_2_Vegas_img3.tif");
        let (width, bands) = (4usize, 8usize);
        let mut samples = Vec::with_capacity(width * width * bands);
        for y in 0..width {
            for x in 0..width {
                for band in 0..bands {
                    let value = if band == 7 { 1000 } else { band * 30 + y * 4 + x };
                    samples.push(value as u16);
                }
            }
        }
        write_multiband_tiff(&path, 4, 4, 8, &samples);

        let decoded = ImageFileDecoder.decode(&path).unwrap();
        assert_eq!(decoded.shape(), &[4, 4, 8]);
        assert_eq!(decoded[[1, 2, 4]], 126);
        assert_eq!(decoded[[3, 3, 7]], 1000);

        let tile = ensure_channels(decoded, &path).unwrap();
        let image =
            select_channels(&tile, &Preset::new(4, 8, "MUL-PanSharpen", &[5, 3, 8]), &path)
                .unwrap();
        assert_eq!(image.dim(), (4, 4, 3));
        assert_eq!(image[[1, 2, 0]], 126);
        assert_eq!(image[[1, 2, 1]], 66);
        assert_eq!(image[[0, 0, 2]], 255);
    }
}
