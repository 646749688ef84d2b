use crate::error::TrainingResult;
use crate::job::RunId;
use image::{GrayImage, Luma};
use ndarray::ArrayView2;
use std::path::{Path, PathBuf};

/// Writes predicted masks as `<prefix>/<site_folder>/<run>/<stem>.jpg`.
#[derive(Debug, Clone)]
pub struct PredictionWriter {
    prefix: PathBuf,
    run_id: RunId,
}

impl PredictionWriter {
    #[must_use]
    pub fn new(prefix: PathBuf, run_id: RunId) -> Self {
        Self { prefix, run_id }
    }

    #[must_use]
    pub fn path_for(&self, site_folder: &str, file_name: &str) -> PathBuf {
        self.prefix
            .join(site_folder)
            .join(self.run_id.as_str())
            .join(Path::new(file_name).with_extension("jpg"))
    }

    /// Saves a `(H, W)` probability map as an 8-bit grayscale JPEG.
    pub fn write(
        &self,
        probabilities: ArrayView2<'_, f32>,
        site_folder: &str,
        file_name: &str,
    ) -> TrainingResult<PathBuf> {
        let path = self.path_for(site_folder, file_name);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let (h, w) = probabilities.dim();
        GrayImage::from_fn(w as u32, h as u32, |x, y| {
            let p = probabilities[[y as usize, x as usize]].clamp(0.0, 1.0);
            Luma([(p * 255.0).round() as u8])
        })
        .save(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::TempDir;

    #[test]
    fn test_path_replaces_extension() {
        let writer = PredictionWriter::new(PathBuf::from("out"), RunId::from("run1".to_string()));
        assert_eq!(
            writer.path_for("AOI_2_Vegas_Roads_Test_Public", "RGB-PanSharpen_AOI_2_Vegas_img7.tif"),
            PathBuf::from("out/AOI_2_Vegas_Roads_Test_Public/run1/RGB-PanSharpen_AOI_2_Vegas_img7.jpg")
        );
    }

    #[test]
    fn test_write_creates_directories_idempotently() {
        let temp = TempDir::new().unwrap();
        let writer = PredictionWriter::new(temp.path().to_path_buf(), RunId::from("r".to_string()));
        let a = writer.write(Array2::<f32>::zeros((4, 6)).view(), "site", "a_img1.tif").unwrap();
        let b = writer.write(Array2::<f32>::ones((4, 6)).view(), "site", "b_img2.tif").unwrap();
        assert!(a.is_file() && b.is_file());

        let dark = image::open(&a).unwrap().to_luma8();
        assert_eq!(dark.dimensions(), (6, 4));
        assert!(dark.get_pixel(0, 0).0[0] < 10);
        let bright = image::open(&b).unwrap().to_luma8();
        assert!(bright.get_pixel(5, 3).0[0] > 245);
    }
}
