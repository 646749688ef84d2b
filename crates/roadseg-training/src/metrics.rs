//! Running averages and the best-effort metrics sinks.

use crate::error::TrainingResult;
use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::{ArrayView4, Axis};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Last value plus a sample-weighted running mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMetric {
    pub val: f64,
    pub sum: f64,
    pub count: u64,
    pub avg: f64,
}

impl RunningMetric {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `val` observed over `n` samples.
    pub fn update(&mut self, val: f64, n: u64) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Receives scalars and image batches. Implementations must swallow their
/// own failures; the training run never depends on a sink.
pub trait MetricsSink: Send + Sync {
    fn scalar(&self, tag: &str, value: f64, step: u64);

    /// `images` is `(N, C, H, W)` with values in `[0, 1]`.
    fn image(&self, tag: &str, images: ArrayView4<'_, f32>, step: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn scalar(&self, _tag: &str, _value: f64, _step: u64) {}

    fn image(&self, _tag: &str, _images: ArrayView4<'_, f32>, _step: u64) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn scalar(&self, tag: &str, value: f64, step: u64) {
        debug!(tag, value, step, "scalar");
    }

    fn image(&self, tag: &str, images: ArrayView4<'_, f32>, step: u64) {
        debug!(tag, count = images.len_of(Axis(0)), step, "image batch");
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    value: f64,
    step: u64,
}

/// Writes scalars to `<log_dir>/scalars.jsonl` and image batches to
/// `<log_dir>/images/<tag>_<step>.png`.
#[derive(Debug, Clone)]
pub struct FileMetricsSink {
    log_dir: PathBuf,
}

impl FileMetricsSink {
    /// Opens the sink. With `clear`, anything left by a previous run with
    /// the same directory is removed first.
    pub fn new(log_dir: impl Into<PathBuf>, clear: bool) -> TrainingResult<Self> {
        let log_dir = log_dir.into();
        if clear {
            match fs::remove_dir_all(&log_dir) {
                Ok(()) => debug!(dir = %log_dir.display(), "Cleared log directory"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(dir = %log_dir.display(), error = %e, "Could not clear log directory"),
            }
        }
        fs::create_dir_all(log_dir.join("images"))?;
        Ok(Self { log_dir })
    }

    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    #[must_use]
    pub fn scalars_path(&self) -> PathBuf {
        self.log_dir.join("scalars.jsonl")
    }

    fn append_scalar(&self, tag: &str, value: f64, step: u64) -> TrainingResult<()> {
        let mut line = serde_json::to_string(&ScalarRecord { tag, value, step })?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(self.scalars_path())?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn write_strip(&self, tag: &str, images: ArrayView4<'_, f32>, step: u64) -> TrainingResult<()> {
        let (n, c, h, w) = images.dim();
        if n == 0 || c == 0 {
            return Ok(());
        }
        let path = self.log_dir.join("images").join(format!("{tag}_{step}.png"));
        let px = |i: usize, ch: usize, y: u32, x: u32| {
            to_u8(images[[i, ch, y as usize, x as usize]])
        };
        let (strip_w, strip_h) = ((n * w) as u32, h as u32);
        let tile = |x: u32| (x as usize / w, x % w as u32);

        if c >= 3 {
            RgbImage::from_fn(strip_w, strip_h, |x, y| {
                let (i, x) = tile(x);
                Rgb([px(i, 0, y, x), px(i, 1, y, x), px(i, 2, y, x)])
            })
            .save(&path)?;
        } else {
            GrayImage::from_fn(strip_w, strip_h, |x, y| {
                let (i, x) = tile(x);
                Luma([px(i, 0, y, x)])
            })
            .save(&path)?;
        }
        Ok(())
    }
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

impl MetricsSink for FileMetricsSink {
    fn scalar(&self, tag: &str, value: f64, step: u64) {
        if let Err(e) = self.append_scalar(tag, value, step) {
            warn!(tag, error = %e, "Dropped scalar");
        }
    }

    fn image(&self, tag: &str, images: ArrayView4<'_, f32>, step: u64) {
        if let Err(e) = self.write_strip(tag, images, step) {
            warn!(tag, error = %e, "Dropped image batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use tempfile::TempDir;

    #[test]
    fn test_running_metric_weights_by_count() {
        let mut m = RunningMetric::new();
        m.update(1.0, 3);
        m.update(3.0, 1);
        assert!((m.val - 3.0).abs() < 1e-12);
        assert_eq!(m.count, 4);
        assert!((m.avg - 1.5).abs() < 1e-12);
        assert!((m.avg - m.sum / m.count as f64).abs() < 1e-12);
        m.reset();
        assert_eq!(m, RunningMetric::default());
    }

    #[test]
    fn test_file_sink_appends_scalars_and_writes_strips() {
        let temp = TempDir::new().unwrap();
        let sink = FileMetricsSink::new(temp.path().join("run"), true).unwrap();
        sink.scalar("train_loss", 0.5, 1);
        sink.scalar("train_loss", 0.25, 2);

        let text = fs::read_to_string(sink.scalars_path()).unwrap();
        let lines: Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["tag"], "train_loss");
        assert_eq!(lines[1]["step"], 2);

        sink.image("preds", Array4::from_elem((2, 1, 3, 4), 1.0).view(), 7);
        let strip = image::open(sink.log_dir().join("images/preds_7.png")).unwrap().to_luma8();
        assert_eq!(strip.dimensions(), (8, 3));
        assert_eq!(strip.get_pixel(5, 1).0, [255]);
    }

    #[test]
    fn test_clear_removes_previous_run() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("run");
        FileMetricsSink::new(&dir, false).unwrap().scalar("x", 1.0, 0);
        let sink = FileMetricsSink::new(&dir, true).unwrap();
        assert!(!sink.scalars_path().exists());
    }
}
