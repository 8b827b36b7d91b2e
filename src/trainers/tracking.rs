//! Local experiment tracking: a JSON-lines metrics log and sample images

use anyhow::{Context, Result};
use candle_core::Tensor;
use log::{debug, info};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::data::image_utils::save_image;

pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone, Serialize)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub retain_loss: f32,
    pub watermark_loss: f32,
    pub learning_rate: f64,
    pub timestamp: String,
}

pub struct Tracker {
    dir: PathBuf,
    metrics: BufWriter<File>,
    images_per_log: usize,
    max_images: usize,
    images_logged: usize,
}

impl Tracker {
    pub fn new(dir: &Path, images_per_log: usize, max_images: usize) -> Result<Self> {
        fs::create_dir_all(dir.join("images"))
            .with_context(|| format!("Failed to create tracking directory: {}", dir.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(METRICS_FILE))?;
        info!("Tracking metrics in {}", dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            metrics: BufWriter::new(file),
            images_per_log,
            max_images,
            images_logged: 0,
        })
    }

    pub fn log_metrics(&mut self, metrics: &StepMetrics) -> Result<()> {
        serde_json::to_writer(&mut self.metrics, metrics)?;
        self.metrics.write_all(b"\n")?;
        self.metrics.flush()?;
        Ok(())
    }

    /// Save up to `images_per_log` images of a `[B, 3, H, W]` batch in
    /// `[-1, 1]`, never exceeding `max_images` over the run.
    pub fn log_images(&mut self, step: usize, images: &Tensor) -> Result<usize> {
        let budget = self.max_images.saturating_sub(self.images_logged);
        let count = images.dim(0)?.min(self.images_per_log).min(budget);
        for i in 0..count {
            let path = self.dir.join("images").join(format!("step-{}-{}.png", step, i));
            save_image(&images.get(i)?, &path)?;
            debug!("Logged image {}", path.display());
        }
        self.images_logged += count;
        Ok(count)
    }

    pub fn images_logged(&self) -> usize {
        self.images_logged
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
