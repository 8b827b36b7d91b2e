//! Image/prompt dataset for watermark optimization
//!
//! Images are the un-watermarked baseline generations, named after the
//! prompt index that produced them (e.g. `ori-lg7.5-12.jpg`). They are
//! ordered by that index so image `i` lines up with prompt `i`.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::image_utils::image_to_tensor;
use super::prompts::PromptCorpus;
use crate::error::DatasetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Bilinear,
    Bicubic,
    Lanczos,
}

impl Interpolation {
    pub fn filter(self) -> FilterType {
        match self {
            Interpolation::Bilinear => FilterType::Triangle,
            Interpolation::Bicubic => FilterType::CatmullRom,
            Interpolation::Lanczos => FilterType::Lanczos3,
        }
    }
}

impl FromStr for Interpolation {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bilinear" => Ok(Interpolation::Bilinear),
            "bicubic" => Ok(Interpolation::Bicubic),
            "lanczos" => Ok(Interpolation::Lanczos),
            other => Err(DatasetError::UnknownInterpolation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// Dataset configuration
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub data_root: PathBuf,
    pub size: usize,
    pub repeats: usize,
    pub interpolation: Interpolation,
    pub split: Split,
    pub center_crop: bool,
}

impl DatasetConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            size: 512,
            repeats: 10,
            interpolation: Interpolation::Bicubic,
            split: Split::Train,
            center_crop: false,
        }
    }
}

/// A single dataset item
#[derive(Debug, Clone)]
pub struct Example {
    pub prompt: String,
    /// `[3, size, size]`, values in `[-1, 1]`
    pub pixel_values: Tensor,
}

pub struct OptimizedDataset {
    config: DatasetConfig,
    image_paths: Vec<PathBuf>,
    prompts: PromptCorpus,
    length: usize,
    device: Device,
}

impl OptimizedDataset {
    pub fn new(config: DatasetConfig, prompts: PromptCorpus, device: Device) -> Result<Self> {
        let image_paths = list_images(&config.data_root)?;
        let num_images = image_paths.len();

        if prompts.len() < num_images {
            return Err(DatasetError::PromptCorpusTooSmall {
                prompts: prompts.len(),
                images: num_images,
            }
            .into());
        }
        if prompts.len() > num_images {
            warn!(
                "Prompt corpus has {} entries, only the first {} are paired with images",
                prompts.len(),
                num_images
            );
        }

        let length = match config.split {
            Split::Train => num_images * config.repeats,
            Split::Test => num_images,
        };

        info!(
            "Dataset: {} images from {} ({} items, {}x{}, {:?})",
            num_images,
            config.data_root.display(),
            length,
            config.size,
            config.size,
            config.interpolation
        );

        Ok(Self {
            config,
            image_paths,
            prompts,
            length,
            device,
        })
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn num_images(&self) -> usize {
        self.image_paths.len()
    }

    pub fn image_paths(&self) -> &[PathBuf] {
        &self.image_paths
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    pub fn get(&self, index: usize) -> Result<Example> {
        if index >= self.length {
            return Err(DatasetError::IndexOutOfRange {
                index,
                len: self.length,
            }
            .into());
        }
        let slot = index % self.num_images();
        let path = &self.image_paths[slot];

        let image = image::open(path)
            .with_context(|| format!("Failed to open image: {}", path.display()))?;
        let image = into_rgb(image);
        let image = self.prepare_image(image);

        Ok(Example {
            prompt: self.prompts.get(slot)?.to_string(),
            pixel_values: image_to_tensor(&image, &self.device)?,
        })
    }

    fn prepare_image(&self, image: RgbImage) -> RgbImage {
        let image = if self.config.center_crop {
            let (w, h) = image.dimensions();
            let crop = w.min(h);
            imageops::crop_imm(&image, (w - crop) / 2, (h - crop) / 2, crop, crop).to_image()
        } else {
            image
        };

        let size = self.config.size as u32;
        imageops::resize(&image, size, size, self.config.interpolation.filter())
    }
}

fn into_rgb(image: DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}

/// Numeric index encoded after the last `-` of a file name, up to the first `.`.
pub fn file_index(file_name: &str) -> Result<u64, DatasetError> {
    file_name
        .rsplit('-')
        .next()
        .and_then(|tail| tail.split('.').next())
        .and_then(|digits| digits.parse::<u64>().ok())
        .ok_or_else(|| DatasetError::FileNameIndex(file_name.to_string()))
}

/// List regular files of `dir` sorted by their numeric index.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(DatasetError::MissingDirectory(dir.to_path_buf()).into());
    }

    let mut indexed = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read dataset directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        indexed.push((file_index(&name)?, path));
    }

    if indexed.is_empty() {
        return Err(DatasetError::Empty(dir.to_path_buf()).into());
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, path)| path).collect())
}
