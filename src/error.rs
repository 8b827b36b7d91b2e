//! Typed errors for the dataset and watermark layers

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset directory not found: {0}")]
    MissingDirectory(PathBuf),

    #[error("no images found in {0}")]
    Empty(PathBuf),

    #[error("cannot extract a numeric index from file name `{0}` (expected e.g. ori-lg7.5-12.jpg)")]
    FileNameIndex(String),

    #[error("prompt corpus has {prompts} entries but the image directory holds {images} images")]
    PromptCorpusTooSmall { prompts: usize, images: usize },

    #[error("unknown interpolation mode `{0}` (expected bilinear, bicubic or lanczos)")]
    UnknownInterpolation(String),

    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("prompt key `{key}` missing from corpus record {record}")]
    MissingPromptKey { key: String, record: usize },
}

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("unknown watermark pattern `{0}`")]
    UnknownPattern(String),

    #[error("unknown watermark mask shape `{0}`")]
    UnknownMaskShape(String),

    #[error("unknown watermark measurement `{0}`")]
    UnknownMeasurement(String),

    #[error("unknown watermark injection `{0}`")]
    UnknownInjection(String),

    #[error("low radius {low} must be smaller than up radius {up}")]
    RadiusBand { low: usize, up: usize },

    #[error("watermark channel {channel} out of range for a {channels}-channel latent")]
    ChannelOutOfRange { channel: i64, channels: usize },

    #[error("up radius {radius} does not fit a {size}x{size} latent")]
    RadiusTooLarge { radius: usize, size: usize },
}
