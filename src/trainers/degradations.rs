//! Differentiable image degradations applied between generation and
//! watermark extraction

use anyhow::Result;
use candle_core::Tensor;
use log::debug;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::pipeline::gaussian_latents;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
    /// Chance a batch goes through untouched
    pub identity_prob: f64,
    pub noise_std: f64,
    /// Largest relative brightness change, either direction
    pub brightness: f64,
    pub blur_sigma: f64,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            identity_prob: 0.25,
            noise_std: 0.05,
            brightness: 0.2,
            blur_sigma: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Degradation {
    Identity,
    GaussianNoise { std: f64 },
    Brightness { factor: f64 },
    GaussianBlur { sigma: f64 },
}

impl Degradation {
    pub fn sample(config: &AttackConfig, rng: &mut StdRng) -> Self {
        if rng.gen_bool(config.identity_prob.clamp(0.0, 1.0)) {
            return Degradation::Identity;
        }
        match rng.gen_range(0..3) {
            0 => Degradation::GaussianNoise { std: config.noise_std },
            1 => {
                let delta = if config.brightness > 0.0 {
                    rng.gen_range(-config.brightness..=config.brightness)
                } else {
                    0.0
                };
                Degradation::Brightness { factor: 1.0 + delta }
            }
            _ => Degradation::GaussianBlur { sigma: config.blur_sigma },
        }
    }

    /// Apply to `[B, 3, H, W]` images in `[-1, 1]`.
    pub fn apply(&self, images: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        debug!("Applying degradation {:?}", self);
        match *self {
            Degradation::Identity => Ok(images.clone()),
            Degradation::GaussianNoise { std } => {
                let noise = gaussian_latents(images.dims(), rng, images.device())?;
                Ok((images + (noise * std)?)?)
            }
            // scale in [0, 1] space: (x + 1) * f - 1
            Degradation::Brightness { factor } => Ok(images.affine(factor, factor - 1.0)?),
            Degradation::GaussianBlur { sigma } => {
                if sigma <= 0.0 {
                    return Ok(images.clone());
                }
                let channels = images.dim(1)?;
                let kernel = gaussian_kernel(sigma);
                let k = kernel.len();
                let weights: Vec<f32> = kernel
                    .iter()
                    .flat_map(|&a| kernel.iter().map(move |&b| a * b))
                    .collect();
                let weights = Tensor::from_vec(weights, (1, 1, k, k), images.device())?
                    .to_dtype(images.dtype())?
                    .repeat((channels, 1, 1, 1))?;
                Ok(images.conv2d(&weights, k / 2, 1, 1, channels)?)
            }
        }
    }
}

/// Normalised 1-D gaussian of odd length `2 * ceil(2 sigma) + 1`.
pub fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let half = (2.0 * sigma).ceil().max(1.0) as i64;
    let raw: Vec<f64> = (-half..=half)
        .map(|x| (-(x * x) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.iter().map(|v| (v / sum) as f32).collect()
}
