use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use super::DiffusionBackend;

/// Cheap differentiable stand-in for Stable Diffusion: average-pool VAE,
/// linear noise predictor and length-derived prompt embeddings.
pub struct ToyBackend {
    device: Device,
    image_size: usize,
}

impl ToyBackend {
    pub fn new(image_size: usize) -> Self {
        Self {
            device: Device::Cpu,
            image_size,
        }
    }
}

impl DiffusionBackend for ToyBackend {
    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn latent_dims(&self) -> [usize; 4] {
        [1, 4, self.image_size / 8, self.image_size / 8]
    }

    fn encode_prompts(&self, prompts: &[String]) -> Result<Tensor> {
        let rows = prompts
            .iter()
            .map(|p| Tensor::full((p.len() % 7) as f32 / 7.0, (1, 2, 4), &self.device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&rows, 0)?)
    }

    fn encode_images(&self, pixels: &Tensor) -> Result<Tensor> {
        let pooled = pixels.avg_pool2d(8)?;
        let mean = pooled.mean_keepdim(1)?;
        Ok((Tensor::cat(&[pooled, mean], 1)? * 0.5)?)
    }

    fn decode_latents(&self, latents: &Tensor) -> Result<Tensor> {
        let rgb = latents.narrow(1, 0, 3)?;
        let up = rgb.upsample_nearest2d(self.image_size, self.image_size)?;
        Ok((up * 2.0)?)
    }

    fn predict_noise(&self, latents: &Tensor, timestep: usize, text_embeddings: &Tensor) -> Result<Tensor> {
        let cond = text_embeddings.mean_keepdim(2)?.mean_keepdim(1)?.unsqueeze(3)?;
        let scale = 0.1 + timestep as f64 * 1e-4;
        Ok(((latents * scale)?.broadcast_add(&(cond * 0.05)?))?)
    }
}
