//! Diffusion backends the watermark optimizer drives
//!
//! The optimizer only needs text conditioning, the VAE in both directions and
//! a noise predictor. `StableDiffusionBackend` provides them from pretrained
//! weights; tests use a small analytic backend.

pub mod stable_diffusion;

#[cfg(test)]
pub(crate) mod testing;

pub use stable_diffusion::StableDiffusionBackend;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

pub trait DiffusionBackend {
    fn device(&self) -> &Device;

    /// Precision the models run in.
    fn dtype(&self) -> DType;

    /// Shape of one generation latent, `[1, C, h, w]`.
    fn latent_dims(&self) -> [usize; 4];

    /// Text embeddings `[B, seq, dim]` for a batch of prompts.
    fn encode_prompts(&self, prompts: &[String]) -> Result<Tensor>;

    /// Pixels `[B, 3, H, W]` in `[-1, 1]` to scaled latents.
    fn encode_images(&self, pixels: &Tensor) -> Result<Tensor>;

    /// Scaled latents back to pixels in `[-1, 1]`.
    fn decode_latents(&self, latents: &Tensor) -> Result<Tensor>;

    /// Noise prediction at `timestep`. Inputs and output are f32.
    fn predict_noise(&self, latents: &Tensor, timestep: usize, text_embeddings: &Tensor) -> Result<Tensor>;

    fn random_latents(&self, rng: &mut StdRng) -> Result<Tensor> {
        gaussian_latents(&self.latent_dims(), rng, self.device())
    }
}

/// `len` standard normal samples.
pub fn gaussian_values(len: usize, rng: &mut impl Rng) -> Vec<f32> {
    (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
}

/// Standard normal f32 tensor drawn from a seeded generator.
pub fn gaussian_latents(dims: &[usize], rng: &mut impl Rng, device: &Device) -> Result<Tensor> {
    let len = dims.iter().product();
    Ok(Tensor::from_vec(gaussian_values(len, rng), dims, device)?)
}
