//! Watermark injection into latents

use anyhow::Result;
use candle_core::{DType, Tensor};

use super::dft::{ComplexLatent, Dft2};
use super::mask::WatermarkMask;
use super::Injection;

/// Replace the masked part of `latents` (`[B, C, H, W]`) with `pattern`.
///
/// `complex` writes into the centred spectrum and returns the real part of
/// the inverse transform; `seed` writes straight into latent space using the
/// pattern's real part. The result is f32 and stays differentiable in both the
/// latents and the pattern.
pub fn inject_watermark(
    latents: &Tensor,
    mask: &WatermarkMask,
    pattern: &ComplexLatent,
    injection: Injection,
    dft: &Dft2,
) -> Result<Tensor> {
    let latents = latents.to_dtype(DType::F32)?;
    let dims = latents.dims().to_vec();
    let selected = mask.broadcast_as(&dims)?;
    let pattern_re = pattern.re.broadcast_as(dims.as_slice())?;

    match injection {
        Injection::Complex => {
            let spectrum = dft.forward(&latents)?;
            let pattern_im = pattern.im.broadcast_as(dims.as_slice())?;
            let injected = ComplexLatent::new(
                selected.where_cond(&pattern_re, &spectrum.re)?,
                selected.where_cond(&pattern_im, &spectrum.im)?,
            );
            dft.inverse_real(&injected)
        }
        Injection::Seed => Ok(selected.where_cond(&pattern_re, &latents)?),
    }
}
