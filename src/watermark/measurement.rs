//! Distance between a latent and the watermark it should carry

use anyhow::Result;
use candle_core::{DType, Tensor};

use super::dft::{ComplexLatent, Dft2};
use super::mask::WatermarkMask;
use super::Measurement;

const MODULUS_EPS: f64 = 1e-12;

/// Mean masked distance between `latents` (`[B, C, H, W]`) and `pattern`.
///
/// `l1_complex` compares the centred spectrum by complex modulus,
/// `l1_seed` compares latent values directly. Returns a scalar f32 tensor;
/// an empty mask yields zero.
pub fn watermark_distance(
    latents: &Tensor,
    mask: &WatermarkMask,
    pattern: &ComplexLatent,
    measurement: Measurement,
    dft: &Dft2,
) -> Result<Tensor> {
    let latents = latents.to_dtype(DType::F32)?;
    let dims = latents.dims().to_vec();
    let batch = dims[0];
    let weights = mask.weights(&dims)?;

    if mask.selected() == 0 {
        return Ok(Tensor::zeros((), DType::F32, latents.device())?);
    }

    let distance = match measurement {
        Measurement::L1Complex => {
            let spectrum = dft.forward(&latents)?;
            let d_re = spectrum.re.broadcast_sub(&pattern.re)?;
            let d_im = spectrum.im.broadcast_sub(&pattern.im)?;
            ((d_re.sqr()? + d_im.sqr()?)? + MODULUS_EPS)?.sqrt()?
        }
        Measurement::L1Seed => latents.broadcast_sub(&pattern.re)?.abs()?,
    };

    let total = (distance * weights)?.sum_all()?;
    Ok((total / (mask.selected() * batch) as f64)?)
}
