//! Initial watermark patterns

use anyhow::Result;
use candle_core::{Device, Tensor};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::dft::{fft2_shifted_host, ComplexLatent};
use super::mask::circle_mask;
use super::{PatternKind, WatermarkOptions};
use crate::pipeline::gaussian_values;

/// Watermark pattern in the injection domain, `[1, C, H, W]` re + im.
#[derive(Debug, Clone)]
pub struct WatermarkPattern {
    kind: PatternKind,
    values: ComplexLatent,
}

impl WatermarkPattern {
    /// Generate the initial pattern for a `[.., C, H, W]` latent, seeded by the
    /// watermark seed.
    pub fn generate(latent_dims: &[usize], options: &WatermarkOptions, device: &Device) -> Result<Self> {
        let rank = latent_dims.len();
        anyhow::ensure!(rank >= 3, "latent must be at least [C, H, W], got {:?}", latent_dims);
        let (channels, height, width) = (latent_dims[rank - 3], latent_dims[rank - 2], latent_dims[rank - 1]);
        let plane = height * width;

        let mut rng = StdRng::seed_from_u64(options.seed);
        let init = gaussian_values(channels * plane, &mut rng);
        let rings = (options.low_radius + 1..=options.up_radius).rev();

        let values: Vec<Complex32> = match options.pattern {
            PatternKind::SeedZeros | PatternKind::Zeros => vec![Complex32::new(0.0, 0.0); channels * plane],
            PatternKind::SeedRand => init.iter().map(|&v| Complex32::new(v, 0.0)).collect(),
            PatternKind::Const => {
                vec![Complex32::new(options.pattern_const as f32, 0.0); channels * plane]
            }
            PatternKind::SeedRing => {
                let source: Vec<Complex32> = init.iter().map(|&v| Complex32::new(v, 0.0)).collect();
                paint_rings(&source, channels, height, width, rings)
            }
            PatternKind::Rand => spectrum(&init, channels, height, width),
            PatternKind::Ring => {
                let source = spectrum(&init, channels, height, width);
                paint_rings(&source, channels, height, width, rings)
            }
        };

        let re: Vec<f32> = values.iter().map(|z| z.re).collect();
        let im: Vec<f32> = values.iter().map(|z| z.im).collect();
        let shape = (1, channels, height, width);

        Ok(Self {
            kind: options.pattern,
            values: ComplexLatent::new(
                Tensor::from_vec(re, shape, device)?,
                Tensor::from_vec(im, shape, device)?,
            ),
        })
    }

    pub fn from_parts(kind: PatternKind, values: ComplexLatent) -> Self {
        Self { kind, values }
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn values(&self) -> &ComplexLatent {
        &self.values
    }

    pub fn into_values(self) -> ComplexLatent {
        self.values
    }
}

fn spectrum(init: &[f32], channels: usize, height: usize, width: usize) -> Vec<Complex32> {
    let plane = height * width;
    (0..channels)
        .flat_map(|c| fft2_shifted_host(&init[c * plane..(c + 1) * plane], height, width))
        .collect()
}

/// Overwrite concentric discs, largest first, each with the value found at
/// `(row 0, col r)` of its channel in `source`. What remains is a set of
/// constant-valued rings.
fn paint_rings(
    source: &[Complex32],
    channels: usize,
    height: usize,
    width: usize,
    radii: impl Iterator<Item = usize>,
) -> Vec<Complex32> {
    let plane = height * width;
    let mut out = source.to_vec();
    for r in radii {
        let disc = circle_mask(width, r);
        for c in 0..channels {
            let value = source[c * plane + r.min(width - 1)];
            for (i, &on) in disc.iter().take(plane).enumerate() {
                if on {
                    out[c * plane + i] = value;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pattern: PatternKind) -> WatermarkOptions {
        WatermarkOptions {
            pattern,
            up_radius: 3,
            low_radius: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_seeded_generation_is_deterministic() -> Result<()> {
        let a = WatermarkPattern::generate(&[1, 4, 8, 8], &options(PatternKind::Rand), &Device::Cpu)?;
        let b = WatermarkPattern::generate(&[1, 4, 8, 8], &options(PatternKind::Rand), &Device::Cpu)?;
        let a = a.values().re.flatten_all()?.to_vec1::<f32>()?;
        let b = b.values().re.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_const_and_zeros() -> Result<()> {
        let mut opts = options(PatternKind::Const);
        opts.pattern_const = 2.5;
        let pattern = WatermarkPattern::generate(&[1, 2, 8, 8], &opts, &Device::Cpu)?;
        let re = pattern.values().re.flatten_all()?.to_vec1::<f32>()?;
        assert!(re.iter().all(|&v| v == 2.5));
        let im = pattern.values().im.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(im, 0.0);

        let zeros = WatermarkPattern::generate(&[1, 2, 8, 8], &options(PatternKind::Zeros), &Device::Cpu)?;
        assert_eq!(zeros.values().re.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_ring_is_constant_per_radius() -> Result<()> {
        let pattern = WatermarkPattern::generate(&[1, 1, 8, 8], &options(PatternKind::Ring), &Device::Cpu)?;
        let re = pattern.values().re.flatten_all()?.to_vec1::<f32>()?;

        // Positions at distance 2 from the centre (ogrid coordinates) share one value.
        let ring2: Vec<f32> = circle_mask(8, 2)
            .iter()
            .zip(circle_mask(8, 1))
            .enumerate()
            .filter(|(_, (outer, inner))| **outer && !*inner)
            .map(|(i, _)| re[i])
            .collect();
        assert!(!ring2.is_empty());
        assert!(ring2.iter().all(|&v| v == ring2[0]));
        Ok(())
    }

    #[test]
    fn test_seed_patterns_are_real() -> Result<()> {
        for kind in [PatternKind::SeedRand, PatternKind::SeedRing] {
            let pattern = WatermarkPattern::generate(&[1, 4, 8, 8], &options(kind), &Device::Cpu)?;
            assert!(pattern.kind().is_spatial());
            assert_eq!(pattern.values().im.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        }
        Ok(())
    }
}
