//! Watermark placement masks

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use super::{MaskShape, WatermarkOptions};

/// Disc of radius `r` around the centre of a `size x size` grid, row-major.
///
/// The row axis is flipped before measuring distances, matching the
/// `ogrid`-based construction used by ring watermarks.
pub fn circle_mask(size: usize, r: usize) -> Vec<bool> {
    let centre = (size / 2) as i64;
    let r2 = (r * r) as i64;
    let mut mask = Vec::with_capacity(size * size);
    for row in 0..size {
        let y = (size - 1 - row) as i64;
        for x in 0..size as i64 {
            let dx = x - centre;
            let dy = y - centre;
            mask.push(dx * dx + dy * dy <= r2);
        }
    }
    mask
}

/// Boolean mask over a `[1, C, H, W]` latent, stored as u8.
#[derive(Debug, Clone)]
pub struct WatermarkMask {
    tensor: Tensor,
    selected: usize,
}

impl WatermarkMask {
    /// Build the mask for a latent of shape `[.., C, H, W]`.
    pub fn generate(latent_dims: &[usize], options: &WatermarkOptions, device: &Device) -> Result<Self> {
        let rank = latent_dims.len();
        anyhow::ensure!(rank >= 3, "latent must be at least [C, H, W], got {:?}", latent_dims);
        let (channels, height, width) = (latent_dims[rank - 3], latent_dims[rank - 2], latent_dims[rank - 1]);
        options.validate(channels, height.min(width))?;

        let plane = match options.mask_shape {
            MaskShape::Circle => {
                let up = circle_mask(width, options.up_radius);
                let low = circle_mask(width, options.low_radius);
                let band: Vec<bool> = up.iter().zip(&low).map(|(u, l)| u ^ l).collect();
                crop_rows(band, width, height)
            }
            MaskShape::Square => {
                let anchor = width / 2;
                let r = options.up_radius;
                let mut plane = vec![false; height * width];
                for row in anchor - r..(anchor + r).min(height) {
                    for col in anchor - r..(anchor + r).min(width) {
                        plane[row * width + col] = true;
                    }
                }
                plane
            }
            MaskShape::No => vec![false; height * width],
        };

        let covered = options.channels(channels);
        let mut data = vec![0u8; channels * height * width];
        for &c in &covered {
            let offset = c * height * width;
            for (i, &on) in plane.iter().enumerate() {
                data[offset + i] = on as u8;
            }
        }
        let selected = data.iter().filter(|&&v| v == 1).count();

        Ok(Self {
            tensor: Tensor::from_vec(data, (1, channels, height, width), device)?,
            selected,
        })
    }

    /// Rebuild a mask from a stored u8 tensor.
    pub fn from_tensor(tensor: Tensor) -> Result<Self> {
        let tensor = tensor.to_dtype(DType::U8)?;
        let selected = tensor.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()? as usize;
        Ok(Self { tensor, selected })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn dims(&self) -> &[usize] {
        self.tensor.dims()
    }

    /// Number of selected positions across all channels.
    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            tensor: self.tensor.to_device(device)?,
            selected: self.selected,
        })
    }

    /// Mask broadcast to `dims`, as u8 (for `where_cond`).
    pub fn broadcast_as(&self, dims: &[usize]) -> Result<Tensor> {
        Ok(self.tensor.broadcast_as(dims)?)
    }

    /// Mask broadcast to `dims`, as f32 weights.
    pub fn weights(&self, dims: &[usize]) -> Result<Tensor> {
        Ok(self.tensor.to_dtype(DType::F32)?.broadcast_as(dims)?)
    }
}

/// Take the first `height` rows of a square `width x width` plane.
fn crop_rows(plane: Vec<bool>, width: usize, height: usize) -> Vec<bool> {
    if height >= width {
        let mut out = plane;
        out.resize(height * width, false);
        out
    } else {
        plane[..height * width].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_mask_counts() {
        // radius 0 selects only the centre
        let dot = circle_mask(8, 0);
        assert_eq!(dot.iter().filter(|&&b| b).count(), 1);
        // row flip: centre (4, 4) in ogrid coordinates is row 8 - 1 - 4 = 3
        assert!(dot[3 * 8 + 4]);

        let disc = circle_mask(8, 1);
        assert_eq!(disc.iter().filter(|&&b| b).count(), 5);
    }

    #[test]
    fn test_circle_band_excludes_inner_disc() -> Result<()> {
        let options = WatermarkOptions { up_radius: 3, low_radius: 1, ..Default::default() };
        let mask = WatermarkMask::generate(&[1, 4, 8, 8], &options, &Device::Cpu)?;
        assert_eq!(mask.dims(), &[1, 4, 8, 8]);

        let up = circle_mask(8, 3).iter().filter(|&&b| b).count();
        let low = circle_mask(8, 1).iter().filter(|&&b| b).count();
        assert_eq!(mask.selected(), up - low);

        let values = mask.tensor().flatten_all()?.to_vec1::<u8>()?;
        // only channel 0 is covered, centre is excluded
        assert!(values[64..].iter().all(|&v| v == 0));
        assert_eq!(values[3 * 8 + 4], 0);
        Ok(())
    }

    #[test]
    fn test_square_and_no_masks() -> Result<()> {
        let square = WatermarkOptions {
            mask_shape: MaskShape::Square,
            up_radius: 2,
            low_radius: 0,
            channel: -1,
            ..Default::default()
        };
        let mask = WatermarkMask::generate(&[1, 4, 8, 8], &square, &Device::Cpu)?;
        assert_eq!(mask.selected(), 4 * 16);

        let none = WatermarkOptions { mask_shape: MaskShape::No, up_radius: 2, low_radius: 0, ..Default::default() };
        let mask = WatermarkMask::generate(&[1, 4, 8, 8], &none, &Device::Cpu)?;
        assert_eq!(mask.selected(), 0);
        Ok(())
    }

    #[test]
    fn test_from_tensor_recounts() -> Result<()> {
        let options = WatermarkOptions { up_radius: 3, low_radius: 0, channel: -1, ..Default::default() };
        let mask = WatermarkMask::generate(&[1, 2, 8, 8], &options, &Device::Cpu)?;
        let restored = WatermarkMask::from_tensor(mask.tensor().clone())?;
        assert_eq!(restored.selected(), mask.selected());
        Ok(())
    }
}
