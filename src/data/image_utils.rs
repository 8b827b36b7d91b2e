//! Conversions between `image` buffers and candle tensors

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use std::path::Path;

/// Convert an RGB image to a `[3, H, W]` f32 tensor in `[-1, 1]`.
pub fn image_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    let data = img.as_raw().clone();
    let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2.0 / 255.0, -1.0)?;
    Ok(tensor)
}

/// Save a `[3, H, W]` tensor in `[-1, 1]` as an image.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let tensor = ((tensor.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = tensor.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3()
        .context("Expected 3D tensor [C, H, W]")?;
    if channel != 3 {
        anyhow::bail!("Expected 3 channels (RGB), got {}", channel);
    }

    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let img = RgbImage::from_raw(width as u32, height as u32, data)
        .context("Failed to create image buffer")?;

    let path = path.as_ref();
    match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => img.save_with_format(path, image::ImageFormat::Jpeg)?,
        _ => img.save_with_format(path, image::ImageFormat::Png)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pixel_range() -> Result<()> {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgb([0, 255, 0]));
        img.put_pixel(1, 0, image::Rgb([255, 0, 255]));

        let t = image_to_tensor(&img, &Device::Cpu)?;
        assert_eq!(t.dims(), &[3, 1, 2]);
        let values = t.flatten_all()?.to_vec1::<f32>()?;
        let expected = [-1.0f32, 1.0, 1.0, -1.0, -1.0, 1.0];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-5, "{} vs {}", v, e);
        }
        Ok(())
    }

    #[test]
    fn test_save_reload() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("sample.png");
        let t = Tensor::new(&[[[-1f32, 1.0]], [[1.0, -1.0]], [[-1.0, -1.0]]], &Device::Cpu)?;
        save_image(&t, &path)?;

        let img = image::open(&path)?.to_rgb8();
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0).0, [0, 255, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [255, 0, 0]);
        Ok(())
    }
}
