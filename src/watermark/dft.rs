//! Centred 2-D discrete Fourier transform
//!
//! candle has no FFT op, so the transform is written as two matrix products
//! with precomputed (row-shifted) DFT matrices. This keeps it on the autograd
//! tape. `fft2_shifted_host` is the rustfft equivalent for host-side work.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use num_complex::Complex32;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Real and imaginary parts of a complex latent, same shape each.
#[derive(Debug, Clone)]
pub struct ComplexLatent {
    pub re: Tensor,
    pub im: Tensor,
}

impl ComplexLatent {
    pub fn new(re: Tensor, im: Tensor) -> Self {
        Self { re, im }
    }

    pub fn dims(&self) -> &[usize] {
        self.re.dims()
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            re: self.re.to_device(device)?,
            im: self.im.to_device(device)?,
        })
    }
}

/// Frequency index held by row `k` after `fftshift`.
fn shifted_frequency(k: usize, n: usize) -> usize {
    (k + n - n / 2) % n
}

/// Row-shifted DFT matrix `G = P F` as (real, imaginary) row-major buffers.
fn shifted_dft_matrix(n: usize) -> (Vec<f32>, Vec<f32>) {
    let mut re = Vec::with_capacity(n * n);
    let mut im = Vec::with_capacity(n * n);
    for k in 0..n {
        let f = shifted_frequency(k, n);
        for j in 0..n {
            let theta = 2.0 * PI * ((f * j) % n) as f64 / n as f64;
            re.push(theta.cos() as f32);
            im.push(-theta.sin() as f32);
        }
    }
    (re, im)
}

/// `fftshift(fft2(x))` and `ifft2(ifftshift(X)).real` over the last two dims.
pub struct Dft2 {
    height: usize,
    width: usize,
    h_re: Tensor,
    h_im: Tensor,
    h_re_t: Tensor,
    h_im_t: Tensor,
    w_re: Tensor,
    w_im: Tensor,
    w_re_t: Tensor,
    w_im_t: Tensor,
}

impl Dft2 {
    pub fn new(height: usize, width: usize, device: &Device) -> Result<Self> {
        let (h_re, h_im) = shifted_dft_matrix(height);
        let (w_re, w_im) = shifted_dft_matrix(width);
        let h_re = Tensor::from_vec(h_re, (height, height), device)?;
        let h_im = Tensor::from_vec(h_im, (height, height), device)?;
        let w_re = Tensor::from_vec(w_re, (width, width), device)?;
        let w_im = Tensor::from_vec(w_im, (width, width), device)?;

        Ok(Self {
            height,
            width,
            h_re_t: h_re.t()?.contiguous()?,
            h_im_t: h_im.t()?.contiguous()?,
            w_re_t: w_re.t()?.contiguous()?,
            w_im_t: w_im.t()?.contiguous()?,
            h_re,
            h_im,
            w_re,
            w_im,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Centred spectrum of a real tensor `[..., H, W]`.
    pub fn forward(&self, x: &Tensor) -> Result<ComplexLatent> {
        let dims = x.dims().to_vec();
        let x = self.flatten(x)?;

        let a_re = self.h_re.broadcast_matmul(&x)?;
        let a_im = self.h_im.broadcast_matmul(&x)?;

        let re = (a_re.broadcast_matmul(&self.w_re_t)? - a_im.broadcast_matmul(&self.w_im_t)?)?;
        let im = (a_re.broadcast_matmul(&self.w_im_t)? + a_im.broadcast_matmul(&self.w_re_t)?)?;

        Ok(ComplexLatent {
            re: re.reshape(dims.as_slice())?,
            im: im.reshape(dims.as_slice())?,
        })
    }

    /// Real part of the inverse of [`Dft2::forward`].
    pub fn inverse_real(&self, spectrum: &ComplexLatent) -> Result<Tensor> {
        let dims = spectrum.dims().to_vec();
        let y_re = self.flatten(&spectrum.re)?;
        let y_im = self.flatten(&spectrum.im)?;

        let b_re = (self.h_re_t.broadcast_matmul(&y_re)? + self.h_im_t.broadcast_matmul(&y_im)?)?;
        let b_im = (self.h_re_t.broadcast_matmul(&y_im)? - self.h_im_t.broadcast_matmul(&y_re)?)?;

        let x = (b_re.broadcast_matmul(&self.w_re)? + b_im.broadcast_matmul(&self.w_im)?)?;
        let x = (x / (self.height * self.width) as f64)?;
        Ok(x.reshape(dims.as_slice())?)
    }

    fn flatten(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims();
        let rank = dims.len();
        if rank < 2 || dims[rank - 2] != self.height || dims[rank - 1] != self.width {
            anyhow::bail!(
                "Dft2 built for {}x{} got tensor of shape {:?}",
                self.height,
                self.width,
                dims
            );
        }
        let batch: usize = dims[..rank - 2].iter().product();
        Ok(x.to_dtype(DType::F32)?
            .reshape((batch, self.height, self.width))?
            .contiguous()?)
    }
}

/// Host `fftshift(fft2(x))` of one row-major `h x w` plane.
pub fn fft2_shifted_host(plane: &[f32], height: usize, width: usize) -> Vec<Complex32> {
    assert_eq!(plane.len(), height * width);
    let mut planner = FftPlanner::<f32>::new();
    let row_fft = planner.plan_fft_forward(width);
    let col_fft = planner.plan_fft_forward(height);

    let mut data: Vec<Complex32> = plane.iter().map(|&v| Complex32::new(v, 0.0)).collect();
    for row in data.chunks_mut(width) {
        row_fft.process(row);
    }

    let mut column = vec![Complex32::new(0.0, 0.0); height];
    for c in 0..width {
        for r in 0..height {
            column[r] = data[r * width + c];
        }
        col_fft.process(&mut column);
        for r in 0..height {
            data[r * width + c] = column[r];
        }
    }

    let mut shifted = vec![Complex32::new(0.0, 0.0); height * width];
    for r in 0..height {
        let src_r = shifted_frequency(r, height);
        for c in 0..width {
            shifted[r * width + c] = data[src_r * width + shifted_frequency(c, width)];
        }
    }
    shifted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(h: usize, w: usize) -> Vec<f32> {
        (0..h * w).map(|i| ((i * 7 % 11) as f32 - 5.0) / 3.0).collect()
    }

    #[test]
    fn test_shifted_frequency_matches_fftshift() {
        // numpy.fft.fftshift(arange(4)) == [2, 3, 0, 1]
        let even: Vec<usize> = (0..4).map(|k| shifted_frequency(k, 4)).collect();
        assert_eq!(even, vec![2, 3, 0, 1]);
        // numpy.fft.fftshift(arange(5)) == [3, 4, 0, 1, 2]
        let odd: Vec<usize> = (0..5).map(|k| shifted_frequency(k, 5)).collect();
        assert_eq!(odd, vec![3, 4, 0, 1, 2]);
    }

    #[test]
    fn test_matches_host_fft() -> Result<()> {
        let (h, w) = (6, 8);
        let data = plane(h, w);
        let reference = fft2_shifted_host(&data, h, w);

        let dft = Dft2::new(h, w, &Device::Cpu)?;
        let x = Tensor::from_vec(data, (1, 1, h, w), &Device::Cpu)?;
        let spectrum = dft.forward(&x)?;
        let re = spectrum.re.flatten_all()?.to_vec1::<f32>()?;
        let im = spectrum.im.flatten_all()?.to_vec1::<f32>()?;

        for (i, z) in reference.iter().enumerate() {
            assert!((re[i] - z.re).abs() < 1e-3, "re[{}]: {} vs {}", i, re[i], z.re);
            assert!((im[i] - z.im).abs() < 1e-3, "im[{}]: {} vs {}", i, im[i], z.im);
        }
        Ok(())
    }

    #[test]
    fn test_dc_component_is_centred() {
        let data = vec![1.0f32; 16];
        let spectrum = fft2_shifted_host(&data, 4, 4);
        assert!((spectrum[2 * 4 + 2].re - 16.0).abs() < 1e-4);
        let rest: f32 = spectrum.iter().map(|z| z.norm()).sum::<f32>() - 16.0;
        assert!(rest.abs() < 1e-3);
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let dft = Dft2::new(8, 8, &Device::Cpu)?;
        let x = Tensor::from_vec(plane(8, 8), (1, 1, 8, 8), &Device::Cpu)?
            .broadcast_as((2, 3, 8, 8))?
            .contiguous()?;
        let back = dft.inverse_real(&dft.forward(&x)?)?;
        assert_eq!(back.dims(), &[2, 3, 8, 8]);
        let err = (back - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(err < 1e-4, "round trip error {}", err);
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_shape() -> Result<()> {
        let dft = Dft2::new(4, 4, &Device::Cpu)?;
        let x = Tensor::zeros((1, 4, 5), DType::F32, &Device::Cpu)?;
        assert!(dft.forward(&x).is_err());
        Ok(())
    }
}
