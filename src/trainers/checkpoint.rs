//! Watermark checkpoints: safetensors weights plus a JSON training state

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{serialize, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::watermark::{ComplexLatent, WatermarkMask, WatermarkOptions};

pub const WATERMARK_FILE: &str = "watermark.safetensors";
pub const FINAL_WATERMARK_FILE: &str = "watermark_final.safetensors";
pub const STATE_FILE: &str = "training_state.json";

const KEY_REAL: &str = "watermark.real";
const KEY_IMAG: &str = "watermark.imag";
const KEY_MASK: &str = "mask";
const KEY_GUIDANCE: &str = "guidance_embedding";

#[derive(Debug, Clone)]
pub struct WatermarkCheckpoint {
    pub watermark: ComplexLatent,
    pub mask: Tensor,
    pub guidance_embedding: Option<Tensor>,
    pub metadata: HashMap<String, String>,
}

/// Metadata entries describing how the watermark is placed and measured.
pub fn watermark_metadata(options: &WatermarkOptions) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("w_seed".to_string(), options.seed.to_string());
    metadata.insert("w_channel".to_string(), options.channel.to_string());
    metadata.insert("w_pattern".to_string(), options.pattern.to_string());
    metadata.insert("w_mask_shape".to_string(), options.mask_shape.to_string());
    metadata.insert("w_up_radius".to_string(), options.up_radius.to_string());
    metadata.insert("w_low_radius".to_string(), options.low_radius.to_string());
    metadata.insert("w_measurement".to_string(), options.measurement.to_string());
    metadata.insert("w_injection".to_string(), options.injection.to_string());
    metadata.insert("w_pattern_const".to_string(), options.pattern_const.to_string());
    metadata
}

impl WatermarkCheckpoint {
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut entries = vec![
            (KEY_REAL, &self.watermark.re),
            (KEY_IMAG, &self.watermark.im),
            (KEY_MASK, &self.mask),
        ];
        if let Some(guidance) = &self.guidance_embedding {
            entries.push((KEY_GUIDANCE, guidance));
        }

        let mut tensor_info = Vec::with_capacity(entries.len());
        let mut tensor_data = Vec::with_capacity(entries.len());
        for (name, tensor) in entries {
            let (dtype, bytes) = tensor_bytes(tensor)?;
            tensor_info.push((name, dtype, tensor.dims().to_vec()));
            tensor_data.push(bytes);
        }

        let mut tensors = HashMap::new();
        for ((name, dtype, shape), data) in tensor_info.into_iter().zip(&tensor_data) {
            tensors.insert(name.to_string(), TensorView::new(dtype, shape, data)?);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serialize(&tensors, &Some(self.metadata.clone()))?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write watermark checkpoint: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let buffer = fs::read(path)
            .with_context(|| format!("Failed to read watermark checkpoint: {}", path.display()))?;
        let (_, header) = SafeTensors::read_metadata(&buffer)?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let mut tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
        let mut take = |key: &str| {
            tensors
                .remove(key)
                .with_context(|| format!("{} missing `{}`", path.display(), key))
        };
        let re = take(KEY_REAL)?;
        let im = take(KEY_IMAG)?;
        let mask = take(KEY_MASK)?;
        let guidance_embedding = tensors.remove(KEY_GUIDANCE);

        Ok(Self {
            watermark: ComplexLatent::new(re, im),
            mask,
            guidance_embedding,
            metadata,
        })
    }

    pub fn mask(&self) -> Result<WatermarkMask> {
        WatermarkMask::from_tensor(self.mask.clone())
    }
}

fn tensor_bytes(tensor: &Tensor) -> Result<(safetensors::Dtype, Vec<u8>)> {
    let flat = tensor.flatten_all()?;
    match tensor.dtype() {
        DType::U8 => Ok((safetensors::Dtype::U8, flat.to_vec1::<u8>()?)),
        _ => {
            let values = flat.to_dtype(DType::F32)?.to_vec1::<f32>()?;
            let mut bytes = Vec::with_capacity(values.len() * 4);
            for v in values {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            Ok((safetensors::Dtype::F32, bytes))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub step: usize,
    pub loss: f32,
    pub retain_loss: f32,
    pub watermark_loss: f32,
    pub learning_rate: f64,
    pub run_name: String,
    pub model_id: String,
}

impl TrainingState {
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(STATE_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(STATE_FILE);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read training state: {}", path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::{WatermarkPattern, PatternKind};
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_save_and_load() -> Result<()> {
        let tmp = TempDir::new()?;
        let device = Device::Cpu;
        let options = WatermarkOptions { up_radius: 3, low_radius: 1, pattern: PatternKind::Ring, ..Default::default() };
        let mask = WatermarkMask::generate(&[1, 4, 8, 8], &options, &device)?;
        let pattern = WatermarkPattern::generate(&[1, 4, 8, 8], &options, &device)?;

        let checkpoint = WatermarkCheckpoint {
            watermark: pattern.values().clone(),
            mask: mask.tensor().clone(),
            guidance_embedding: Some(Tensor::ones((1, 2, 4), DType::F32, &device)?),
            metadata: watermark_metadata(&options),
        };
        let path = tmp.path().join("checkpoint-1").join(WATERMARK_FILE);
        checkpoint.save(&path)?;

        let loaded = WatermarkCheckpoint::load(&path, &device)?;
        assert_eq!(loaded.metadata.get("w_pattern").map(String::as_str), Some("ring"));
        assert_eq!(loaded.metadata.get("w_up_radius").map(String::as_str), Some("3"));
        assert_eq!(loaded.mask.dtype(), DType::U8);
        assert_eq!(loaded.mask()?.selected(), mask.selected());
        assert_eq!(
            loaded.watermark.re.flatten_all()?.to_vec1::<f32>()?,
            pattern.values().re.flatten_all()?.to_vec1::<f32>()?
        );
        assert_eq!(loaded.guidance_embedding.map(|g| g.dims().to_vec()), Some(vec![1, 2, 4]));
        Ok(())
    }

    #[test]
    fn test_load_without_guidance() -> Result<()> {
        let tmp = TempDir::new()?;
        let device = Device::Cpu;
        let zeros = Tensor::zeros((1, 1, 2, 2), DType::F32, &device)?;
        let checkpoint = WatermarkCheckpoint {
            watermark: ComplexLatent::new(zeros.clone(), zeros),
            mask: Tensor::zeros((1, 1, 2, 2), DType::U8, &device)?,
            guidance_embedding: None,
            metadata: HashMap::new(),
        };
        let path = tmp.path().join(FINAL_WATERMARK_FILE);
        checkpoint.save(&path)?;
        let loaded = WatermarkCheckpoint::load(&path, &device)?;
        assert!(loaded.guidance_embedding.is_none());
        assert!(loaded.metadata.is_empty());
        Ok(())
    }

    #[test]
    fn test_training_state_round_trip() -> Result<()> {
        let tmp = TempDir::new()?;
        let state = TrainingState {
            step: 500,
            loss: 0.25,
            retain_loss: 0.05,
            watermark_loss: 0.2,
            learning_rate: 5e-4,
            run_name: "test".to_string(),
            model_id: "stabilityai/stable-diffusion-2-1-base".to_string(),
        };
        let path = state.save(tmp.path())?;
        assert!(path.ends_with(STATE_FILE));
        assert_eq!(TrainingState::load(tmp.path())?, state);
        Ok(())
    }
}
