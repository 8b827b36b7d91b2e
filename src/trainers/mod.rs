pub mod args;
pub mod checkpoint;
pub mod ddim_scheduler;
pub mod degradations;
pub mod tracking;
pub mod watermark_trainer;

// Re-export key types
pub use args::TrainArgs;
pub use checkpoint::{TrainingState, WatermarkCheckpoint};
pub use ddim_scheduler::{DdimScheduler, SchedulerConfig};
pub use degradations::{AttackConfig, Degradation};
pub use watermark_trainer::{GradientAccumulator, TrainerSettings, TrainingSummary, WatermarkTrainer};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::data::{DataLoader, DatasetConfig, OptimizedDataset, PromptCorpus, Split};
use crate::pipeline::{DiffusionBackend, StableDiffusionBackend};
use crate::watermark::{WatermarkMask, WatermarkOptions, WatermarkPattern};

/// Checkpoints are written below this directory, one folder per run.
pub const CHECKPOINT_DIR: &str = "ckpts";
pub const DATASET_REPEATS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixedPrecision {
    No,
    Fp16,
    Bf16,
}

impl MixedPrecision {
    /// Model dtype on `device`; half precision falls back to f32 on CPU.
    pub fn dtype(self, device: &Device) -> DType {
        match self {
            MixedPrecision::No => DType::F32,
            _ if device.is_cpu() => {
                warn!("{:?} requested on CPU, running in f32", self);
                DType::F32
            }
            MixedPrecision::Fp16 => DType::F16,
            MixedPrecision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    pub learning_rate: f64,
    /// Multiply the learning rate by accumulation steps and batch size
    pub scale_lr: bool,
    pub max_train_steps: usize,
    pub save_steps: usize,
    pub train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub gradient_checkpointing: bool,
    pub mixed_precision: MixedPrecision,
    pub seed: u64,
    pub output_dir: PathBuf,

    /// Also train the embedding used as the unconditional guidance branch
    pub optimize_prompt: bool,
    /// Index into the generation timesteps where the watermark is injected
    pub injection_step: usize,
    pub retain_loss_weight: f64,
    pub watermark_loss_weight: f64,
    pub log_every: usize,
    pub attack: AttackConfig,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            learning_rate: 5e-4,
            scale_lr: true,
            max_train_steps: 2000,
            save_steps: 500,
            train_batch_size: 1,
            gradient_accumulation_steps: 1,
            gradient_checkpointing: true,
            mixed_precision: MixedPrecision::Fp16,
            seed: 42,
            output_dir: PathBuf::from("sd-concept-output"),
            optimize_prompt: true,
            injection_step: 0,
            retain_loss_weight: 1.0,
            watermark_loss_weight: 1.0,
            log_every: 10,
            attack: AttackConfig::default(),
        }
    }
}

impl Hyperparameters {
    pub fn effective_learning_rate(&self) -> f64 {
        if self.scale_lr {
            self.learning_rate * (self.gradient_accumulation_steps * self.train_batch_size) as f64
        } else {
            self.learning_rate
        }
    }
}

pub fn load_hyperparameters(path: &Path) -> Result<Hyperparameters> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read hyperparameter file: {}", path.display()))?;

    let hyperparameters: Hyperparameters = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML hyperparameters")?;

    Ok(hyperparameters)
}

/// Training entry point: load the pretrained model and prompt corpus, then
/// optimize the watermark.
pub fn train_from_args(mut args: TrainArgs) -> Result<TrainingSummary> {
    let options = args.resolve();
    let hyperparameters = match &args.hyperparameters {
        Some(path) => {
            info!("Loading hyperparameters from {}", path.display());
            load_hyperparameters(path)?
        }
        None => Hyperparameters::default(),
    };

    let device = Device::cuda_if_available(0)?;
    info!("Using device: {:?}", device);
    let dtype = hyperparameters.mixed_precision.dtype(&device);

    info!("Loading {} ({:?})", args.model_id, dtype);
    let scheduler = DdimScheduler::from_pretrained(&args.model_id)?;
    let backend = StableDiffusionBackend::from_pretrained(&args.model_id, args.image_length, dtype, &device)?;

    info!("Loading prompt corpus {}", args.dataset);
    let prompts = PromptCorpus::load(&args.dataset)?;

    run_training(&backend, scheduler, hyperparameters, &args, options, prompts, Path::new(CHECKPOINT_DIR))
}

/// Build the dataset, watermark pattern and mask, and hand them to the
/// optimizer.
pub fn run_training<B: DiffusionBackend>(
    backend: &B,
    scheduler: DdimScheduler,
    hyperparameters: Hyperparameters,
    args: &TrainArgs,
    options: WatermarkOptions,
    prompts: PromptCorpus,
    save_path: &Path,
) -> Result<TrainingSummary> {
    let mut config = DatasetConfig::new(&args.data_root);
    config.size = args.image_length;
    config.repeats = DATASET_REPEATS;
    config.split = Split::Train;
    config.center_crop = false;
    let dataset = OptimizedDataset::new(config, prompts, Device::Cpu)?;

    let mut loader = DataLoader::new(dataset, hyperparameters.train_batch_size, true, hyperparameters.seed);

    let mut rng = StdRng::seed_from_u64(args.gen_seed);
    let init_latents = backend.random_latents(&mut rng)?;
    let latent_dims = init_latents.dims().to_vec();

    let pattern = WatermarkPattern::generate(&latent_dims, &options, backend.device())?;
    let mask = WatermarkMask::generate(&latent_dims, &options, &Device::Cpu)?;

    let settings = TrainerSettings::from(args);
    let mut trainer = WatermarkTrainer::new(backend, scheduler, hyperparameters, settings, options);
    let summary = trainer.optimize(&mut loader, &mask, pattern, save_path)?;

    info!(
        "Finished {} steps: loss = {:.6}, retain = {:.6}, watermark = {:.6}",
        summary.steps, summary.loss, summary.retain_loss, summary.watermark_loss
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::ToyBackend;
    use clap::Parser;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn test_default_hyperparameters() {
        let hp = Hyperparameters::default();
        assert_eq!(hp.learning_rate, 5e-4);
        assert!(hp.scale_lr);
        assert_eq!(hp.max_train_steps, 2000);
        assert_eq!(hp.save_steps, 500);
        assert_eq!(hp.train_batch_size, 1);
        assert_eq!(hp.gradient_accumulation_steps, 1);
        assert!(hp.gradient_checkpointing);
        assert_eq!(hp.mixed_precision, MixedPrecision::Fp16);
        assert_eq!(hp.seed, 42);
        assert_eq!(hp.output_dir, PathBuf::from("sd-concept-output"));
    }

    #[test]
    fn test_scale_lr() {
        let hp = Hyperparameters {
            train_batch_size: 2,
            gradient_accumulation_steps: 4,
            ..Default::default()
        };
        assert!((hp.effective_learning_rate() - 4e-3).abs() < 1e-12);

        let fixed = Hyperparameters { scale_lr: false, ..hp };
        assert_eq!(fixed.effective_learning_rate(), 5e-4);
    }

    #[test]
    fn test_yaml_overrides_keep_defaults() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("hp.yaml");
        fs::write(
            &path,
            "learning_rate: 0.001\nmixed_precision: bf16\nattack:\n  noise_std: 0.1\n",
        )?;
        let hp = load_hyperparameters(&path)?;
        assert_eq!(hp.learning_rate, 0.001);
        assert_eq!(hp.mixed_precision, MixedPrecision::Bf16);
        assert_eq!(hp.attack.noise_std, 0.1);
        assert_eq!(hp.attack.blur_sigma, AttackConfig::default().blur_sigma);
        assert_eq!(hp.max_train_steps, 2000);
        Ok(())
    }

    #[test]
    fn test_half_precision_falls_back_on_cpu() {
        assert_eq!(MixedPrecision::Fp16.dtype(&Device::Cpu), DType::F32);
        assert_eq!(MixedPrecision::No.dtype(&Device::Cpu), DType::F32);
    }

    #[test]
    fn test_run_training_with_toy_backend() -> Result<()> {
        let images = TempDir::new()?;
        let out = TempDir::new()?;
        for i in [10u8, 2, 1] {
            RgbImage::from_pixel(40, 32, Rgb([i * 10, 100, 200]))
                .save(images.path().join(format!("ori-lg7.5-{}.jpg", i)))?;
        }

        let mut args = TrainArgs::try_parse_from([
            "gen_watermark",
            "--data-root",
            images.path().to_str().expect("utf-8 temp path"),
            "--image-length",
            "32",
            "--num-inference-steps",
            "3",
            "--w-up-radius",
            "2",
            "--w-low-radius",
            "1",
            "--run-name",
            "toy-run",
        ])?;
        let options = args.resolve();
        let hyperparameters = Hyperparameters {
            max_train_steps: 1,
            ..Default::default()
        };
        let prompts = PromptCorpus::from_prompts(vec!["one".into(), "two".into(), "three".into()]);
        let backend = ToyBackend::new(32);
        let scheduler = DdimScheduler::new(SchedulerConfig::stable_diffusion());

        let summary = run_training(&backend, scheduler, hyperparameters, &args, options, prompts, out.path())?;
        assert_eq!(summary.steps, 1);
        assert!(summary.checkpoint.starts_with(out.path().join("toy-run")));
        assert!(summary.checkpoint.exists());
        Ok(())
    }

    #[test]
    fn test_run_training_rejects_small_corpus() -> Result<()> {
        let images = TempDir::new()?;
        for i in 0..3 {
            RgbImage::new(8, 8).save(images.path().join(format!("ori-lg7.5-{}.png", i)))?;
        }
        let mut args = TrainArgs::try_parse_from([
            "gen_watermark",
            "--data-root",
            images.path().to_str().expect("utf-8 temp path"),
        ])?;
        let options = args.resolve();
        let result = run_training(
            &ToyBackend::new(32),
            DdimScheduler::new(SchedulerConfig::default()),
            Hyperparameters::default(),
            &args,
            options,
            PromptCorpus::from_prompts(vec!["only one".into()]),
            images.path(),
        );
        assert!(result.is_err());
        Ok(())
    }
}
