use clap::Parser;
use std::path::PathBuf;

use crate::watermark::{Injection, MaskShape, Measurement, PatternKind, WatermarkOptions};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Optimize a latent-space watermark for a diffusion model")]
pub struct TrainArgs {
    #[arg(long, default_value = "test")]
    pub run_name: String,

    /// Prompt corpus: hub dataset id or a local .txt/.json/.jsonl/.parquet file
    #[arg(long, default_value = "Gustavosta/Stable-Diffusion-Prompts")]
    pub dataset: String,

    #[arg(long, default_value_t = 512)]
    pub image_length: usize,

    #[arg(long, default_value = "stabilityai/stable-diffusion-2-1-base")]
    pub model_id: String,

    #[arg(long)]
    pub with_tracking: bool,

    /// Images logged per checkpoint when tracking
    #[arg(long, default_value_t = 1)]
    pub num_images: usize,

    #[arg(long, default_value_t = 7.5)]
    pub guidance_scale: f64,

    #[arg(long, default_value_t = 50)]
    pub num_inference_steps: usize,

    /// Inversion steps, defaults to --num-inference-steps
    #[arg(long)]
    pub test_num_inference_steps: Option<usize>,

    #[arg(long, default_value_t = 100)]
    pub max_num_log_image: usize,

    #[arg(long, default_value_t = 0)]
    pub gen_seed: u64,

    #[arg(long, default_value_t = 999_999)]
    pub w_seed: u64,

    /// Latent channel to watermark, -1 for all
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub w_channel: i64,

    #[arg(long, default_value = "rand")]
    pub w_pattern: PatternKind,

    #[arg(long, default_value = "circle")]
    pub w_mask_shape: MaskShape,

    #[arg(long, default_value_t = 30)]
    pub w_up_radius: usize,

    #[arg(long, default_value_t = 5)]
    pub w_low_radius: usize,

    #[arg(long, default_value = "l1_complex")]
    pub w_measurement: Measurement,

    #[arg(long, default_value = "complex")]
    pub w_injection: Injection,

    #[arg(long, default_value_t = 0.0)]
    pub w_pattern_const: f64,

    /// Directory of baseline images (ori-lg7.5-<n>.jpg)
    #[arg(long)]
    pub data_root: PathBuf,

    /// YAML file overriding training hyperparameters
    #[arg(long)]
    pub hyperparameters: Option<PathBuf>,
}

impl TrainArgs {
    /// Fill derived defaults and build the watermark options.
    pub fn resolve(&mut self) -> WatermarkOptions {
        if self.test_num_inference_steps.is_none() {
            self.test_num_inference_steps = Some(self.num_inference_steps);
        }
        self.watermark_options()
    }

    pub fn test_inference_steps(&self) -> usize {
        self.test_num_inference_steps.unwrap_or(self.num_inference_steps)
    }

    pub fn watermark_options(&self) -> WatermarkOptions {
        WatermarkOptions {
            seed: self.w_seed,
            channel: self.w_channel,
            pattern: self.w_pattern,
            mask_shape: self.w_mask_shape,
            up_radius: self.w_up_radius,
            low_radius: self.w_low_radius,
            measurement: self.w_measurement,
            injection: self.w_injection,
            pattern_const: self.w_pattern_const,
        }
    }
}
