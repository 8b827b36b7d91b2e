//! Watermark optimization loop
//!
//! Each micro-batch runs the full round trip the watermark has to survive:
//! baseline image -> latent -> DDIM inversion to the injection step ->
//! injection -> guided denoising -> decode -> degradation -> re-encode ->
//! inversion -> watermark distance. The image-space MSE against the baseline
//! keeps the watermarked output close to it.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

use super::args::TrainArgs;
use super::checkpoint::{watermark_metadata, TrainingState, WatermarkCheckpoint, FINAL_WATERMARK_FILE, WATERMARK_FILE};
use super::ddim_scheduler::{DdimScheduler, Schedule};
use super::degradations::Degradation;
use super::tracking::{StepMetrics, Tracker};
use super::Hyperparameters;
use crate::data::{Batch, DataLoader};
use crate::pipeline::DiffusionBackend;
use crate::watermark::{
    inject_watermark, watermark_distance, ComplexLatent, Dft2, WatermarkMask, WatermarkOptions, WatermarkPattern,
};

/// Run-level settings taken from the command line.
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub run_name: String,
    pub model_id: String,
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
    pub test_num_inference_steps: usize,
    pub with_tracking: bool,
    pub num_images: usize,
    pub max_num_log_image: usize,
}

impl From<&TrainArgs> for TrainerSettings {
    fn from(args: &TrainArgs) -> Self {
        Self {
            run_name: args.run_name.clone(),
            model_id: args.model_id.clone(),
            guidance_scale: args.guidance_scale,
            num_inference_steps: args.num_inference_steps,
            test_num_inference_steps: args.test_inference_steps(),
            with_tracking: args.with_tracking,
            num_images: args.num_images,
            max_num_log_image: args.max_num_log_image,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub steps: usize,
    pub loss: f32,
    pub retain_loss: f32,
    pub watermark_loss: f32,
    /// Final watermark checkpoint
    pub checkpoint: PathBuf,
}

/// Sums per-variable gradients over micro-batches.
///
/// Only the gradients of the trained variables are kept between
/// micro-batches; the last micro-batch's store carries the totals into the
/// optimizer.
pub struct GradientAccumulator {
    steps: usize,
    pending: usize,
    sums: Vec<Option<Tensor>>,
}

impl GradientAccumulator {
    pub fn new(steps: usize) -> Self {
        Self {
            steps: steps.max(1),
            pending: 0,
            sums: Vec::new(),
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn accumulate(&mut self, grads: &GradStore, vars: &[Var]) -> Result<()> {
        self.sums.resize(vars.len(), None);
        for (sum, var) in self.sums.iter_mut().zip(vars) {
            if let Some(grad) = grads.get(var.as_tensor()) {
                *sum = Some(match sum.take() {
                    Some(prev) => (prev + grad)?,
                    None => grad.clone(),
                });
            }
        }
        self.pending += 1;
        Ok(())
    }

    /// Fold the accumulated sums into `grads` and reset.
    pub fn finish(&mut self, mut grads: GradStore, vars: &[Var]) -> Result<GradStore> {
        for (sum, var) in self.sums.iter_mut().zip(vars) {
            if let Some(prev) = sum.take() {
                let total = match grads.remove(var.as_tensor()) {
                    Some(grad) => (prev + grad)?,
                    None => prev,
                };
                grads.insert(var.as_tensor(), total);
            }
        }
        self.pending = 0;
        Ok(grads)
    }
}

/// Fixed pieces of one optimization run.
struct Problem {
    mask: WatermarkMask,
    dft: Dft2,
    empty_embedding: Tensor,
    generation: Schedule,
    inversion: Schedule,
    injection_index: usize,
    injection_timestep: usize,
}

struct LossBreakdown {
    total: Tensor,
    retain: f32,
    watermark: f32,
    images: Tensor,
}

pub struct WatermarkTrainer<'a, B: DiffusionBackend> {
    backend: &'a B,
    scheduler: DdimScheduler,
    hyperparameters: Hyperparameters,
    settings: TrainerSettings,
    options: WatermarkOptions,
    rng: StdRng,
}

impl<'a, B: DiffusionBackend> WatermarkTrainer<'a, B> {
    pub fn new(
        backend: &'a B,
        scheduler: DdimScheduler,
        hyperparameters: Hyperparameters,
        settings: TrainerSettings,
        options: WatermarkOptions,
    ) -> Self {
        let rng = StdRng::seed_from_u64(hyperparameters.seed);
        Self {
            backend,
            scheduler,
            hyperparameters,
            settings,
            options,
            rng,
        }
    }

    /// Optimize `pattern` (and the guidance embedding when enabled) and write
    /// checkpoints under `save_path/<run_name>`.
    pub fn optimize(
        &mut self,
        loader: &mut DataLoader,
        mask: &WatermarkMask,
        pattern: WatermarkPattern,
        save_path: &Path,
    ) -> Result<TrainingSummary> {
        let hp = self.hyperparameters.clone();
        let device = self.backend.device().clone();

        let mask = mask.to_device(&device)?;
        let dims = mask.dims().to_vec();
        anyhow::ensure!(dims.len() == 4, "mask must be [1, C, h, w], got {:?}", dims);
        let dft = Dft2::new(dims[2], dims[3], &device)?;

        let initial = pattern.values().to_device(&device)?;
        let watermark_re = Var::from_tensor(&initial.re.to_dtype(DType::F32)?)?;
        let watermark_im = Var::from_tensor(&initial.im.to_dtype(DType::F32)?)?;

        let empty_embedding = self.backend.encode_prompts(&[String::new()])?.detach();
        let guidance = if hp.optimize_prompt {
            Some(Var::from_tensor(&empty_embedding)?)
        } else {
            None
        };

        let mut vars = vec![watermark_re.clone(), watermark_im.clone()];
        if let Some(guidance) = &guidance {
            vars.push(guidance.clone());
        }

        let learning_rate = hp.effective_learning_rate();
        let params = ParamsAdamW {
            lr: learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let mut optimizer = AdamW::new(vars.clone(), params)?;

        let generation = self.scheduler.schedule(self.settings.num_inference_steps);
        let inversion = self.scheduler.schedule(self.settings.test_num_inference_steps);
        let injection_index = hp.injection_step.min(generation.timesteps.len() - 1);
        let injection_timestep = generation.timesteps[injection_index];
        let problem = Problem {
            mask,
            dft,
            empty_embedding,
            generation,
            inversion,
            injection_index,
            injection_timestep,
        };

        let run_dir = save_path.join(&self.settings.run_name);
        let mut tracker = if self.settings.with_tracking {
            Some(Tracker::new(
                &hp.output_dir.join(&self.settings.run_name),
                self.settings.num_images,
                self.settings.max_num_log_image,
            )?)
        } else {
            None
        };

        info!("=== Optimizing watermark ===");
        info!("Pattern: {}, mask: {}, injection: {}, measurement: {}",
            pattern.kind(), self.options.mask_shape, self.options.injection, self.options.measurement);
        info!("Selected latent positions: {}", problem.mask.selected());
        info!("Steps: {}, batch size: {}, gradient accumulation: {}",
            hp.max_train_steps, loader.batch_size(), hp.gradient_accumulation_steps);
        info!("Learning rate: {:.2e} (scale_lr: {})", learning_rate, hp.scale_lr);
        info!("Injection at timestep {} ({} generation / {} inversion steps)",
            injection_timestep, self.settings.num_inference_steps, self.settings.test_num_inference_steps);
        info!("Checkpoints: {}", run_dir.display());

        #[cfg(feature = "progress-bar")]
        let progress = {
            let pb = ProgressBar::new(hp.max_train_steps as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                    .progress_chars("#>-"),
            );
            pb
        };

        let mut accumulator = GradientAccumulator::new(hp.gradient_accumulation_steps);
        let micro_batches = accumulator.steps();
        let mut last = (f32::NAN, f32::NAN, f32::NAN);
        let mut last_images = None;

        for step in 1..=hp.max_train_steps {
            let (mut loss_sum, mut retain_sum, mut watermark_sum) = (0f32, 0f32, 0f32);

            for micro in 0..micro_batches {
                let batch = loader.next_batch()?;
                let watermark = ComplexLatent::new(watermark_re.as_tensor().clone(), watermark_im.as_tensor().clone());
                let losses = self.compute_loss(&batch, &problem, &watermark, guidance.as_ref().map(|g| g.as_tensor()))?;

                let scaled = (&losses.total / micro_batches as f64)?;
                loss_sum += scaled.to_scalar::<f32>()?;
                retain_sum += losses.retain / micro_batches as f32;
                watermark_sum += losses.watermark / micro_batches as f32;
                last_images = Some(losses.images);

                let grads = scaled.backward()?;
                if micro + 1 < micro_batches {
                    accumulator.accumulate(&grads, &vars)?;
                } else {
                    let grads = accumulator.finish(grads, &vars)?;
                    optimizer.step(&grads)?;
                }
            }
            last = (loss_sum, retain_sum, watermark_sum);

            #[cfg(feature = "progress-bar")]
            {
                progress.set_position(step as u64);
                progress.set_message(format!("loss: {:.4}", loss_sum));
            }

            if step % hp.log_every.max(1) == 0 || step == 1 {
                info!(
                    "Step {}/{}: loss = {:.6}, retain = {:.6}, watermark = {:.6}, lr = {:.2e}",
                    step, hp.max_train_steps, loss_sum, retain_sum, watermark_sum, optimizer.learning_rate()
                );
                if let Some(tracker) = tracker.as_mut() {
                    tracker.log_metrics(&StepMetrics {
                        step,
                        loss: loss_sum,
                        retain_loss: retain_sum,
                        watermark_loss: watermark_sum,
                        learning_rate: optimizer.learning_rate(),
                        timestamp: chrono::Local::now().to_rfc3339(),
                    })?;
                }
            }

            if hp.save_steps > 0 && step % hp.save_steps == 0 {
                let dir = run_dir.join(format!("checkpoint-{}", step));
                self.save_checkpoint(&dir, WATERMARK_FILE, &watermark_re, &watermark_im, guidance.as_ref(), &problem.mask)?;
                self.training_state(step, last, learning_rate).save(&dir)?;
                info!("Saved checkpoint to {}", dir.display());

                if let (Some(tracker), Some(images)) = (tracker.as_mut(), last_images.as_ref()) {
                    tracker.log_images(step, images)?;
                }
            }
        }

        #[cfg(feature = "progress-bar")]
        progress.finish_with_message("done");

        let checkpoint = self.save_checkpoint(
            &run_dir,
            FINAL_WATERMARK_FILE,
            &watermark_re,
            &watermark_im,
            guidance.as_ref(),
            &problem.mask,
        )?;
        self.training_state(hp.max_train_steps, last, learning_rate).save(&run_dir)?;
        info!("Saved final watermark to {}", checkpoint.display());

        Ok(TrainingSummary {
            steps: hp.max_train_steps,
            loss: last.0,
            retain_loss: last.1,
            watermark_loss: last.2,
            checkpoint,
        })
    }

    fn compute_loss(
        &mut self,
        batch: &Batch,
        problem: &Problem,
        watermark: &ComplexLatent,
        guidance: Option<&Tensor>,
    ) -> Result<LossBreakdown> {
        let backend = self.backend;
        let pixels = batch.pixel_values.to_device(backend.device())?.to_dtype(DType::F32)?;
        let batch_size = pixels.dim(0)?;

        let text = backend.encode_prompts(&batch.prompts)?.detach();
        let empty = expand_batch(&problem.empty_embedding, batch_size)?;
        let uncond = match guidance {
            Some(guidance) => expand_batch(guidance, batch_size)?,
            None => empty.clone(),
        };

        let clean = backend.encode_images(&pixels)?.detach();
        let start = self.invert(&clean, &empty, problem)?.detach();
        let marked = inject_watermark(&start, &problem.mask, watermark, self.options.injection, &problem.dft)?;
        let latents = self.denoise(&marked, &text, &uncond, problem)?;
        let images = backend.decode_latents(&latents)?;
        let retain = (&images - &pixels)?.sqr()?.mean_all()?;

        let degradation = Degradation::sample(&self.hyperparameters.attack, &mut self.rng);
        let attacked = degradation.apply(&images, &mut self.rng)?;
        let recovered = self.invert(&backend.encode_images(&attacked)?, &empty, problem)?;
        let watermark_loss =
            watermark_distance(&recovered, &problem.mask, watermark, self.options.measurement, &problem.dft)?;

        let total = ((&retain * self.hyperparameters.retain_loss_weight)?
            + (&watermark_loss * self.hyperparameters.watermark_loss_weight)?)?;
        debug!("{:?}: total {}", degradation, total);

        Ok(LossBreakdown {
            total,
            retain: retain.to_scalar::<f32>()?,
            watermark: watermark_loss.to_scalar::<f32>()?,
            images: images.detach(),
        })
    }

    /// DDIM-invert `latents` from the clean end up to the injection timestep.
    fn invert(&self, latents: &Tensor, text_embeddings: &Tensor, problem: &Problem) -> Result<Tensor> {
        let mut x = latents.clone();
        for (from, to) in problem.inversion.inversion_path(problem.injection_timestep) {
            let eps = self.backend.predict_noise(&x, to, text_embeddings)?;
            let eps = if self.hyperparameters.gradient_checkpointing { eps.detach() } else { eps };
            x = self.scheduler.inverse_transfer(&eps, &x, from, to)?;
        }
        Ok(x)
    }

    /// Guided DDIM denoising from the injection timestep to the clean end.
    fn denoise(&self, latents: &Tensor, text: &Tensor, uncond: &Tensor, problem: &Problem) -> Result<Tensor> {
        let timesteps = &problem.generation.timesteps[problem.injection_index..];
        let guidance_scale = self.settings.guidance_scale;
        let mut x = latents.clone();

        for (i, &t) in timesteps.iter().enumerate() {
            let eps = if guidance_scale > 1.0 {
                let batch_size = x.dim(0)?;
                let input = Tensor::cat(&[&x, &x], 0)?;
                let cond = Tensor::cat(&[uncond, text], 0)?;
                let out = self.backend.predict_noise(&input, t, &cond)?;
                let eps_uncond = out.narrow(0, 0, batch_size)?;
                let eps_text = out.narrow(0, batch_size, batch_size)?;
                (&eps_uncond + ((eps_text - &eps_uncond)? * guidance_scale)?)?
            } else {
                self.backend.predict_noise(&x, t, text)?
            };

            // the final step keeps its graph so the guidance embedding is trained
            let final_step = i + 1 == timesteps.len();
            let eps = if self.hyperparameters.gradient_checkpointing && !final_step {
                eps.detach()
            } else {
                eps
            };
            x = self.scheduler.step(&eps, t, &x, &problem.generation)?;
        }
        Ok(x)
    }

    fn save_checkpoint(
        &self,
        dir: &Path,
        file: &str,
        watermark_re: &Var,
        watermark_im: &Var,
        guidance: Option<&Var>,
        mask: &WatermarkMask,
    ) -> Result<PathBuf> {
        let mut metadata = watermark_metadata(&self.options);
        metadata.insert("model_id".to_string(), self.settings.model_id.clone());
        metadata.insert("run_name".to_string(), self.settings.run_name.clone());

        let checkpoint = WatermarkCheckpoint {
            watermark: ComplexLatent::new(watermark_re.as_tensor().detach(), watermark_im.as_tensor().detach()),
            mask: mask.tensor().clone(),
            guidance_embedding: guidance.map(|g| g.as_tensor().detach()),
            metadata,
        };
        let path = dir.join(file);
        checkpoint.save(&path)?;
        Ok(path)
    }

    fn training_state(&self, step: usize, losses: (f32, f32, f32), learning_rate: f64) -> TrainingState {
        TrainingState {
            step,
            loss: losses.0,
            retain_loss: losses.1,
            watermark_loss: losses.2,
            learning_rate,
            run_name: self.settings.run_name.clone(),
            model_id: self.settings.model_id.clone(),
        }
    }
}

/// `[1, seq, dim]` embedding repeated over the batch.
fn expand_batch(embedding: &Tensor, batch_size: usize) -> Result<Tensor> {
    let (_, seq, dim) = embedding.dims3()?;
    Ok(embedding.broadcast_as((batch_size, seq, dim))?.contiguous()?)
}
