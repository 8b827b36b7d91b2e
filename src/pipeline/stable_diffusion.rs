//! Stable Diffusion backend on candle-transformers

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, group_norm, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    unet_2d::UNet2DConditionModel,
    unet_2d_blocks::{DownEncoderBlock2D, DownEncoderBlock2DConfig, UNetMidBlock2D, UNetMidBlock2DConfig},
    vae::{AutoEncoderKL, AutoEncoderKLConfig},
    StableDiffusionConfig,
};
use hf_hub::api::sync::Api;
use log::info;
use tokenizers::Tokenizer;

use super::DiffusionBackend;

const VAE_SCALE: f64 = 0.18215;
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

pub struct StableDiffusionBackend {
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    encoder: PosteriorEncoder,
    text_model: ClipTextTransformer,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    latent_dims: [usize; 4],
    device: Device,
    dtype: DType,
}

/// v2.x checkpoints use the OpenCLIP text tower, everything else v1.5.
pub fn config_for(model_id: &str, image_size: usize) -> StableDiffusionConfig {
    if model_id.contains("stable-diffusion-2") {
        StableDiffusionConfig::v2_1(None, Some(image_size), Some(image_size))
    } else {
        StableDiffusionConfig::v1_5(None, Some(image_size), Some(image_size))
    }
}

/// VAE layout shared by the v1.5 and v2.x checkpoints.
pub fn autoencoder_config() -> AutoEncoderKLConfig {
    AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: 4,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}

/// VAE encoder returning the posterior mean, so image latents do not depend
/// on an unseeded sample.
pub struct PosteriorEncoder {
    conv_in: Conv2d,
    down_blocks: Vec<DownEncoderBlock2D>,
    mid_block: UNetMidBlock2D,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
    quant_conv: Option<Conv2d>,
    latent_channels: usize,
}

impl PosteriorEncoder {
    /// Build from a VAE checkpoint's `encoder.*` and `quant_conv.*` weights.
    pub fn new(vb: VarBuilder, config: &AutoEncoderKLConfig) -> Result<Self> {
        let channels = &config.block_out_channels;
        let last = *channels.last().ok_or_else(|| anyhow!("VAE config has no encoder blocks"))?;
        let enc = vb.pp("encoder");
        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv_in = conv2d(3, channels[0], 3, padded, enc.pp("conv_in"))?;
        let mut down_blocks = Vec::with_capacity(channels.len());
        for (index, &out_channels) in channels.iter().enumerate() {
            let in_channels = channels[index.saturating_sub(1)];
            let block_config = DownEncoderBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: 1e-6,
                resnet_groups: config.norm_num_groups,
                add_downsample: index + 1 < channels.len(),
                downsample_padding: 0,
                ..Default::default()
            };
            down_blocks.push(DownEncoderBlock2D::new(
                enc.pp("down_blocks").pp(index.to_string()),
                in_channels,
                out_channels,
                block_config,
            )?);
        }

        let mid_config = UNetMidBlock2DConfig {
            resnet_eps: 1e-6,
            output_scale_factor: 1.,
            attn_num_head_channels: None,
            resnet_groups: Some(config.norm_num_groups),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2D::new(enc.pp("mid_block"), last, None, mid_config)?;
        let conv_norm_out = group_norm(config.norm_num_groups, last, 1e-6, enc.pp("conv_norm_out"))?;

        // mean and log-variance
        let moments = 2 * config.latent_channels;
        let conv_out = conv2d(last, moments, 3, padded, enc.pp("conv_out"))?;
        let quant_conv = if config.use_quant_conv {
            Some(conv2d(moments, moments, 1, Default::default(), vb.pp("quant_conv"))?)
        } else {
            None
        };

        Ok(Self {
            conv_in,
            down_blocks,
            mid_block,
            conv_norm_out,
            conv_out,
            quant_conv,
            latent_channels: config.latent_channels,
        })
    }

    pub fn mean(&self, pixels: &Tensor) -> Result<Tensor> {
        let mut xs = pixels.apply(&self.conv_in)?;
        for block in &self.down_blocks {
            xs = xs.apply(block)?;
        }
        let xs = self.mid_block.forward(&xs, None)?.apply(&self.conv_norm_out)?;
        let mut moments = candle_nn::ops::silu(&xs)?.apply(&self.conv_out)?;
        if let Some(quant_conv) = &self.quant_conv {
            moments = moments.apply(quant_conv)?;
        }
        Ok(moments.narrow(1, 0, self.latent_channels)?)
    }
}

/// Truncate or pad token ids to exactly `max_len`.
pub fn pad_tokens(mut ids: Vec<u32>, max_len: usize, pad_id: u32) -> Vec<u32> {
    ids.truncate(max_len);
    ids.resize(max_len, pad_id);
    ids
}

impl StableDiffusionBackend {
    /// Fetch UNet, VAE, text encoder and tokenizer for `model_id` from the hub.
    pub fn from_pretrained(model_id: &str, image_size: usize, dtype: DType, device: &Device) -> Result<Self> {
        let sd_config = config_for(model_id, image_size);
        let api = Api::new()?;
        let repo = api.model(model_id.to_string());
        let suffix = if dtype == DType::F16 { ".fp16" } else { "" };

        let fetch = |file: String| {
            repo.get(&file)
                .with_context(|| format!("Failed to fetch {} from {}", file, model_id))
        };
        let unet_file = fetch(format!("unet/diffusion_pytorch_model{}.safetensors", suffix))?;
        let vae_file = fetch(format!("vae/diffusion_pytorch_model{}.safetensors", suffix))?;
        let clip_file = fetch(format!("text_encoder/model{}.safetensors", suffix))?;
        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .context("Failed to fetch CLIP tokenizer")?;

        info!("Loading text encoder from {}", clip_file.display());
        let text_model = stable_diffusion::build_clip_transformer(&sd_config.clip, &clip_file, device, dtype)?;
        info!("Loading VAE from {}", vae_file.display());
        let vae = sd_config.build_vae(&vae_file, device, dtype)?;
        let encoder = {
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&vae_file], dtype, device)? };
            PosteriorEncoder::new(vb, &autoencoder_config())?
        };
        info!("Loading UNet from {}", unet_file.display());
        let unet = sd_config.build_unet(&unet_file, device, 4, false, dtype)?;

        let tokenizer = Tokenizer::from_file(&tokenizer_file).map_err(anyhow::Error::msg)?;
        let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| anyhow!("pad token {} missing from tokenizer vocab", pad_token))?;

        Ok(Self {
            unet,
            vae,
            encoder,
            text_model,
            tokenizer,
            pad_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            latent_dims: [1, 4, sd_config.height / 8, sd_config.width / 8],
            device: device.clone(),
            dtype,
        })
    }

    fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let ids = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        Ok(pad_tokens(ids, self.max_tokens, self.pad_id))
    }
}

impl DiffusionBackend for StableDiffusionBackend {
    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn latent_dims(&self) -> [usize; 4] {
        self.latent_dims
    }

    fn encode_prompts(&self, prompts: &[String]) -> Result<Tensor> {
        let mut ids = Vec::with_capacity(prompts.len() * self.max_tokens);
        for prompt in prompts {
            ids.extend(self.tokenize(prompt)?);
        }
        let tokens = Tensor::from_vec(ids, (prompts.len(), self.max_tokens), &self.device)?;
        Ok(self.text_model.forward(&tokens)?.to_dtype(DType::F32)?)
    }

    fn encode_images(&self, pixels: &Tensor) -> Result<Tensor> {
        let mean = self.encoder.mean(&pixels.to_dtype(self.dtype)?)?;
        Ok((mean.to_dtype(DType::F32)? * VAE_SCALE)?)
    }

    fn decode_latents(&self, latents: &Tensor) -> Result<Tensor> {
        let scaled = (latents / VAE_SCALE)?.to_dtype(self.dtype)?;
        Ok(self.vae.decode(&scaled)?.to_dtype(DType::F32)?)
    }

    fn predict_noise(&self, latents: &Tensor, timestep: usize, text_embeddings: &Tensor) -> Result<Tensor> {
        let noise = self.unet.forward(
            &latents.to_dtype(self.dtype)?,
            timestep as f64,
            &text_embeddings.to_dtype(self.dtype)?,
        )?;
        Ok(noise.to_dtype(DType::F32)?)
    }
}
