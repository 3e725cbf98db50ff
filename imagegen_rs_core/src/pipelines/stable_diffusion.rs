use std::{collections::HashMap, fs, path::PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use imagegen_rs_common::load_safetensors;
use tokenizers::Tokenizer;
use tracing::info;

use crate::{
    models::UNetConfig,
    overlay::{OverlayReport, WeightOverlay},
    util::pad_tokens,
};

use super::{
    sampling::{initial_latents, Sampler},
    scheduler::SchedulerConfig,
    ComponentElem, ComponentName, DiffusionGenerationParams, Loader, ModelPipeline,
};

const VAE_SCALE: f64 = 0.18215;
const EOS_TOKEN: &str = "<|endoftext|>";

pub(crate) struct StableDiffusionLoader;

fn take(
    components: &mut HashMap<ComponentName, ComponentElem>,
    name: ComponentName,
) -> Result<ComponentElem> {
    components
        .remove(&name)
        .with_context(|| format!("missing `{name}` component"))
}

fn model_files(elem: ComponentElem, name: ComponentName) -> Result<(PathBuf, Option<PathBuf>)> {
    match elem {
        ComponentElem::Model {
            safetensors,
            config,
        } => Ok((safetensors, config)),
        _ => anyhow::bail!("expected `{name}` to be a model component"),
    }
}

fn file(elem: ComponentElem, name: ComponentName) -> Result<PathBuf> {
    match elem {
        ComponentElem::Config { file } | ComponentElem::Other { file } => Ok(file),
        ComponentElem::Model { .. } => anyhow::bail!("expected `{name}` to be a single file"),
    }
}

impl Loader for StableDiffusionLoader {
    fn name(&self) -> &'static str {
        "stable-diffusion"
    }

    fn required_component_names(&self) -> Vec<ComponentName> {
        vec![
            ComponentName::Scheduler,
            ComponentName::Tokenizer,
            ComponentName::TextEncoder,
            ComponentName::Unet,
            ComponentName::Vae,
        ]
    }

    fn load_from_components(
        &self,
        mut components: HashMap<ComponentName, ComponentElem>,
        device: &Device,
        dtype: DType,
        silent: bool,
    ) -> Result<Box<dyn ModelPipeline>> {
        let sd_config = StableDiffusionConfig::v1_5(None, None, None);

        let scheduler_file = file(
            take(&mut components, ComponentName::Scheduler)?,
            ComponentName::Scheduler,
        )?;
        let scheduler: SchedulerConfig = serde_json::from_str(&fs::read_to_string(&scheduler_file)?)
            .with_context(|| format!("invalid scheduler config `{}`", scheduler_file.display()))?;

        let tokenizer_file = file(
            take(&mut components, ComponentName::Tokenizer)?,
            ComponentName::Tokenizer,
        )?;
        let tokenizer = Tokenizer::from_file(&tokenizer_file).map_err(anyhow::Error::msg)?;
        let eos_id = tokenizer
            .token_to_id(EOS_TOKEN)
            .with_context(|| format!("tokenizer has no `{EOS_TOKEN}` token"))?;
        let pad_id = match &sd_config.clip.pad_with {
            Some(padding) => tokenizer
                .token_to_id(padding)
                .with_context(|| format!("tokenizer has no `{padding}` token"))?,
            None => eos_id,
        };

        if !silent {
            info!("loading text encoder");
        }
        let (clip_weights, _) = model_files(
            take(&mut components, ComponentName::TextEncoder)?,
            ComponentName::TextEncoder,
        )?;
        let text_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_weights, device, dtype)?;

        if !silent {
            info!("loading UNet");
        }
        let (unet_weights_file, unet_config_file) = model_files(
            take(&mut components, ComponentName::Unet)?,
            ComponentName::Unet,
        )?;
        let unet_config_file = unet_config_file.context("missing UNet `config.json`")?;
        let unet_config: UNetConfig =
            serde_json::from_str(&fs::read_to_string(&unet_config_file)?)
                .with_context(|| format!("invalid UNet config `{}`", unet_config_file.display()))?;
        let unet_weights = load_safetensors(&unet_weights_file, device, Some(dtype), silent)?;
        let unet = build_unet(&unet_weights, &unet_config, device, dtype)?;

        if !silent {
            info!("loading VAE");
        }
        let (vae_weights, _) = model_files(
            take(&mut components, ComponentName::Vae)?,
            ComponentName::Vae,
        )?;
        let vae = sd_config.build_vae(vae_weights, device, dtype)?;

        Ok(Box::new(StableDiffusionPipeline {
            tokenizer,
            pad_id,
            eos_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            text_model,
            unet,
            unet_weights,
            unet_config,
            vae,
            scheduler,
            device: device.clone(),
            dtype,
            silent,
        }))
    }
}

fn build_unet(
    weights: &HashMap<String, Tensor>,
    config: &UNetConfig,
    device: &Device,
    dtype: DType,
) -> Result<UNet2DConditionModel> {
    let vb = VarBuilder::from_tensors(weights.clone(), dtype, device);
    Ok(UNet2DConditionModel::new(
        vb,
        config.in_channels,
        config.out_channels,
        false,
        config.to_model_config(None)?,
    )?)
}

pub struct StableDiffusionPipeline {
    tokenizer: Tokenizer,
    pad_id: u32,
    eos_id: u32,
    max_tokens: usize,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    unet_weights: HashMap<String, Tensor>,
    unet_config: UNetConfig,
    vae: AutoEncoderKL,
    scheduler: SchedulerConfig,
    device: Device,
    dtype: DType,
    silent: bool,
}

impl StableDiffusionPipeline {
    fn embed(&self, prompt: &str) -> candle_core::Result<Tensor> {
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(candle_core::Error::msg)?
            .get_ids()
            .to_vec();
        let tokens = pad_tokens(tokens, self.max_tokens, self.pad_id, self.eos_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        self.text_model.forward(&tokens)
    }

    /// Text embeddings, preceded by the empty-prompt embeddings when guidance is on.
    fn encode_prompt(&self, prompt: &str, guided: bool) -> candle_core::Result<Tensor> {
        let cond = self.embed(prompt)?;
        let embeddings = if guided {
            let uncond = self.embed("")?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        embeddings.to_dtype(self.dtype)
    }
}

impl ModelPipeline for StableDiffusionPipeline {
    fn apply_overlay(&mut self, overlay: &WeightOverlay, scale: f64) -> Result<OverlayReport> {
        let report = overlay.merge_into(&mut self.unet_weights, scale)?;
        if !report.applied.is_empty() {
            self.unet = build_unet(
                &self.unet_weights,
                &self.unet_config,
                &self.device,
                self.dtype,
            )?;
        }
        Ok(report)
    }

    fn forward(
        &mut self,
        prompt: &str,
        params: &DiffusionGenerationParams,
    ) -> candle_core::Result<Tensor> {
        let sampler = Sampler::new(params.guidance_scale);
        let text_embeddings = self.encode_prompt(prompt, sampler.uses_guidance())?;

        let mut scheduler = self.scheduler.build(params.num_steps)?;
        let latents = initial_latents(
            (
                1,
                self.unet_config.in_channels,
                params.height / 8,
                params.width / 8,
            ),
            params.seed,
            &self.device,
            self.dtype,
        )?;

        let latents = sampler.sample(
            scheduler.as_mut(),
            &latents,
            |x, t| self.unet.forward(x, t as f64, &text_embeddings),
            self.silent,
        )?;

        let img = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let img = img.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        let img = ((img.clamp(-1f32, 1f32)? + 1.)? * 127.5)?;
        img.round()?.to_dtype(DType::U8)
    }
}
