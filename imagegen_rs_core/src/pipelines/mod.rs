mod sampling;
mod scheduler;
mod stable_diffusion;

use std::{collections::HashMap, fmt::Display, path::PathBuf};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};
use serde::Deserialize;
use tracing::info;

use imagegen_rs_common::{CheckpointSource, FileLoader, ModelSource, NiceProgressBar, TokenSource};
use stable_diffusion::StableDiffusionLoader;

use crate::{
    overlay::{OverlayReport, WeightOverlay},
    GenerationConfig, TryIntoDType,
};

/// Generation parameters.
#[derive(Debug, Clone)]
pub struct DiffusionGenerationParams {
    pub height: usize,
    pub width: usize,
    /// The number of denoising steps. More denoising steps usually lead to a higher quality image
    /// at the expense of slower inference but depends on the model being used.
    pub num_steps: usize,
    /// Higher guidance scale encourages to generate images that are closely linked to the text
    /// `prompt`, usually at the expense of lower image quality.
    pub guidance_scale: f64,
    /// Seed for the initial latents. Random when unset.
    pub seed: Option<u64>,
}

impl From<&GenerationConfig> for DiffusionGenerationParams {
    fn from(cfg: &GenerationConfig) -> Self {
        Self {
            height: cfg.height,
            width: cfg.width,
            num_steps: cfg.steps,
            guidance_scale: cfg.guidance_scale,
            seed: cfg.seed,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ComponentElem {
    Model {
        safetensors: PathBuf,
        config: Option<PathBuf>,
    },
    Config {
        file: PathBuf,
    },
    Other {
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum ComponentName {
    Scheduler,
    TextEncoder,
    Tokenizer,
    Unet,
    Vae,
}

impl Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduler => write!(f, "scheduler"),
            Self::TextEncoder => write!(f, "text_encoder"),
            Self::Tokenizer => write!(f, "tokenizer"),
            Self::Unet => write!(f, "unet"),
            Self::Vae => write!(f, "vae"),
        }
    }
}

impl ComponentName {
    /// Resolve the files of this component.
    ///
    /// The tokenizer comes from `tokenizer` when given (its root `tokenizer.json`), otherwise from
    /// `tokenizer/tokenizer.json` in the base checkpoint.
    fn resolve(
        self,
        base: &dyn CheckpointSource,
        tokenizer: Option<&dyn CheckpointSource>,
    ) -> Result<ComponentElem> {
        Ok(match self {
            Self::Scheduler => ComponentElem::Config {
                file: base.get("scheduler/scheduler_config.json")?,
            },
            Self::Tokenizer => ComponentElem::Other {
                file: match tokenizer {
                    Some(source) => source.get("tokenizer.json")?,
                    None => base.get("tokenizer/tokenizer.json")?,
                },
            },
            Self::TextEncoder => ComponentElem::Model {
                safetensors: base.get("text_encoder/model.safetensors")?,
                config: None,
            },
            Self::Unet | Self::Vae => ComponentElem::Model {
                safetensors: base.get(&format!("{self}/diffusion_pytorch_model.safetensors"))?,
                config: Some(base.get(&format!("{self}/config.json"))?),
            },
        })
    }
}

pub(crate) trait Loader {
    fn name(&self) -> &'static str;
    fn required_component_names(&self) -> Vec<ComponentName>;
    fn load_from_components(
        &self,
        components: HashMap<ComponentName, ComponentElem>,
        device: &Device,
        dtype: DType,
        silent: bool,
    ) -> Result<Box<dyn ModelPipeline>>;
}

/// A loaded text-to-image model.
pub trait ModelPipeline: Send + Sync {
    /// Reconcile a weight overlay against the model's parameters and apply what matches.
    fn apply_overlay(&mut self, overlay: &WeightOverlay, scale: f64) -> Result<OverlayReport>;

    /// Generate a `(1, 3, height, width)` u8 image tensor.
    fn forward(
        &mut self,
        prompt: &str,
        params: &DiffusionGenerationParams,
    ) -> candle_core::Result<Tensor>;
}

#[derive(Clone, Debug, Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    name: String,
}

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    #[cfg(not(feature = "metal"))]
    let device = Device::cuda_if_available(0)?;
    #[cfg(feature = "metal")]
    let device = Device::new_metal(0)?;
    Ok(device)
}

/// Represents the model and provides methods to load and interact with it.
pub struct Pipeline {
    model: Box<dyn ModelPipeline>,
}

impl Pipeline {
    /// Load the model from checkpoint sources.
    ///
    /// `tokenizer` overrides where `tokenizer.json` is read from.
    pub fn load(
        base: &dyn CheckpointSource,
        tokenizer: Option<&dyn CheckpointSource>,
        cfg: &GenerationConfig,
        silent: bool,
    ) -> Result<Self> {
        info!("loading from source: {base}.");

        let ModelIndex { name } = serde_json::from_str(&base.read_to_string("model_index.json")?)
            .map_err(|e| anyhow::anyhow!("invalid `model_index.json`: {e}"))?;

        let model_loader: Box<dyn Loader> = match name.as_str() {
            "StableDiffusionPipeline" => Box::new(StableDiffusionLoader),
            other => anyhow::bail!("Unexpected loader type `{other:?}`."),
        };

        info!("model architecture is: {}", model_loader.name());

        let mut components = HashMap::new();
        for component in NiceProgressBar::<_, 'g'>(
            model_loader.required_component_names().into_iter(),
            "Loading components",
            silent,
        ) {
            components.insert(component, component.resolve(base, tokenizer)?);
        }

        let device = select_device(cfg.cpu)?;
        let dtype = cfg.dtype.try_into_dtype(&device, silent)?;
        info!("running on {device:?}");

        let model = model_loader.load_from_components(components, &device, dtype, silent)?;
        Ok(Self { model })
    }

    /// Load the model named by a [`ModelSource`], fetching from the Hugging Face Hub as needed.
    ///
    /// Note:
    /// - `token` and `cfg.revision` are only applicable for Hugging Face models.
    pub fn from_model_source(
        source: &ModelSource,
        cfg: &GenerationConfig,
        token: TokenSource,
        silent: bool,
    ) -> Result<Self> {
        info!("loading from model source: {source}.");
        let (base, tokenizer) =
            FileLoader::from_model_source(source, silent, token, cfg.revision.clone())?;
        Self::load(
            &base,
            tokenizer.as_ref().map(|t| t as &dyn CheckpointSource),
            cfg,
            silent,
        )
    }

    /// Load the base checkpoint and tokenizer named in `cfg`.
    pub fn from_config(cfg: &GenerationConfig, token: TokenSource, silent: bool) -> Result<Self> {
        let source = ModelSource::from_model_id(&cfg.base_checkpoint)
            .override_tokenizer_model_id(&cfg.tokenizer)?;
        Self::from_model_source(&source, cfg, token, silent)
    }

    /// Wrap an already constructed model.
    pub fn from_model(model: Box<dyn ModelPipeline>) -> Self {
        Self { model }
    }

    pub fn apply_overlay(&mut self, overlay: &WeightOverlay, scale: f64) -> Result<OverlayReport> {
        self.model.apply_overlay(overlay, scale)
    }

    /// Generate an image for `prompt`.
    pub fn forward(
        &mut self,
        prompt: &str,
        params: &DiffusionGenerationParams,
    ) -> Result<DynamicImage> {
        let img = self.model.forward(prompt, params)?;

        let (b, c, h, w) = img.dims4()?;
        if b != 1 {
            anyhow::bail!("Expected a single image in the output batch, got {b}");
        }
        if c != 3 {
            anyhow::bail!("Expected 3 channels in image output");
        }
        let flattened = img.squeeze(0)?.permute((1, 2, 0))?.flatten_all()?;
        #[allow(clippy::cast_possible_truncation)]
        let image = RgbImage::from_raw(w as u32, h as u32, flattened.to_vec1::<u8>()?)
            .ok_or(candle_core::Error::Msg(
                "RgbImage has invalid capacity.".to_string(),
            ))?;
        Ok(DynamicImage::ImageRgb8(image))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn component_files_follow_the_diffusers_layout() -> Result<()> {
        let base = tempfile::tempdir()?;
        let tok = tempfile::tempdir()?;
        for file in [
            "scheduler/scheduler_config.json",
            "text_encoder/model.safetensors",
            "unet/config.json",
            "unet/diffusion_pytorch_model.safetensors",
            "tokenizer/tokenizer.json",
        ] {
            let path = base.path().join(file);
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(path, "")?;
        }
        fs::write(tok.path().join("tokenizer.json"), "")?;

        let base = FileLoader::Local(base.path().to_path_buf());
        let tok_dir = tok.path().to_path_buf();
        let tok = FileLoader::Local(tok_dir.clone());

        let ComponentElem::Model {
            safetensors,
            config: Some(config),
        } = ComponentName::Unet.resolve(&base, None)?
        else {
            panic!("UNet should be a model with a config");
        };
        assert!(safetensors.ends_with("unet/diffusion_pytorch_model.safetensors"));
        assert!(config.ends_with("unet/config.json"));

        let tok: &dyn CheckpointSource = &tok;
        let ComponentElem::Other { file } = ComponentName::Tokenizer.resolve(&base, Some(tok))?
        else {
            panic!("tokenizer should be a single file");
        };
        assert!(file.starts_with(&tok_dir));

        let ComponentElem::Other { file } = ComponentName::Tokenizer.resolve(&base, None)? else {
            panic!("tokenizer should be a single file");
        };
        assert!(file.ends_with("tokenizer/tokenizer.json"));

        // The VAE was never written.
        assert!(ComponentName::Vae.resolve(&base, None).is_err());
        Ok(())
    }

    #[test]
    fn unknown_pipelines_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join("model_index.json"),
            r#"{"_class_name": "FluxPipeline"}"#,
        )?;
        let base = FileLoader::Local(dir.path().to_path_buf());
        let cfg = GenerationConfig {
            cpu: true,
            ..Default::default()
        };
        let err = Pipeline::load(&base, None, &cfg, true).err().unwrap();
        assert!(err.to_string().contains("FluxPipeline"));
        Ok(())
    }

    #[test]
    fn params_follow_the_config() {
        let cfg = GenerationConfig {
            steps: 12,
            seed: Some(7),
            ..Default::default()
        };
        let params = DiffusionGenerationParams::from(&cfg);
        assert_eq!(params.num_steps, 12);
        assert_eq!(params.guidance_scale, 7.5);
        assert_eq!(params.seed, Some(7));
        assert_eq!((params.height, params.width), (512, 512));
    }
}
