use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    overlay::{OverlayReport, WeightOverlay},
    pipelines::{DiffusionGenerationParams, Pipeline},
    util::{encode_base64, encode_png},
    GenerationConfig,
};

/// One text-to-image request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Directory holding `model/pytorch_lora_weights.safetensors`.
    pub model_path: PathBuf,
    pub prompt: String,
    pub config: GenerationConfig,
}

/// A generated PNG along with how the overlay was applied.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub png: Vec<u8>,
    pub report: OverlayReport,
}

impl GeneratedImage {
    pub fn to_base64(&self) -> String {
        encode_base64(&self.png)
    }
}

/// Generate one image with the weight overlay from `request.model_path` merged into the base model.
///
/// The overlay is loaded before `construct` is called, so a missing or unreadable overlay fails
/// without touching the base checkpoint.
pub fn generate<F>(
    request: &GenerationRequest,
    construct: F,
    silent: bool,
) -> Result<GeneratedImage>
where
    F: FnOnce(&GenerationConfig) -> Result<Pipeline>,
{
    let cfg = &request.config;
    cfg.validate()?;

    let overlay = WeightOverlay::load(&request.model_path, silent)?;
    info!(
        "weight overlay `{}` holds {} tensor(s)",
        overlay.path().display(),
        overlay.len()
    );

    let mut pipeline = construct(cfg).context("failed to load the base model")?;

    let report = pipeline.apply_overlay(&overlay, cfg.overlay_scale)?;
    report.log();
    if cfg.strict_overlay {
        report.ensure_strict()?;
    }

    let image = pipeline.forward(&request.prompt, &DiffusionGenerationParams::from(cfg))?;
    let png = encode_png(&image)?;
    Ok(GeneratedImage { png, report })
}
