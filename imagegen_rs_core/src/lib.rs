//! Core crate of imagegen_rs: Stable Diffusion text-to-image generation with a fine-tuned weight
//! overlay merged into the UNet.
//!
//! ```rust,no_run
//! use imagegen_rs_core::{generate, GenerationConfig, GenerationRequest, Pipeline, TokenSource};
//!
//! let request = GenerationRequest {
//!     model_path: "my-finetune".into(),
//!     prompt: "Draw a picture of a sunrise.".to_string(),
//!     config: GenerationConfig {
//!         seed: Some(42),
//!         ..Default::default()
//!     },
//! };
//!
//! let image = generate(
//!     &request,
//!     |cfg| Pipeline::from_config(cfg, TokenSource::HubCache, false),
//!     false,
//! )?;
//!
//! std::fs::write("image.png", &image.png)?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod config;
mod generate;
mod models;
mod overlay;
mod pipelines;
mod util;

pub use config::{
    ConfigError, GenerationConfig, DEFAULT_BASE_CHECKPOINT, DEFAULT_GUIDANCE_SCALE,
    DEFAULT_IMAGE_SIZE, DEFAULT_STEPS, DEFAULT_TOKENIZER,
};
pub use generate::{generate, GeneratedImage, GenerationRequest};
pub use imagegen_rs_common::{CheckpointSource, FileLoader, ModelSource, TokenSource};
pub use overlay::{
    OverlayError, OverlayReport, SkipReason, SkippedKey, WeightOverlay, OVERLAY_SUBPATH,
};
pub use pipelines::{DiffusionGenerationParams, ModelPipeline, Pipeline};
pub use util::{encode_base64, encode_png, ModelDType, TryIntoDType, PNG_SIGNATURE};
