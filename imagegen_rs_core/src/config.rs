use thiserror::Error;

use crate::ModelDType;

/// Default number of denoising steps.
pub const DEFAULT_STEPS: usize = 30;
/// Default classifier-free guidance scale.
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
/// Default base checkpoint: a Stable Diffusion 1.5 repository in the diffusers layout.
pub const DEFAULT_BASE_CHECKPOINT: &str = "stable-diffusion-v1-5/stable-diffusion-v1-5";
/// Default source of the CLIP `tokenizer.json`.
pub const DEFAULT_TOKENIZER: &str = "openai/clip-vit-base-patch32";
/// Default image height and width in pixels.
pub const DEFAULT_IMAGE_SIZE: usize = 512;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("the number of inference steps must be greater than 0")]
    ZeroSteps,
    #[error("guidance scale must be a finite number >= 0, got {0}")]
    InvalidGuidanceScale(f64),
    #[error("overlay scale must be finite, got {0}")]
    InvalidOverlayScale(f64),
    #[error("image {dim} must be a positive multiple of 8, got {value}")]
    InvalidImageSize { dim: &'static str, value: usize },
    #[error("the base checkpoint identifier must not be empty")]
    EmptyBaseCheckpoint,
}

/// Everything that tunes a generation besides the prompt and the overlay location.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// The number of denoising steps. More denoising steps usually lead to a higher quality image
    /// at the expense of slower inference.
    pub steps: usize,
    /// Higher guidance scale encourages to generate images that are closely linked to the text
    /// `prompt`, usually at the expense of lower image quality.
    pub guidance_scale: f64,
    /// Hugging Face model ID or local directory of the base checkpoint.
    pub base_checkpoint: String,
    /// Hugging Face model ID or local directory holding `tokenizer.json`.
    pub tokenizer: String,
    pub revision: Option<String>,
    pub height: usize,
    pub width: usize,
    pub seed: Option<u64>,
    pub dtype: ModelDType,
    /// Multiplier applied to LoRA deltas when merging the overlay.
    pub overlay_scale: f64,
    /// Fail instead of warning when overlay keys cannot be applied.
    pub strict_overlay: bool,
    /// Run on the CPU even if an accelerator is available.
    pub cpu: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            base_checkpoint: DEFAULT_BASE_CHECKPOINT.to_string(),
            tokenizer: DEFAULT_TOKENIZER.to_string(),
            revision: None,
            height: DEFAULT_IMAGE_SIZE,
            width: DEFAULT_IMAGE_SIZE,
            seed: None,
            dtype: ModelDType::F32,
            overlay_scale: 1.0,
            strict_overlay: false,
            cpu: false,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps == 0 {
            return Err(ConfigError::ZeroSteps);
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0. {
            return Err(ConfigError::InvalidGuidanceScale(self.guidance_scale));
        }
        if !self.overlay_scale.is_finite() {
            return Err(ConfigError::InvalidOverlayScale(self.overlay_scale));
        }
        for (dim, value) in [("height", self.height), ("width", self.width)] {
            if value == 0 || value % 8 != 0 {
                return Err(ConfigError::InvalidImageSize { dim, value });
            }
        }
        if self.base_checkpoint.trim().is_empty() {
            return Err(ConfigError::EmptyBaseCheckpoint);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = GenerationConfig::default();
        assert_eq!(cfg.steps, 30);
        assert_eq!(cfg.guidance_scale, 7.5);
        assert_eq!(cfg.dtype, ModelDType::F32);
        assert_eq!((cfg.height, cfg.width), (512, 512));
        assert!(!cfg.strict_overlay);
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn rejects_invalid_values() {
        let base = GenerationConfig::default();

        let cfg = GenerationConfig {
            steps: 0,
            ..base.clone()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroSteps));

        let cfg = GenerationConfig {
            guidance_scale: -1.,
            ..base.clone()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidGuidanceScale(-1.)));

        let cfg = GenerationConfig {
            guidance_scale: f64::NAN,
            ..base.clone()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidGuidanceScale(_))
        ));

        let cfg = GenerationConfig {
            width: 500,
            ..base.clone()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::InvalidImageSize {
                dim: "width",
                value: 500
            })
        );

        let cfg = GenerationConfig {
            base_checkpoint: " ".to_string(),
            ..base
        };
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyBaseCheckpoint));
    }

    #[test]
    fn zero_guidance_is_allowed() {
        let cfg = GenerationConfig {
            guidance_scale: 0.,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Ok(()));
    }
}
