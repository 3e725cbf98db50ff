use std::{
    fmt::{Debug, Display},
    fs,
    path::{Path, PathBuf},
};

use crate::TokenSource;
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};

/// Resolves files of a pretrained checkpoint to local paths.
///
/// This is the seam through which the checkpoint cache is reached: the Hugging Face Hub, a local
/// directory, or anything a test wants to put in place.
pub trait CheckpointSource: Display {
    /// Resolve `name` (relative to the checkpoint root, e.g. `unet/config.json`) to a local file.
    fn get(&self, name: &str) -> anyhow::Result<PathBuf>;

    /// Resolve and read `name` as UTF-8 text.
    fn read_to_string(&self, name: &str) -> anyhow::Result<String> {
        let path = self.get(name)?;
        Ok(fs::read_to_string(path)?)
    }
}

/// Source from which to load the model. This is easiest to create with the various constructor
/// functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    ModelId(String),
    ModelIdWithTokenizer {
        model_id: String,
        tokenizer_model_id: String,
    },
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelId(model_id) => write!(f, "model id: {model_id}"),
            Self::ModelIdWithTokenizer {
                model_id,
                tokenizer_model_id,
            } => write!(
                f,
                "model id: {model_id}, tokenizer override: {tokenizer_model_id}"
            ),
        }
    }
}

impl ModelSource {
    /// Load the model from a Hugging Face model ID or a local path.
    pub fn from_model_id<S: ToString>(model_id: S) -> Self {
        Self::ModelId(model_id.to_string())
    }

    /// Load the tokenizer of this model from a Hugging Face model ID or a local path.
    ///
    /// Diffusers checkpoints ship the CLIP vocabulary without a `tokenizer.json`, so the tokenizer
    /// usually comes from the matching CLIP repository.
    ///
    /// ```rust
    /// use imagegen_rs_common::ModelSource;
    ///
    /// let _ = ModelSource::from_model_id("stable-diffusion-v1-5/stable-diffusion-v1-5")
    ///     .override_tokenizer_model_id("openai/clip-vit-base-patch32")?;
    ///
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn override_tokenizer_model_id<S: ToString>(self, model_id: S) -> anyhow::Result<Self> {
        let Self::ModelId(base_id) = self else {
            anyhow::bail!("Expected model ID for the model source")
        };
        Ok(Self::ModelIdWithTokenizer {
            model_id: base_id,
            tokenizer_model_id: model_id.to_string(),
        })
    }
}

/// A [`CheckpointSource`] for one model ID.
pub enum FileLoader {
    Api(Box<ApiRepo>),
    Local(PathBuf),
}

impl Display for FileLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api(api) => write!(f, "hub repo: {}", api.url("")),
            Self::Local(dir) => write!(f, "local directory: {}", dir.display()),
        }
    }
}

impl Debug for FileLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FileLoader {
    /// A model ID naming an existing directory is read from disk; anything else goes to the Hub.
    pub fn from_model_id(
        model_id: &str,
        silent: bool,
        token: &TokenSource,
        revision: Option<String>,
    ) -> anyhow::Result<Self> {
        if Path::new(model_id).is_dir() {
            return Ok(Self::Local(PathBuf::from(model_id)));
        }

        let api = token
            .apply(ApiBuilder::new().with_progress(!silent))
            .build()?;
        let revision = revision.unwrap_or("main".to_string());
        Ok(Self::Api(Box::new(api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision,
        )))))
    }

    /// Build the base and tokenizer loaders for a model source.
    ///
    /// Without a tokenizer override, the tokenizer loader is `None` and tokenizer files are read
    /// from the base checkpoint.
    pub fn from_model_source(
        source: &ModelSource,
        silent: bool,
        token: TokenSource,
        revision: Option<String>,
    ) -> anyhow::Result<(Self, Option<Self>)> {
        match source {
            ModelSource::ModelId(model_id) => Ok((
                Self::from_model_id(model_id, silent, &token, revision)?,
                None,
            )),
            ModelSource::ModelIdWithTokenizer {
                model_id,
                tokenizer_model_id,
            } => {
                let base = Self::from_model_id(model_id, silent, &token, revision)?;
                // The revision pins the base checkpoint only.
                let tokenizer = Self::from_model_id(tokenizer_model_id, silent, &token, None)?;
                Ok((base, Some(tokenizer)))
            }
        }
    }
}

impl CheckpointSource for FileLoader {
    fn get(&self, name: &str) -> anyhow::Result<PathBuf> {
        match self {
            Self::Api(api) => api
                .get(name)
                .map_err(|e| anyhow::Error::msg(format!("could not fetch `{name}`: {e}"))),
            Self::Local(dir) => {
                let path = dir.join(name);
                if !path.is_file() {
                    anyhow::bail!("`{}` does not exist", path.display());
                }
                Ok(path)
            }
        }
    }
}
