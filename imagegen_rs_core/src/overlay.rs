//! Fine-tuned weight overlays (usually LoRA) and their reconciliation against the UNet parameters.
//!
//! Every overlay key ends up either applied or skipped with a [`SkipReason`]; nothing is dropped
//! silently. Recognised layouts:
//!
//! - plain parameters named like the UNet's own (`down_blocks.0.resnets.0.conv1.weight`),
//!   optionally prefixed with `unet.`, which replace the base value;
//! - LoRA pairs in the PEFT (`lora_A`/`lora_B`), diffusers (`lora.down`/`lora.up`), attention
//!   processor (`processor.to_q_lora.down`) or kohya (`lora_unet_..._to_q.lora_down` + `alpha`)
//!   layouts, which are fused into `<module>.weight`.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device, Result, Tensor};
use imagegen_rs_common::load_safetensors;
use thiserror::Error;
use tracing::{info, warn};

/// Location of the overlay file relative to the model directory.
pub const OVERLAY_SUBPATH: &str = "model/pytorch_lora_weights.safetensors";

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("weight overlay file `{0}` does not exist")]
    NotFound(PathBuf),
    #[error("weight overlay rejected in strict mode: {applied} key(s) applied, {skipped} skipped")]
    Rejected { applied: usize, skipped: usize },
}

/// Why an overlay key was not applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The targeted parameter does not exist in the UNet.
    UnknownParameter(String),
    ShapeMismatch {
        target: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /// One half of a LoRA down/up pair is missing.
    IncompleteLoraPair,
    /// The pair's tensors cannot form a low-rank update.
    MalformedLora(String),
    /// Only the UNet is overlaid.
    TextEncoderTarget,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownParameter(name) => write!(f, "no UNet parameter named `{name}`"),
            Self::ShapeMismatch {
                target,
                expected,
                found,
            } => write!(
                f,
                "shape mismatch for `{target}`: expected {expected:?}, found {found:?}"
            ),
            Self::IncompleteLoraPair => write!(f, "LoRA pair is missing its down or up half"),
            Self::MalformedLora(msg) => write!(f, "malformed LoRA pair: {msg}"),
            Self::TextEncoderTarget => write!(f, "targets the text encoder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedKey {
    pub key: String,
    pub reason: SkipReason,
}

/// The outcome of merging an overlay: which overlay keys were applied and which were skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayReport {
    pub applied: Vec<String>,
    pub skipped: Vec<SkippedKey>,
}

impl OverlayReport {
    fn skip(&mut self, key: impl ToString, reason: SkipReason) {
        self.skipped.push(SkippedKey {
            key: key.to_string(),
            reason,
        });
    }

    /// Log a summary at INFO and every skipped key at WARN.
    pub fn log(&self) {
        info!(
            "weight overlay: {} key(s) applied, {} skipped",
            self.applied.len(),
            self.skipped.len()
        );
        for SkippedKey { key, reason } in &self.skipped {
            warn!("overlay key `{key}` skipped: {reason}");
        }
        if self.applied.is_empty() {
            warn!(
                "no overlay key matched the base model, \
                 the output is the unmodified base checkpoint"
            );
        }
    }

    /// Strict mode: every key must apply, and at least one must.
    pub fn ensure_strict(&self) -> std::result::Result<(), OverlayError> {
        if self.skipped.is_empty() && !self.applied.is_empty() {
            Ok(())
        } else {
            Err(OverlayError::Rejected {
                applied: self.applied.len(),
                skipped: self.skipped.len(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraRole {
    Down,
    Up,
    Alpha,
}

const LORA_SUFFIXES: &[(&str, LoraRole)] = &[
    (".lora_A.weight", LoraRole::Down),
    (".lora_B.weight", LoraRole::Up),
    (".lora.down.weight", LoraRole::Down),
    (".lora.up.weight", LoraRole::Up),
    (".lora_down.weight", LoraRole::Down),
    (".lora_up.weight", LoraRole::Up),
    ("_lora.down.weight", LoraRole::Down),
    ("_lora.up.weight", LoraRole::Up),
    (".alpha", LoraRole::Alpha),
];

const KOHYA_UNET_PREFIX: &str = "lora_unet_";

#[derive(Debug, PartialEq)]
enum OverlayEntry {
    Direct(String),
    Lora { module: String, role: LoraRole },
    TextEncoder,
}

/// Map attention processor module names onto the attention module itself.
fn normalize_module(module: &str) -> String {
    let module = module.replace(".processor.", ".");
    if module.ends_with(".to_out") {
        format!("{module}.0")
    } else {
        module
    }
}

fn classify(key: &str) -> OverlayEntry {
    if key.starts_with("text_encoder") || key.starts_with("lora_te") {
        return OverlayEntry::TextEncoder;
    }
    let key = key.strip_prefix("unet.").unwrap_or(key);
    for (suffix, role) in LORA_SUFFIXES {
        if let Some(module) = key.strip_suffix(suffix) {
            return OverlayEntry::Lora {
                module: normalize_module(module),
                role: *role,
            };
        }
    }
    OverlayEntry::Direct(key.to_string())
}

#[derive(Default)]
struct LoraParts<'a> {
    keys: Vec<&'a str>,
    down: Option<&'a Tensor>,
    up: Option<&'a Tensor>,
    alpha: Option<&'a Tensor>,
}

/// Structural problems that rule a pair out before any tensor math runs.
fn malformed(down: &Tensor, up: &Tensor, alpha: Option<&Tensor>) -> Option<String> {
    if down.rank() < 2 || up.rank() < 2 {
        return Some(format!(
            "down and up must have at least 2 dims, found {:?} and {:?}",
            down.dims(),
            up.dims()
        ));
    }
    match alpha {
        Some(alpha) if alpha.elem_count() != 1 => Some(format!(
            "alpha must be a scalar, found shape {:?}",
            alpha.dims()
        )),
        _ => None,
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    t.to_dtype(DType::F64)?.flatten_all()?.get(0)?.to_scalar::<f64>()
}

/// The shape a weight takes with everything past the output dimension flattened.
fn flattened_dims(weight: &Tensor) -> Option<[usize; 2]> {
    match weight.dims() {
        [out, inner @ ..] => Some([*out, inner.iter().product()]),
        [] => None,
    }
}

/// `up @ down * scale * alpha / rank`, with conv kernels flattened into the inner dimension.
///
/// Returns `Ok(None)` if the pair does not have a shared rank.
fn lora_delta(
    down: &Tensor,
    up: &Tensor,
    alpha: Option<f64>,
    scale: f64,
) -> Result<Option<Tensor>> {
    let down = down.to_dtype(DType::F32)?.flatten_from(1)?;
    let up = up.to_dtype(DType::F32)?.flatten_from(1)?;
    let rank = down.dim(0)?;
    if up.dim(1)? != rank {
        return Ok(None);
    }
    let factor = scale * alpha.map(|a| a / rank as f64).unwrap_or(1.);
    Ok(Some((up.matmul(&down)? * factor)?))
}

/// A weight overlay loaded from disk.
pub struct WeightOverlay {
    path: PathBuf,
    tensors: HashMap<String, Tensor>,
}

impl WeightOverlay {
    /// The overlay location for a model directory.
    pub fn overlay_path(model_path: impl AsRef<Path>) -> PathBuf {
        model_path.as_ref().join(OVERLAY_SUBPATH)
    }

    /// Load `<model_path>/model/pytorch_lora_weights.safetensors` onto the CPU.
    pub fn load(model_path: impl AsRef<Path>, silent: bool) -> anyhow::Result<Self> {
        let path = Self::overlay_path(model_path);
        if !path.is_file() {
            return Err(OverlayError::NotFound(path).into());
        }
        if !silent {
            info!("loading weight overlay from `{}`", path.display());
        }
        let tensors = load_safetensors(&path, &Device::Cpu, None, silent)
            .map_err(|e| e.context(format!("failed to load weight overlay `{}`", path.display())))?;
        Ok(Self { path, tensors })
    }

    pub fn from_tensors(path: impl Into<PathBuf>, tensors: HashMap<String, Tensor>) -> Self {
        Self {
            path: path.into(),
            tensors,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Merge the overlay into `base`, a map of UNet parameter name to tensor.
    ///
    /// `scale` multiplies LoRA deltas; replaced parameters are taken as is. Merged tensors keep the
    /// device and dtype of the parameter they replace.
    pub fn merge_into(
        &self,
        base: &mut HashMap<String, Tensor>,
        scale: f64,
    ) -> Result<OverlayReport> {
        let mut report = OverlayReport::default();
        let mut pairs: BTreeMap<String, LoraParts<'_>> = BTreeMap::new();

        let mut keys = self.tensors.keys().collect::<Vec<_>>();
        keys.sort();
        for key in keys {
            let tensor = &self.tensors[key];
            match classify(key) {
                OverlayEntry::TextEncoder => report.skip(key, SkipReason::TextEncoderTarget),
                OverlayEntry::Direct(name) => {
                    let Some(current) = base.get(&name) else {
                        report.skip(key, SkipReason::UnknownParameter(name));
                        continue;
                    };
                    if current.dims() != tensor.dims() {
                        let reason = SkipReason::ShapeMismatch {
                            expected: current.dims().to_vec(),
                            found: tensor.dims().to_vec(),
                            target: name,
                        };
                        report.skip(key, reason);
                        continue;
                    }
                    let replacement = tensor
                        .to_device(current.device())?
                        .to_dtype(current.dtype())?;
                    base.insert(name, replacement);
                    report.applied.push(key.clone());
                }
                OverlayEntry::Lora { module, role } => {
                    let parts = pairs.entry(module).or_default();
                    parts.keys.push(key.as_str());
                    match role {
                        LoraRole::Down => parts.down = Some(tensor),
                        LoraRole::Up => parts.up = Some(tensor),
                        LoraRole::Alpha => parts.alpha = Some(tensor),
                    }
                }
            }
        }

        let mut kohya_modules: Option<HashMap<String, String>> = None;
        for (module, parts) in pairs {
            let (Some(down), Some(up)) = (parts.down, parts.up) else {
                for key in parts.keys {
                    report.skip(key, SkipReason::IncompleteLoraPair);
                }
                continue;
            };

            let target = match module.strip_prefix(KOHYA_UNET_PREFIX) {
                Some(mangled) => {
                    let index = kohya_modules.get_or_insert_with(|| {
                        base.keys()
                            .filter_map(|k| k.strip_suffix(".weight"))
                            .map(|m| (m.replace('.', "_"), m.to_string()))
                            .collect()
                    });
                    index.get(mangled).cloned().unwrap_or(module.clone())
                }
                None => module.clone(),
            };
            let weight_name = format!("{target}.weight");
            let Some(current) = base.get(&weight_name) else {
                for key in parts.keys {
                    report.skip(key, SkipReason::UnknownParameter(weight_name.clone()));
                }
                continue;
            };

            if let Some(msg) = malformed(down, up, parts.alpha) {
                for key in parts.keys {
                    report.skip(key, SkipReason::MalformedLora(msg.clone()));
                }
                continue;
            }

            let alpha = parts.alpha.map(scalar).transpose()?;
            let expected = flattened_dims(current);
            let delta = match lora_delta(down, up, alpha, scale)? {
                Some(delta) if expected.is_some_and(|e| delta.dims() == e) => delta,
                other => {
                    let found = match other {
                        Some(delta) => delta.dims().to_vec(),
                        None => up.dims().to_vec(),
                    };
                    for key in parts.keys {
                        report.skip(
                            key,
                            SkipReason::ShapeMismatch {
                                target: weight_name.clone(),
                                expected: current.dims().to_vec(),
                                found: found.clone(),
                            },
                        );
                    }
                    continue;
                }
            };
            let delta = delta
                .reshape(current.dims())?
                .to_device(current.device())?
                .to_dtype(current.dtype())?;
            let merged = (current + delta)?;
            base.insert(weight_name, merged);
            report.applied.extend(parts.keys.into_iter().map(String::from));
        }

        report.applied.sort();
        report.skipped.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(report)
    }
}
