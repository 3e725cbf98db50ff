use std::fmt::Display;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::info;

#[derive(Clone, Copy, Default, Debug, Deserialize, PartialEq, Eq, clap::ValueEnum)]
/// DType for the model.
///
/// Note: When using `Auto`, fallback pattern is: BF16 -> F16 -> F32
pub enum ModelDType {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "f16")]
    F16,
    #[default]
    #[serde(rename = "f32")]
    F32,
}

impl Display for ModelDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::BF16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// Type which can be converted to a DType
pub trait TryIntoDType {
    fn try_into_dtype(&self, device: &Device, silent: bool) -> Result<DType>;
}

impl TryIntoDType for DType {
    fn try_into_dtype(&self, _: &Device, silent: bool) -> Result<DType> {
        if !silent {
            info!("dtype selected is {self:?}.");
        }
        if !matches!(self, DType::BF16 | DType::F32 | DType::F64 | DType::F16) {
            anyhow::bail!("DType must be one of BF16, F16, F32, F64");
        }
        Ok(*self)
    }
}

/// Reduced precision is only worth probing on accelerators.
fn candidate_dtypes(device: &Device) -> Vec<DType> {
    if device.is_cpu() {
        Vec::new()
    } else {
        vec![DType::BF16, DType::F16]
    }
}

fn determine_auto_dtype(device: &Device) -> candle_core::Result<DType> {
    for dtype in candidate_dtypes(device) {
        // Try a matmul
        let x = Tensor::zeros((2, 2), dtype, device)?;
        if x.matmul(&x).is_ok() {
            return Ok(dtype);
        }
    }
    Ok(DType::F32)
}

impl TryIntoDType for ModelDType {
    fn try_into_dtype(&self, device: &Device, silent: bool) -> Result<DType> {
        let dtype = match self {
            Self::Auto => determine_auto_dtype(device).map_err(anyhow::Error::msg)?,
            Self::BF16 => DType::BF16,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        };
        if !silent {
            info!("dtype selected is {dtype:?}.");
        }
        Ok(dtype)
    }
}
