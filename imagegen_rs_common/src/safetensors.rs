use std::{collections::HashMap, fs::File, path::Path};

use anyhow::Context;
use candle_core::safetensors::Load;
use candle_core::{DType, Device, Error, Result, Tensor};
use memmap2::Mmap;
use safetensors::tensor as st;
use safetensors::tensor::SafeTensors;

use crate::IterWithProgress;

pub struct BytesSafetensors<'a> {
    safetensors: SafeTensors<'a>,
}

impl<'a> BytesSafetensors<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<BytesSafetensors<'a>> {
        let st = safetensors::SafeTensors::deserialize(bytes).map_err(Error::from)?;
        Ok(Self { safetensors: st })
    }

    pub fn load(&self, name: &str, dev: &Device) -> Result<Tensor> {
        self.get(name)?.load(dev)
    }

    pub fn names(&self) -> Vec<String> {
        self.safetensors
            .names()
            .into_iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<st::TensorView<'_>> {
        Ok(self.safetensors.tensor(name)?)
    }
}

/// Memory map a `.safetensors` file and load every tensor in it onto `device`.
///
/// If `dtype` is specified, floating point tensors are cast to it. Set `silent` to not show a
/// progress bar.
pub fn load_safetensors(
    path: &Path,
    device: &Device,
    dtype: Option<DType>,
    silent: bool,
) -> anyhow::Result<HashMap<String, Tensor>> {
    let file = File::open(path).with_context(|| format!("cannot open `{}`", path.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };
    let tensors = BytesSafetensors::new(&mmap)
        .with_context(|| format!("`{}` is not a valid safetensors file", path.display()))?;

    let mut loaded = HashMap::new();
    for name in tensors.names().into_iter().with_progress(silent) {
        let mut tensor = tensors.load(&name, device)?;
        if let Some(dtype) = dtype {
            if tensor.dtype().is_float() {
                tensor = tensor.to_dtype(dtype)?;
            }
        }
        loaded.insert(name, tensor);
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_and_casts_tensors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.safetensors");

        let dev = Device::Cpu;
        let tensors = HashMap::from([
            (
                "layer.weight".to_string(),
                Tensor::new(&[[1f32, 2.], [3., 4.]], &dev)?,
            ),
            ("layer.steps".to_string(), Tensor::new(&[7u32], &dev)?),
        ]);
        candle_core::safetensors::save(&tensors, &path)?;

        let loaded = load_safetensors(&path, &dev, Some(DType::F16), true)?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["layer.weight"].dtype(), DType::F16);
        assert_eq!(loaded["layer.weight"].dims(), &[2, 2]);
        assert_eq!(loaded["layer.steps"].dtype(), DType::U32);
        Ok(())
    }

    #[test]
    fn rejects_garbage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.safetensors");
        std::fs::write(&path, b"definitely not safetensors")?;

        let err = load_safetensors(&path, &Device::Cpu, None, true).unwrap_err();
        assert!(format!("{err:#}").contains("not a valid safetensors file"));
        Ok(())
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_safetensors(
            Path::new("/nonexistent/weights.safetensors"),
            &Device::Cpu,
            None,
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/weights.safetensors"));
    }
}
