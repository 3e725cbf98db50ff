use candle_transformers::models::stable_diffusion::unet_2d::{
    BlockConfig, UNet2DConditionModelConfig,
};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
enum AttentionHeadDim {
    Shared(usize),
    PerBlock(Vec<usize>),
}

fn default_norm_num_groups() -> usize {
    32
}

fn default_norm_eps() -> f64 {
    1e-5
}

fn default_one_usize() -> usize {
    1
}

fn default_one_f64() -> f64 {
    1.
}

fn default_true() -> bool {
    true
}

/// The `unet/config.json` of a diffusers checkpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct UNetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    block_out_channels: Vec<usize>,
    down_block_types: Vec<String>,
    layers_per_block: usize,
    cross_attention_dim: usize,
    attention_head_dim: AttentionHeadDim,
    #[serde(default = "default_norm_num_groups")]
    norm_num_groups: usize,
    #[serde(default = "default_norm_eps")]
    norm_eps: f64,
    #[serde(default = "default_one_usize")]
    downsample_padding: usize,
    #[serde(default = "default_true")]
    flip_sin_to_cos: bool,
    #[serde(default)]
    freq_shift: f64,
    #[serde(default)]
    center_input_sample: bool,
    #[serde(default = "default_one_f64")]
    mid_block_scale_factor: f64,
    #[serde(default)]
    use_linear_projection: bool,
}

impl UNetConfig {
    pub fn to_model_config(
        &self,
        sliced_attention_size: Option<usize>,
    ) -> anyhow::Result<UNet2DConditionModelConfig> {
        let n_blocks = self.block_out_channels.len();
        if self.down_block_types.len() != n_blocks {
            anyhow::bail!(
                "UNet config has {} block output channels but {} down block types",
                n_blocks,
                self.down_block_types.len()
            );
        }
        let head_dims = match &self.attention_head_dim {
            AttentionHeadDim::Shared(dim) => vec![*dim; n_blocks],
            AttentionHeadDim::PerBlock(dims) if dims.len() == n_blocks => dims.clone(),
            AttentionHeadDim::PerBlock(dims) => anyhow::bail!(
                "UNet config has {} attention head dims for {n_blocks} blocks",
                dims.len()
            ),
        };

        let blocks = self
            .block_out_channels
            .iter()
            .zip(&self.down_block_types)
            .zip(head_dims)
            .map(|((&out_channels, ty), attention_head_dim)| BlockConfig {
                out_channels,
                use_cross_attn: ty.starts_with("CrossAttn").then_some(1),
                attention_head_dim,
            })
            .collect();

        Ok(UNet2DConditionModelConfig {
            center_input_sample: self.center_input_sample,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            blocks,
            layers_per_block: self.layers_per_block,
            downsample_padding: self.downsample_padding,
            mid_block_scale_factor: self.mid_block_scale_factor,
            norm_num_groups: self.norm_num_groups,
            norm_eps: self.norm_eps,
            cross_attention_dim: self.cross_attention_dim,
            sliced_attention_size,
            use_linear_projection: self.use_linear_projection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SD15_UNET: &str = r#"{
        "_class_name": "UNet2DConditionModel",
        "_diffusers_version": "0.6.0",
        "act_fn": "silu",
        "attention_head_dim": 8,
        "block_out_channels": [320, 640, 1280, 1280],
        "center_input_sample": false,
        "cross_attention_dim": 768,
        "down_block_types": [
            "CrossAttnDownBlock2D",
            "CrossAttnDownBlock2D",
            "CrossAttnDownBlock2D",
            "DownBlock2D"
        ],
        "downsample_padding": 1,
        "flip_sin_to_cos": true,
        "freq_shift": 0,
        "in_channels": 4,
        "layers_per_block": 2,
        "mid_block_scale_factor": 1,
        "norm_eps": 1e-05,
        "norm_num_groups": 32,
        "out_channels": 4,
        "sample_size": 64,
        "up_block_types": [
            "UpBlock2D",
            "CrossAttnUpBlock2D",
            "CrossAttnUpBlock2D",
            "CrossAttnUpBlock2D"
        ]
    }"#;

    #[test]
    fn maps_sd15_config() -> anyhow::Result<()> {
        let cfg: UNetConfig = serde_json::from_str(SD15_UNET)?;
        assert_eq!((cfg.in_channels, cfg.out_channels), (4, 4));

        let model = cfg.to_model_config(None)?;
        assert_eq!(model.cross_attention_dim, 768);
        assert_eq!(model.layers_per_block, 2);
        assert!(!model.use_linear_projection);
        let blocks = model
            .blocks
            .iter()
            .map(|b| (b.out_channels, b.use_cross_attn, b.attention_head_dim))
            .collect::<Vec<_>>();
        assert_eq!(
            blocks,
            vec![
                (320, Some(1), 8),
                (640, Some(1), 8),
                (1280, Some(1), 8),
                (1280, None, 8)
            ]
        );
        Ok(())
    }

    #[test]
    fn per_block_head_dims_must_match_blocks() -> anyhow::Result<()> {
        let json = SD15_UNET.replace(
            "\"attention_head_dim\": 8",
            "\"attention_head_dim\": [5, 10]",
        );
        let cfg: UNetConfig = serde_json::from_str(&json)?;
        assert!(cfg.to_model_config(None).is_err());

        let json = SD15_UNET.replace(
            "\"attention_head_dim\": 8",
            "\"attention_head_dim\": [5, 10, 20, 20]",
        );
        let cfg: UNetConfig = serde_json::from_str(&json)?;
        let heads = cfg
            .to_model_config(None)?
            .blocks
            .iter()
            .map(|b| b.attention_head_dim)
            .collect::<Vec<_>>();
        assert_eq!(heads, vec![5, 10, 20, 20]);
        Ok(())
    }
}
