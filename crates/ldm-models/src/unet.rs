//! Denoising UNet
//!
//! Block lists are generated from [`UNetConfig`] in checkpoint order:
//! `input_blocks`, `middle_block` and `output_blocks` are sequences of
//! [`Layer`] sequences, so `input_blocks.1.1` is the transformer of the
//! first residual stage.

use candle_core::{bail, Result, Tensor};
use tracing::debug;

use crate::error::ModelError;
use crate::layers::{
    sequential, Conditioning, Conv2d, Downsample, GroupNorm, Layer, Linear, ResBlock,
    SpatialTransformer, Upsample,
};

/// UNet configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UNetConfig {
    /// Latent channels in
    pub in_channels: usize,
    /// Latent channels out
    pub out_channels: usize,
    /// Width of the first level; the time embedding is 4× this
    pub model_channels: usize,
    /// Width multiplier per resolution level
    pub channel_mult: Vec<usize>,
    /// Residual blocks per input level (output levels use one more)
    pub num_res_blocks: usize,
    /// Levels that carry a spatial transformer after each residual block
    pub attention_levels: Vec<usize>,
    /// Attention heads; head width is channels / heads
    pub num_heads: usize,
    /// Width of the cross-attention context
    pub context_dim: usize,
    /// Groups of every group norm
    pub norm_groups: usize,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            model_channels: 320,
            channel_mult: vec![1, 2, 4, 4],
            num_res_blocks: 2,
            attention_levels: vec![0, 1, 2],
            num_heads: 8,
            context_dim: 768,
            norm_groups: 32,
        }
    }
}

impl UNetConfig {
    /// Two levels, 8 base channels, attention on the lower level
    pub fn tiny() -> Self {
        Self {
            model_channels: 8,
            channel_mult: vec![1, 2],
            num_res_blocks: 1,
            attention_levels: vec![1],
            num_heads: 2,
            context_dim: 16,
            norm_groups: 4,
            ..Default::default()
        }
    }

    pub fn time_embed_dim(&self) -> usize {
        self.model_channels * 4
    }

    pub fn validate(&self) -> std::result::Result<(), ModelError> {
        let invalid = |msg: String| Err(ModelError::InvalidConfig(msg));

        if self.channel_mult.is_empty() {
            return invalid("unet needs at least one level".into());
        }
        if self.num_heads == 0 || self.norm_groups == 0 {
            return invalid("num_heads and norm_groups must be positive".into());
        }
        if let Some(level) = self
            .attention_levels
            .iter()
            .find(|&&level| level >= self.channel_mult.len())
        {
            return invalid(format!(
                "attention level {} out of {} levels",
                level,
                self.channel_mult.len()
            ));
        }
        for mult in &self.channel_mult {
            let channels = self.model_channels * mult;
            if channels == 0 || channels % self.norm_groups != 0 {
                return invalid(format!(
                    "{} channels not divisible into {} groups",
                    channels, self.norm_groups
                ));
            }
            if channels % self.num_heads != 0 {
                return invalid(format!(
                    "{} channels not divisible into {} heads",
                    channels, self.num_heads
                ));
            }
        }
        Ok(())
    }

    fn transformer(&self, channels: usize) -> Layer {
        SpatialTransformer::new(
            channels,
            self.context_dim,
            self.num_heads,
            channels / self.num_heads,
            self.norm_groups,
        )
        .into()
    }
}

/// Latent-space UNet conditioned on time and text context
#[derive(Debug, Clone)]
pub struct UNetModel {
    time_embed: Vec<Layer>,
    input_blocks: Vec<Vec<Layer>>,
    middle_block: Vec<Layer>,
    output_blocks: Vec<Vec<Layer>>,
    out: Vec<Layer>,
}

ldm_core::composite!(UNetModel {
    time_embed,
    input_blocks,
    middle_block,
    output_blocks,
    out,
});

impl UNetModel {
    pub fn new(config: &UNetConfig) -> crate::Result<Self> {
        config.validate()?;

        let mc = config.model_channels;
        let emb = config.time_embed_dim();
        let groups = config.norm_groups;
        let last = config.channel_mult.len() - 1;

        let time_embed = vec![
            Linear::new(mc, emb).into(),
            Layer::Silu,
            Linear::new(emb, emb).into(),
        ];

        let mut input_blocks: Vec<Vec<Layer>> =
            vec![vec![Conv2d::new(config.in_channels, mc, 3).with_padding(1).into()]];
        let mut skip_channels = vec![mc];
        let mut ch = mc;

        for (level, mult) in config.channel_mult.iter().enumerate() {
            let attention = config.attention_levels.contains(&level);
            for _ in 0..config.num_res_blocks {
                let out_ch = mc * mult;
                let mut block: Vec<Layer> = vec![ResBlock::new(ch, emb, out_ch, groups).into()];
                ch = out_ch;
                if attention {
                    block.push(config.transformer(ch));
                }
                input_blocks.push(block);
                skip_channels.push(ch);
            }
            if level != last {
                input_blocks.push(vec![Downsample::new(ch).into()]);
                skip_channels.push(ch);
            }
        }

        let middle_block = vec![
            ResBlock::new(ch, emb, ch, groups).into(),
            config.transformer(ch),
            ResBlock::new(ch, emb, ch, groups).into(),
        ];

        let mut output_blocks = Vec::with_capacity(skip_channels.len());
        for (level, mult) in config.channel_mult.iter().enumerate().rev() {
            let attention = config.attention_levels.contains(&level);
            for i in 0..=config.num_res_blocks {
                let skip = skip_channels.pop().ok_or_else(|| {
                    ModelError::InvalidConfig("skip connections exhausted".into())
                })?;
                let out_ch = mc * mult;
                let mut block: Vec<Layer> =
                    vec![ResBlock::new(ch + skip, emb, out_ch, groups).into()];
                ch = out_ch;
                if attention {
                    block.push(config.transformer(ch));
                }
                if level != 0 && i == config.num_res_blocks {
                    block.push(Upsample::new(ch).into());
                }
                output_blocks.push(block);
            }
        }

        let out = vec![
            GroupNorm::new(ch, groups).into(),
            Layer::Silu,
            Conv2d::new(mc, config.out_channels, 3).with_padding(1).into(),
        ];

        debug!(
            input_blocks = input_blocks.len(),
            output_blocks = output_blocks.len(),
            "unet assembled"
        );

        Ok(Self {
            time_embed,
            input_blocks,
            middle_block,
            output_blocks,
            out,
        })
    }

    /// Predict noise for latent `xs` `(b, in, h, w)`.
    ///
    /// `t_emb` is the time-embedding input `(b, model_channels)`; `context`
    /// is the text encoding `(b, tokens, context_dim)`.
    pub fn forward(&self, xs: &Tensor, t_emb: &Tensor, context: &Tensor) -> Result<Tensor> {
        let emb = sequential(&self.time_embed, t_emb, &Conditioning::none())?;
        let cond = Conditioning::new(&emb, Some(context));

        let mut saved = Vec::with_capacity(self.input_blocks.len());
        let mut h = xs.clone();
        for block in &self.input_blocks {
            h = sequential(block, &h, &cond)?;
            saved.push(h.clone());
        }

        h = sequential(&self.middle_block, &h, &cond)?;

        for block in &self.output_blocks {
            let skip = match saved.pop() {
                Some(skip) => skip,
                None => bail!("unet skip stack exhausted"),
            };
            h = sequential(block, &Tensor::cat(&[&h, &skip], 1)?, &cond)?;
        }

        sequential(&self.out, &h, &Conditioning::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use ldm_core::{materialize, parameter_count, parameters, Init};

    fn shape_of(root: &dyn ldm_core::Composite, key: &str) -> Option<Vec<usize>> {
        parameters(root)
            .into_iter()
            .find(|(p, _)| p.to_string() == key)
            .map(|(_, param)| param.shape().dims().to_vec())
    }

    #[test]
    fn test_sd_v1_parameter_count() {
        let unet = UNetModel::new(&UNetConfig::default()).unwrap();
        assert_eq!(parameter_count(&unet), 859_520_964);
        assert_eq!(unet.input_blocks.len(), 12);
        assert_eq!(unet.output_blocks.len(), 12);
    }

    #[test]
    fn test_sd_v1_key_shapes() {
        let unet = UNetModel::new(&UNetConfig::default()).unwrap();

        assert_eq!(shape_of(&unet, "time_embed.0.weight"), Some(vec![1280, 320]));
        assert_eq!(shape_of(&unet, "time_embed.2.weight"), Some(vec![1280, 1280]));
        assert_eq!(
            shape_of(&unet, "input_blocks.0.0.weight"),
            Some(vec![320, 4, 3, 3])
        );
        assert_eq!(
            shape_of(&unet, "input_blocks.1.1.transformer_blocks.0.attn1.to_q.weight"),
            Some(vec![320, 320])
        );
        assert_eq!(
            shape_of(&unet, "input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight"),
            Some(vec![320, 768])
        );
        assert_eq!(
            shape_of(&unet, "input_blocks.3.0.op.weight"),
            Some(vec![320, 320, 3, 3])
        );
        assert_eq!(
            shape_of(&unet, "middle_block.1.proj_in.weight"),
            Some(vec![1280, 1280, 1, 1])
        );
        assert_eq!(
            shape_of(&unet, "output_blocks.0.0.skip_connection.weight"),
            Some(vec![1280, 2560, 1, 1])
        );
        assert_eq!(
            shape_of(&unet, "output_blocks.2.1.conv.weight"),
            Some(vec![1280, 1280, 3, 3])
        );
        assert_eq!(
            shape_of(&unet, "output_blocks.11.1.transformer_blocks.0.ff.net.0.proj.weight"),
            Some(vec![2560, 320])
        );
        assert_eq!(shape_of(&unet, "out.2.weight"), Some(vec![4, 320, 3, 3]));
        assert_eq!(shape_of(&unet, "input_blocks.10.1.norm.weight"), None);
    }

    #[test]
    fn test_tiny_forward() {
        let config = UNetConfig::tiny();
        let mut unet = UNetModel::new(&config).unwrap();
        assert_eq!(parameter_count(&unet), 64_796);
        materialize(&mut unet, Init::Normal { std: 0.02 }, &Device::Cpu).unwrap();

        let latent = Tensor::randn(0f32, 1f32, (2, 4, 8, 8), &Device::Cpu).unwrap();
        let t_emb = Tensor::zeros((2, config.model_channels), DType::F32, &Device::Cpu).unwrap();
        let context =
            Tensor::randn(0f32, 1f32, (2, 5, config.context_dim), &Device::Cpu).unwrap();

        let noise = unet.forward(&latent, &t_emb, &context).unwrap();
        assert_eq!(noise.dims(), &[2, 4, 8, 8]);
    }

    #[test]
    fn test_invalid_attention_level() {
        let config = UNetConfig {
            attention_levels: vec![2],
            ..UNetConfig::tiny()
        };
        assert!(matches!(
            UNetModel::new(&config),
            Err(ModelError::InvalidConfig(_))
        ));

        let config = UNetConfig {
            num_heads: 3,
            ..UNetConfig::tiny()
        };
        assert!(UNetModel::new(&config).is_err());
    }
}
