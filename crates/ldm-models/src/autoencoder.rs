//! AutoencoderKL
//!
//! Maps images to latents and back. Only the mean of the latent
//! distribution is used; nothing is sampled.

use candle_core::{Module, Result, Tensor};

use crate::error::ModelError;
use crate::layers::{AttnBlock, Conv2d, GroupNorm, Padding, ResnetBlock, Upsample};

/// Autoencoder configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoencoderConfig {
    /// Image channels in
    pub in_channels: usize,
    /// Image channels out
    pub out_channels: usize,
    /// Width of the first resolution level
    pub base_channels: usize,
    /// Width multiplier per resolution level
    pub channel_mult: Vec<usize>,
    /// Residual blocks per encoder level (decoder uses one more)
    pub num_res_blocks: usize,
    /// Channels of the latent
    pub z_channels: usize,
    /// Channels kept after the quantization conv
    pub embed_dim: usize,
    /// Groups of every group norm
    pub norm_groups: usize,
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            base_channels: 128,
            channel_mult: vec![1, 2, 4, 4],
            num_res_blocks: 2,
            z_channels: 4,
            embed_dim: 4,
            norm_groups: 32,
        }
    }
}

impl AutoencoderConfig {
    /// Two levels, 8 base channels
    pub fn tiny() -> Self {
        Self {
            base_channels: 8,
            channel_mult: vec![1, 2],
            num_res_blocks: 1,
            norm_groups: 4,
            ..Default::default()
        }
    }

    /// Spatial reduction factor between image and latent
    pub fn downscale_factor(&self) -> usize {
        1 << self.channel_mult.len().saturating_sub(1)
    }

    pub fn validate(&self) -> std::result::Result<(), ModelError> {
        if self.channel_mult.is_empty() {
            return Err(ModelError::InvalidConfig(
                "autoencoder needs at least one level".into(),
            ));
        }
        if self.norm_groups == 0 {
            return Err(ModelError::InvalidConfig("norm_groups must be positive".into()));
        }
        for mult in &self.channel_mult {
            let channels = self.base_channels * mult;
            if channels == 0 || channels % self.norm_groups != 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "{} channels not divisible into {} groups",
                    channels, self.norm_groups
                )));
            }
        }
        Ok(())
    }
}

/// Encoder downsampling, padded right and bottom only
#[derive(Debug, Clone)]
pub struct StridedConv {
    conv: Conv2d,
}

ldm_core::composite!(StridedConv { conv });

impl StridedConv {
    fn new(channels: usize) -> Self {
        Self {
            conv: Conv2d::new(channels, channels, 3)
                .with_stride(2)
                .with_padding_mode(Padding::Asymmetric {
                    left: 0,
                    right: 1,
                    top: 0,
                    bottom: 1,
                }),
        }
    }
}

impl Module for StridedConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)
    }
}

/// Residual, attention, residual at the lowest resolution
#[derive(Debug, Clone)]
pub struct Mid {
    block_1: ResnetBlock,
    attn_1: AttnBlock,
    block_2: ResnetBlock,
}

ldm_core::composite!(Mid {
    block_1,
    attn_1,
    block_2,
});

impl Mid {
    fn new(channels: usize, groups: usize) -> Self {
        Self {
            block_1: ResnetBlock::new(channels, channels, groups),
            attn_1: AttnBlock::new(channels, groups),
            block_2: ResnetBlock::new(channels, channels, groups),
        }
    }
}

impl Module for Mid {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.block_1.forward(xs)?;
        let h = self.attn_1.forward(&h)?;
        self.block_2.forward(&h)
    }
}

/// One encoder resolution level
#[derive(Debug, Clone)]
pub struct DownLevel {
    block: Vec<ResnetBlock>,
    downsample: Option<StridedConv>,
}

ldm_core::composite!(DownLevel { block, downsample });

/// One decoder resolution level
#[derive(Debug, Clone)]
pub struct UpLevel {
    block: Vec<ResnetBlock>,
    upsample: Option<Upsample>,
}

ldm_core::composite!(UpLevel { block, upsample });

fn run_blocks(blocks: &[ResnetBlock], xs: &Tensor) -> Result<Tensor> {
    blocks
        .iter()
        .try_fold(xs.clone(), |h, block| block.forward(&h))
}

/// Image to latent moments
#[derive(Debug, Clone)]
pub struct Encoder {
    conv_in: Conv2d,
    down: Vec<DownLevel>,
    mid: Mid,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

ldm_core::composite!(Encoder {
    conv_in,
    down,
    mid,
    norm_out,
    conv_out,
});

impl Encoder {
    pub fn new(config: &AutoencoderConfig) -> crate::Result<Self> {
        config.validate()?;
        let ch = config.base_channels;
        let groups = config.norm_groups;
        let last = config.channel_mult.len() - 1;

        let mut block_in = ch;
        let mut down = Vec::with_capacity(config.channel_mult.len());
        for (level, mult) in config.channel_mult.iter().enumerate() {
            let block_out = ch * mult;
            let mut block = Vec::with_capacity(config.num_res_blocks);
            for _ in 0..config.num_res_blocks {
                block.push(ResnetBlock::new(block_in, block_out, groups));
                block_in = block_out;
            }
            down.push(DownLevel {
                block,
                downsample: (level != last).then(|| StridedConv::new(block_in)),
            });
        }

        Ok(Self {
            conv_in: Conv2d::new(config.in_channels, ch, 3).with_padding(1),
            down,
            mid: Mid::new(block_in, groups),
            norm_out: GroupNorm::new(block_in, groups).with_eps(1e-6),
            conv_out: Conv2d::new(block_in, 2 * config.z_channels, 3).with_padding(1),
        })
    }
}

impl Module for Encoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(xs)?;
        for level in &self.down {
            h = run_blocks(&level.block, &h)?;
            if let Some(downsample) = &level.downsample {
                h = downsample.forward(&h)?;
            }
        }
        let h = self.mid.forward(&h)?;
        let h = candle_nn::ops::silu(&self.norm_out.forward(&h)?)?;
        self.conv_out.forward(&h)
    }
}

/// Latent to image
#[derive(Debug, Clone)]
pub struct Decoder {
    conv_in: Conv2d,
    mid: Mid,
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

ldm_core::composite!(Decoder {
    conv_in,
    mid,
    up,
    norm_out,
    conv_out,
});

impl Decoder {
    pub fn new(config: &AutoencoderConfig) -> crate::Result<Self> {
        config.validate()?;
        let ch = config.base_channels;
        let groups = config.norm_groups;
        let levels = config.channel_mult.len();

        let mut block_in = ch * config.channel_mult[levels - 1];
        let conv_in = Conv2d::new(config.z_channels, block_in, 3).with_padding(1);
        let mid = Mid::new(block_in, groups);

        // Built deepest first, stored shallowest first
        let mut up = Vec::with_capacity(levels);
        for level in (0..levels).rev() {
            let block_out = ch * config.channel_mult[level];
            let mut block = Vec::with_capacity(config.num_res_blocks + 1);
            for _ in 0..=config.num_res_blocks {
                block.push(ResnetBlock::new(block_in, block_out, groups));
                block_in = block_out;
            }
            up.push(UpLevel {
                block,
                upsample: (level != 0).then(|| Upsample::new(block_in)),
            });
        }
        up.reverse();

        Ok(Self {
            conv_in,
            mid,
            up,
            norm_out: GroupNorm::new(block_in, groups).with_eps(1e-6),
            conv_out: Conv2d::new(block_in, config.out_channels, 3).with_padding(1),
        })
    }
}

impl Module for Decoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.conv_in.forward(xs)?;
        let mut h = self.mid.forward(&h)?;
        for level in self.up.iter().rev() {
            h = run_blocks(&level.block, &h)?;
            if let Some(upsample) = &level.upsample {
                h = upsample.forward(&h)?;
            }
        }
        let h = candle_nn::ops::silu(&self.norm_out.forward(&h)?)?;
        self.conv_out.forward(&h)
    }
}

/// KL-regularized autoencoder
#[derive(Debug, Clone)]
pub struct AutoencoderKL {
    encoder: Encoder,
    decoder: Decoder,
    quant_conv: Conv2d,
    post_quant_conv: Conv2d,
    embed_dim: usize,
}

ldm_core::composite!(AutoencoderKL {
    encoder,
    decoder,
    quant_conv,
    post_quant_conv,
});

impl AutoencoderKL {
    pub fn new(config: &AutoencoderConfig) -> crate::Result<Self> {
        let z = config.z_channels;
        Ok(Self {
            encoder: Encoder::new(config)?,
            decoder: Decoder::new(config)?,
            quant_conv: Conv2d::new(2 * z, 2 * config.embed_dim, 1),
            post_quant_conv: Conv2d::new(config.embed_dim, z, 1),
            embed_dim: config.embed_dim,
        })
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Image `(b, c, h, w)` to the latent mean `(b, embed_dim, h/f, w/f)`
    pub fn encode(&self, xs: &Tensor) -> Result<Tensor> {
        let moments = self.quant_conv.forward(&self.encoder.forward(xs)?)?;
        moments.narrow(1, 0, self.embed_dim)
    }

    /// Latent to image, values roughly in `[-1, 1]`
    pub fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        self.decoder
            .forward(&self.post_quant_conv.forward(latent)?)
    }
}

impl Module for AutoencoderKL {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.decode(&self.encode(xs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use ldm_core::{materialize, parameter_count, parameters, Init};

    fn shape_of(root: &dyn ldm_core::Composite, key: &str) -> Option<Vec<usize>> {
        parameters(root)
            .into_iter()
            .find(|(p, _)| p.to_string() == key)
            .map(|(_, param)| param.shape().dims().to_vec())
    }

    #[test]
    fn test_sd_v1_parameter_count() {
        let vae = AutoencoderKL::new(&AutoencoderConfig::default()).unwrap();
        assert_eq!(parameter_count(&vae), 83_653_863);
    }

    #[test]
    fn test_sd_v1_key_shapes() {
        let vae = AutoencoderKL::new(&AutoencoderConfig::default()).unwrap();

        assert_eq!(
            shape_of(&vae, "encoder.down.0.downsample.conv.weight"),
            Some(vec![128, 128, 3, 3])
        );
        assert_eq!(
            shape_of(&vae, "encoder.down.1.block.0.nin_shortcut.weight"),
            Some(vec![256, 128, 1, 1])
        );
        assert_eq!(shape_of(&vae, "encoder.down.3.downsample.conv.weight"), None);
        assert_eq!(
            shape_of(&vae, "encoder.mid.attn_1.q.weight"),
            Some(vec![512, 512, 1, 1])
        );
        assert_eq!(
            shape_of(&vae, "decoder.up.3.block.2.conv2.weight"),
            Some(vec![512, 512, 3, 3])
        );
        assert_eq!(
            shape_of(&vae, "decoder.up.1.block.0.nin_shortcut.weight"),
            Some(vec![256, 512, 1, 1])
        );
        assert_eq!(
            shape_of(&vae, "decoder.up.1.upsample.conv.weight"),
            Some(vec![256, 256, 3, 3])
        );
        assert_eq!(shape_of(&vae, "decoder.up.0.upsample.conv.weight"), None);
        assert_eq!(shape_of(&vae, "quant_conv.weight"), Some(vec![8, 8, 1, 1]));
        assert_eq!(
            shape_of(&vae, "post_quant_conv.weight"),
            Some(vec![4, 4, 1, 1])
        );
    }

    #[test]
    fn test_tiny_round_trip_shapes() {
        let config = AutoencoderConfig::tiny();
        let mut vae = AutoencoderKL::new(&config).unwrap();
        assert_eq!(parameter_count(&vae), 43_711);
        materialize(&mut vae, Init::Normal { std: 0.05 }, &Device::Cpu).unwrap();

        let image = Tensor::randn(0f32, 1f32, (1, 3, 16, 16), &Device::Cpu).unwrap();
        let latent = vae.encode(&image).unwrap();
        assert_eq!(latent.dims(), &[1, 4, 8, 8]);
        assert_eq!(config.downscale_factor(), 2);

        let decoded = vae.decode(&latent).unwrap();
        assert_eq!(decoded.dims(), &[1, 3, 16, 16]);
    }

    #[test]
    fn test_invalid_config() {
        let config = AutoencoderConfig {
            norm_groups: 3,
            ..AutoencoderConfig::tiny()
        };
        assert!(matches!(
            AutoencoderKL::new(&config),
            Err(ModelError::InvalidConfig(_))
        ));

        let config = AutoencoderConfig {
            channel_mult: vec![],
            ..AutoencoderConfig::default()
        };
        assert!(AutoencoderKL::new(&config).is_err());
    }

    #[test]
    fn test_halves_reject_empty_channel_mult() {
        let config = AutoencoderConfig {
            channel_mult: vec![],
            ..AutoencoderConfig::tiny()
        };
        assert!(matches!(
            Encoder::new(&config),
            Err(ModelError::InvalidConfig(_))
        ));
        assert!(matches!(
            Decoder::new(&config),
            Err(ModelError::InvalidConfig(_))
        ));

        assert!(Encoder::new(&AutoencoderConfig::tiny()).is_ok());
        assert!(Decoder::new(&AutoencoderConfig::tiny()).is_ok());
    }
}
