//! Spatial transformer

use candle_core::{Module, Result, Tensor, D};

use super::attention::CrossAttention;
use super::conv::Conv2d;
use super::layer::{sequential, Conditioning, Layer};
use super::linear::Linear;
use super::norm::{GroupNorm, LayerNorm};

/// Gated GELU: project to twice the width, gate one half with the other
#[derive(Debug, Clone)]
pub struct GeGlu {
    proj: Linear,
}

ldm_core::composite!(GeGlu { proj });

impl GeGlu {
    pub fn new(dim_in: usize, dim_out: usize) -> Self {
        Self {
            proj: Linear::new(dim_in, dim_out * 2),
        }
    }
}

impl Module for GeGlu {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.proj.forward(xs)?;
        let chunks = h.chunk(2, D::Minus1)?;
        &chunks[0] * chunks[1].gelu_erf()?
    }
}

/// GEGLU feed-forward with a 4× hidden width
#[derive(Debug, Clone)]
pub struct FeedForward {
    net: Vec<Layer>,
}

ldm_core::composite!(FeedForward { net });

impl FeedForward {
    pub fn new(dim: usize) -> Self {
        let hidden = dim * 4;
        Self {
            net: vec![
                GeGlu::new(dim, hidden).into(),
                Layer::Identity,
                Linear::new(hidden, dim).into(),
            ],
        }
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        sequential(&self.net, xs, &Conditioning::none())
    }
}

/// Self-attention, cross-attention and feed-forward, each pre-normed and residual
#[derive(Debug, Clone)]
pub struct BasicTransformerBlock {
    attn1: CrossAttention,
    ff: FeedForward,
    attn2: CrossAttention,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
}

ldm_core::composite!(BasicTransformerBlock {
    attn1,
    ff,
    attn2,
    norm1,
    norm2,
    norm3,
});

impl BasicTransformerBlock {
    pub fn new(dim: usize, context_dim: usize, num_heads: usize, head_dim: usize) -> Self {
        Self {
            attn1: CrossAttention::new(dim, dim, num_heads, head_dim),
            ff: FeedForward::new(dim),
            attn2: CrossAttention::new(dim, context_dim, num_heads, head_dim),
            norm1: LayerNorm::new(dim),
            norm2: LayerNorm::new(dim),
            norm3: LayerNorm::new(dim),
        }
    }

    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let xs = (self.attn1.forward(&self.norm1.forward(xs)?, None)? + xs)?;
        let xs = (self.attn2.forward(&self.norm2.forward(&xs)?, context)? + &xs)?;
        self.ff.forward(&self.norm3.forward(&xs)?)? + &xs
    }
}

/// Attention over the spatial positions of a feature map
#[derive(Debug, Clone)]
pub struct SpatialTransformer {
    norm: GroupNorm,
    proj_in: Conv2d,
    transformer_blocks: Vec<BasicTransformerBlock>,
    proj_out: Conv2d,
}

ldm_core::composite!(SpatialTransformer {
    norm,
    proj_in,
    transformer_blocks,
    proj_out,
});

impl SpatialTransformer {
    pub fn new(
        channels: usize,
        context_dim: usize,
        num_heads: usize,
        head_dim: usize,
        groups: usize,
    ) -> Self {
        let inner = num_heads * head_dim;
        Self {
            norm: GroupNorm::new(channels, groups).with_eps(1e-6),
            proj_in: Conv2d::new(channels, inner, 1),
            transformer_blocks: vec![BasicTransformerBlock::new(
                inner,
                context_dim,
                num_heads,
                head_dim,
            )],
            proj_out: Conv2d::new(inner, channels, 1),
        }
    }

    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let (b, _, h, w) = xs.dims4()?;
        let hidden = self.proj_in.forward(&self.norm.forward(xs)?)?;
        let inner = hidden.dim(1)?;

        // (b, c, h, w) to (b, hw, c)
        let mut hidden = hidden
            .reshape((b, inner, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        for block in &self.transformer_blocks {
            hidden = block.forward(&hidden, context)?;
        }
        let hidden = hidden.transpose(1, 2)?.reshape((b, inner, h, w))?;

        self.proj_out.forward(&hidden)? + xs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use ldm_core::{materialize, parameter_count, parameters, Init};

    #[test]
    fn test_feed_forward_paths() {
        let ff = FeedForward::new(320);
        let shapes: Vec<(String, Vec<usize>)> = parameters(&ff)
            .into_iter()
            .map(|(p, param)| (p.to_string(), param.shape().dims().to_vec()))
            .collect();
        assert_eq!(
            shapes,
            vec![
                ("net.0.proj.weight".to_string(), vec![2560, 320]),
                ("net.0.proj.bias".to_string(), vec![2560]),
                ("net.2.weight".to_string(), vec![320, 1280]),
                ("net.2.bias".to_string(), vec![320]),
            ]
        );
    }

    #[test]
    fn test_spatial_transformer_forward() {
        let mut block = SpatialTransformer::new(32, 12, 4, 8, 8);
        materialize(&mut block, Init::Normal { std: 0.05 }, &Device::Cpu).unwrap();

        let x = Tensor::randn(0f32, 1f32, (1, 32, 4, 4), &Device::Cpu).unwrap();
        let context = Tensor::randn(0f32, 1f32, (1, 7, 12), &Device::Cpu).unwrap();
        assert_eq!(block.forward(&x, Some(&context)).unwrap().dims(), &[1, 32, 4, 4]);
    }

    #[test]
    fn test_block_parameter_count() {
        let block = BasicTransformerBlock::new(320, 768, 8, 40);
        // attn1 4*320², attn2 2*320² + 2*320*768, out biases 2*320,
        // ff 320*2560+2560 + 1280*320+320, norms 6*320
        let expected = 4 * 320 * 320
            + 2 * 320 * 320
            + 2 * 320 * 768
            + 2 * 320
            + 320 * 2560
            + 2560
            + 1280 * 320
            + 320
            + 6 * 320;
        assert_eq!(parameter_count(&block), expected);
    }
}
