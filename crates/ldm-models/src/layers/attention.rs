//! Attention blocks

use candle_core::{Module, Result, Tensor};

use super::conv::Conv2d;
use super::layer::{sequential, Conditioning, Layer};
use super::linear::Linear;
use super::norm::GroupNorm;

/// Single-head spatial self-attention used in the autoencoder
#[derive(Debug, Clone)]
pub struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
}

ldm_core::composite!(AttnBlock { norm, q, k, v, proj_out });

impl AttnBlock {
    pub fn new(channels: usize, groups: usize) -> Self {
        Self {
            norm: GroupNorm::new(channels, groups).with_eps(1e-6),
            q: Conv2d::new(channels, channels, 1),
            k: Conv2d::new(channels, channels, 1),
            v: Conv2d::new(channels, channels, 1),
            proj_out: Conv2d::new(channels, channels, 1),
        }
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.norm.forward(xs)?;
        let q = self.q.forward(&h)?;
        let k = self.k.forward(&h)?;
        let v = self.v.forward(&h)?;

        let (b, c, height, width) = q.dims4()?;
        let q = q
            .reshape((b, c, height * width))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k.reshape((b, c, height * width))?;
        let v = v.reshape((b, c, height * width))?;

        // (b, hw_q, hw_k)
        let weights = (q.matmul(&k)? * (c as f64).powf(-0.5))?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;

        let h = v
            .matmul(&weights.t()?.contiguous()?)?
            .reshape((b, c, height, width))?;

        xs + self.proj_out.forward(&h)?
    }
}

/// Multi-head attention over token sequences.
///
/// Self-attention when no context is given, cross-attention otherwise.
#[derive(Debug, Clone)]
pub struct CrossAttention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Vec<Layer>,
    num_heads: usize,
    head_dim: usize,
}

ldm_core::composite!(CrossAttention { to_q, to_k, to_v, to_out });

impl CrossAttention {
    pub fn new(query_dim: usize, context_dim: usize, num_heads: usize, head_dim: usize) -> Self {
        let inner = num_heads * head_dim;
        Self {
            to_q: Linear::new(query_dim, inner).without_bias(),
            to_k: Linear::new(context_dim, inner).without_bias(),
            to_v: Linear::new(context_dim, inner).without_bias(),
            to_out: vec![Linear::new(inner, query_dim).into()],
            num_heads,
            head_dim,
        }
    }

    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let context = context.unwrap_or(xs);

        let q = self.split_heads(&self.to_q.forward(xs)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;

        let scale = (self.head_dim as f64).powf(-0.5);
        let weights = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;

        let out = self.merge_heads(&weights.matmul(&v)?)?;
        sequential(&self.to_out, &out, &Conditioning::none())
    }

    /// `(b, n, h*d)` to `(b, h, n, d)`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        xs.reshape((b, n, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn merge_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, h, n, d) = xs.dims4()?;
        xs.transpose(1, 2)?.reshape((b, n, h * d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use ldm_core::{materialize, parameters, Init};

    #[test]
    fn test_attn_block_keeps_shape() {
        let mut attn = AttnBlock::new(32, 8);
        materialize(&mut attn, Init::Normal { std: 0.05 }, &Device::Cpu).unwrap();

        let x = Tensor::randn(0f32, 1f32, (1, 32, 4, 4), &Device::Cpu).unwrap();
        assert_eq!(attn.forward(&x).unwrap().dims(), &[1, 32, 4, 4]);
    }

    #[test]
    fn test_cross_attention_paths() {
        let attn = CrossAttention::new(320, 768, 8, 40);
        let shapes: Vec<(String, Vec<usize>)> = parameters(&attn)
            .into_iter()
            .map(|(p, param)| (p.to_string(), param.shape().dims().to_vec()))
            .collect();

        assert_eq!(
            shapes,
            vec![
                ("to_q.weight".to_string(), vec![320, 320]),
                ("to_k.weight".to_string(), vec![320, 768]),
                ("to_v.weight".to_string(), vec![320, 768]),
                ("to_out.0.weight".to_string(), vec![320, 320]),
                ("to_out.0.bias".to_string(), vec![320]),
            ]
        );
    }

    #[test]
    fn test_cross_attention_context_length() {
        let mut attn = CrossAttention::new(16, 24, 2, 8);
        materialize(&mut attn, Init::Normal { std: 0.1 }, &Device::Cpu).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 9, 16), &Device::Cpu).unwrap();
        let context = Tensor::randn(0f32, 1f32, (2, 5, 24), &Device::Cpu).unwrap();
        assert_eq!(attn.forward(&x, Some(&context)).unwrap().dims(), &[2, 9, 16]);

        let x = Tensor::zeros((1, 3, 16), DType::F32, &Device::Cpu).unwrap();
        let mut attn = CrossAttention::new(16, 16, 2, 8);
        materialize(&mut attn, Init::Zeros, &Device::Cpu).unwrap();
        assert_eq!(attn.forward(&x, None).unwrap().dims(), &[1, 3, 16]);
    }
}
