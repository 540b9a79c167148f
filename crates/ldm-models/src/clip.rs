//! CLIP text transformer
//!
//! Token ids `(b, seq)` to hidden states `(b, seq, hidden)`, with causal
//! self-attention and quick-GELU MLPs.

use candle_core::{bail, DType, Device, Module, Result, Tensor};
use ldm_core::Param;

use crate::error::ModelError;
use crate::layers::{Embedding, LayerNorm, Linear};

/// Text encoder configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipConfig {
    pub vocab_size: usize,
    /// Longest token sequence
    pub max_position_embeddings: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            vocab_size: 49408,
            max_position_embeddings: 77,
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        }
    }
}

impl ClipConfig {
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            max_position_embeddings: 16,
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 2,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ModelError> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "hidden size {} not divisible into {} heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.max_position_embeddings == 0 || self.vocab_size == 0 {
            return Err(ModelError::InvalidConfig(
                "vocabulary and position table must be non-empty".into(),
            ));
        }
        Ok(())
    }
}

fn quick_gelu(xs: &Tensor) -> Result<Tensor> {
    xs * candle_nn::ops::sigmoid(&(xs * 1.702)?)?
}

/// Additive mask hiding later positions, `(seq, seq)`
fn causal_mask(seq: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq)
        .flat_map(|i| (0..seq).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_slice(&mask, (seq, seq), device)?.to_dtype(dtype)
}

/// Token and position tables
#[derive(Debug, Clone)]
pub struct ClipEmbeddings {
    /// Checkpoint slot only; positions are always `0..seq`
    position_ids: Param,
    token_embedding: Embedding,
    position_embedding: Embedding,
}

ldm_core::composite!(ClipEmbeddings {
    position_ids,
    token_embedding,
    position_embedding,
});

impl ClipEmbeddings {
    fn new(config: &ClipConfig) -> Self {
        Self {
            position_ids: Param::new((1, config.max_position_embeddings)).with_dtype(DType::I64),
            token_embedding: Embedding::new(config.vocab_size, config.hidden_size),
            position_embedding: Embedding::new(config.max_position_embeddings, config.hidden_size),
        }
    }
}

impl Module for ClipEmbeddings {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let (_, seq) = ids.dims2()?;
        let positions = Tensor::arange(0u32, seq as u32, ids.device())?.unsqueeze(0)?;
        let tokens = self.token_embedding.forward(ids)?;
        tokens.broadcast_add(&self.position_embedding.forward(&positions)?)
    }
}

#[derive(Debug, Clone)]
pub struct ClipAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

ldm_core::composite!(ClipAttention {
    q_proj,
    k_proj,
    v_proj,
    out_proj,
});

impl ClipAttention {
    fn new(hidden: usize, num_heads: usize) -> Self {
        Self {
            q_proj: Linear::new(hidden, hidden),
            k_proj: Linear::new(hidden, hidden),
            v_proj: Linear::new(hidden, hidden),
            out_proj: Linear::new(hidden, hidden),
            num_heads,
            head_dim: hidden / num_heads,
        }
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        xs.reshape((b, n, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, n, hidden) = xs.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(xs)?)?;
        let k = self.split_heads(&self.k_proj.forward(xs)?)?;
        let v = self.split_heads(&self.v_proj.forward(xs)?)?;

        let scale = (self.head_dim as f64).powf(-0.5);
        let weights = (q.matmul(&k.t()?.contiguous()?)? * scale)?.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;

        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, hidden))?;
        self.out_proj.forward(&out)
    }
}

#[derive(Debug, Clone)]
pub struct ClipMlp {
    fc1: Linear,
    fc2: Linear,
}

ldm_core::composite!(ClipMlp { fc1, fc2 });

impl Module for ClipMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&quick_gelu(&self.fc1.forward(xs)?)?)
    }
}

#[derive(Debug, Clone)]
pub struct ClipEncoderLayer {
    self_attn: ClipAttention,
    layer_norm1: LayerNorm,
    mlp: ClipMlp,
    layer_norm2: LayerNorm,
}

ldm_core::composite!(ClipEncoderLayer {
    self_attn,
    layer_norm1,
    mlp,
    layer_norm2,
});

impl ClipEncoderLayer {
    fn new(config: &ClipConfig) -> Self {
        let hidden = config.hidden_size;
        Self {
            self_attn: ClipAttention::new(hidden, config.num_attention_heads),
            layer_norm1: LayerNorm::new(hidden),
            mlp: ClipMlp {
                fc1: Linear::new(hidden, config.intermediate_size),
                fc2: Linear::new(config.intermediate_size, hidden),
            },
            layer_norm2: LayerNorm::new(hidden),
        }
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let h = self
            .self_attn
            .forward(&self.layer_norm1.forward(xs)?, mask)?;
        let xs = (xs + h)?;
        let h = self.mlp.forward(&self.layer_norm2.forward(&xs)?)?;
        xs + h
    }
}

#[derive(Debug, Clone)]
pub struct ClipEncoder {
    layers: Vec<ClipEncoderLayer>,
}

ldm_core::composite!(ClipEncoder { layers });

/// The `text_model` sub-tree
#[derive(Debug, Clone)]
pub struct ClipTextModel {
    embeddings: ClipEmbeddings,
    encoder: ClipEncoder,
    final_layer_norm: LayerNorm,
    max_positions: usize,
}

ldm_core::composite!(ClipTextModel {
    embeddings,
    encoder,
    final_layer_norm,
});

impl ClipTextModel {
    pub fn new(config: &ClipConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            embeddings: ClipEmbeddings::new(config),
            encoder: ClipEncoder {
                layers: (0..config.num_hidden_layers)
                    .map(|_| ClipEncoderLayer::new(config))
                    .collect(),
            },
            final_layer_norm: LayerNorm::new(config.hidden_size),
            max_positions: config.max_position_embeddings,
        })
    }

    /// Token ids `(b, seq)` to hidden states `(b, seq, hidden)`
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let (_, seq) = ids.dims2()?;
        if seq > self.max_positions {
            bail!(
                "sequence of {} tokens exceeds {} positions",
                seq,
                self.max_positions
            );
        }

        let mut h = self.embeddings.forward(ids)?;
        let mask = causal_mask(seq, h.dtype(), h.device())?;
        for layer in &self.encoder.layers {
            h = layer.forward(&h, &mask)?;
        }
        self.final_layer_norm.forward(&h)
    }

    /// Encode a single token sequence
    pub fn encode_tokens(&self, tokens: &[u32], device: &Device) -> Result<Tensor> {
        let ids = Tensor::new(tokens, device)?.unsqueeze(0)?;
        self.forward(&ids)
    }
}

/// The `transformer` wrapper around `text_model`
#[derive(Debug, Clone)]
pub struct ClipTextTransformer {
    text_model: ClipTextModel,
}

ldm_core::composite!(ClipTextTransformer { text_model });

impl ClipTextTransformer {
    pub fn new(config: &ClipConfig) -> crate::Result<Self> {
        Ok(Self {
            text_model: ClipTextModel::new(config)?,
        })
    }

    pub fn text_model(&self) -> &ClipTextModel {
        &self.text_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldm_core::{materialize, parameter_count, parameters, Init};

    #[test]
    fn test_sd_v1_parameter_count() {
        let clip = ClipTextModel::new(&ClipConfig::default()).unwrap();
        assert_eq!(parameter_count(&clip), 123_060_557);
    }

    #[test]
    fn test_key_shapes() {
        let clip = ClipTextTransformer::new(&ClipConfig::default()).unwrap();
        let params = parameters(&clip);

        let (path, param) = &params[0];
        assert_eq!(path.to_string(), "text_model.embeddings.position_ids");
        assert_eq!(param.shape().dims(), &[1, 77]);
        assert_eq!(param.dtype(), DType::I64);

        let find = |key: &str| {
            params
                .iter()
                .find(|(p, _)| p.to_string() == key)
                .map(|(_, param)| param.shape().dims().to_vec())
        };
        assert_eq!(
            find("text_model.embeddings.token_embedding.weight"),
            Some(vec![49408, 768])
        );
        assert_eq!(
            find("text_model.encoder.layers.11.mlp.fc1.weight"),
            Some(vec![3072, 768])
        );
        assert_eq!(
            find("text_model.encoder.layers.0.self_attn.out_proj.bias"),
            Some(vec![768])
        );
        assert_eq!(find("text_model.encoder.layers.12.mlp.fc1.weight"), None);
    }

    #[test]
    fn test_tiny_forward() {
        let config = ClipConfig::tiny();
        let mut clip = ClipTextModel::new(&config).unwrap();
        assert_eq!(parameter_count(&clip), 5_776);
        materialize(&mut clip, Init::Normal { std: 0.1 }, &Device::Cpu).unwrap();

        let hidden = clip.encode_tokens(&[1, 2, 3], &Device::Cpu).unwrap();
        assert_eq!(hidden.dims(), &[1, 3, 16]);

        let too_long: Vec<u32> = (0..17).collect();
        assert!(clip.encode_tokens(&too_long, &Device::Cpu).is_err());
    }

    #[test]
    fn test_causal_prefix_is_stable() {
        let mut clip = ClipTextModel::new(&ClipConfig::tiny()).unwrap();
        materialize(&mut clip, Init::Normal { std: 0.1 }, &Device::Cpu).unwrap();

        // Earlier positions never attend to later ones
        let short = clip.encode_tokens(&[5, 9], &Device::Cpu).unwrap();
        let long = clip.encode_tokens(&[5, 9, 40, 3], &Device::Cpu).unwrap();
        let prefix = long.narrow(1, 0, 2).unwrap();

        let diff = (short - prefix)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_causal_mask() {
        let mask = causal_mask(3, DType::F32, &Device::Cpu).unwrap();
        let rows = mask.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite());
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
    }
}
