//! Dense layers and embeddings

use candle_core::{Module, Result, Tensor};
use ldm_core::Param;

/// Affine map with weight `(out, in)` and optional bias `(out)`
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Param,
    bias: Option<Param>,
}

ldm_core::composite!(Linear { weight, bias });

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Param::new((out_features, in_features)),
            bias: Some(Param::new(out_features)),
        }
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }
}

impl Module for Linear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let bias = self.bias.as_ref().map(|b| b.get().cloned()).transpose()?;
        candle_nn::Linear::new(self.weight.get()?.clone(), bias).forward(xs)
    }
}

/// Lookup table with weight `(num_embeddings, dim)`
#[derive(Debug, Clone)]
pub struct Embedding {
    weight: Param,
}

ldm_core::composite!(Embedding { weight });

impl Embedding {
    pub fn new(num_embeddings: usize, dim: usize) -> Self {
        Self {
            weight: Param::new((num_embeddings, dim)),
        }
    }

    pub fn dim(&self) -> usize {
        self.weight.shape().dims()[1]
    }
}

impl Module for Embedding {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        candle_nn::Embedding::new(self.weight.get()?.clone(), self.dim()).forward(ids)
    }
}
