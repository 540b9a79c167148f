//! Normalization layers

use candle_core::{Module, Result, Tensor};
use ldm_core::Param;

/// Group normalization over `(batch, channels, ...)` inputs
#[derive(Debug, Clone)]
pub struct GroupNorm {
    weight: Param,
    bias: Param,
    num_groups: usize,
    eps: f64,
}

ldm_core::composite!(GroupNorm { weight, bias });

impl GroupNorm {
    pub fn new(channels: usize, num_groups: usize) -> Self {
        Self {
            weight: Param::new(channels),
            bias: Param::new(channels),
            num_groups,
            eps: 1e-5,
        }
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn channels(&self) -> usize {
        self.weight.elem_count()
    }
}

impl Module for GroupNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::GroupNorm::new(
            self.weight.get()?.clone(),
            self.bias.get()?.clone(),
            self.channels(),
            self.num_groups,
            self.eps,
        )?
        .forward(xs)
    }
}

/// Layer normalization over the last dimension
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Param,
    bias: Param,
    eps: f64,
}

ldm_core::composite!(LayerNorm { weight, bias });

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        Self {
            weight: Param::new(dim),
            bias: Param::new(dim),
            eps: 1e-5,
        }
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::LayerNorm::new(self.weight.get()?.clone(), self.bias.get()?.clone(), self.eps)
            .forward(xs)
    }
}
