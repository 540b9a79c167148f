//! 2-D convolution

use candle_core::{Module, Result, Tensor, D};
use ldm_core::Param;

/// Zero padding applied before the convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Same amount on every side
    Symmetric(usize),
    /// Per side; applied as explicit zero padding, then a padding-free conv
    Asymmetric {
        left: usize,
        right: usize,
        top: usize,
        bottom: usize,
    },
}

/// 2-D convolution with weight `(out, in, k, k)` and optional bias `(out)`
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Param,
    bias: Option<Param>,
    stride: usize,
    padding: Padding,
}

ldm_core::composite!(Conv2d { weight, bias });

impl Conv2d {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            weight: Param::new((out_channels, in_channels, kernel_size, kernel_size)),
            bias: Some(Param::new(out_channels)),
            stride: 1,
            padding: Padding::Symmetric(0),
        }
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = Padding::Symmetric(padding);
        self
    }

    pub fn with_padding_mode(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }
}

impl Module for Conv2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (xs, padding) = match self.padding {
            Padding::Symmetric(padding) => (xs.clone(), padding),
            Padding::Asymmetric {
                left,
                right,
                top,
                bottom,
            } => (
                xs.pad_with_zeros(D::Minus1, left, right)?
                    .pad_with_zeros(D::Minus2, top, bottom)?,
                0,
            ),
        };

        let bias = self.bias.as_ref().map(|b| b.get().cloned()).transpose()?;
        let config = candle_nn::Conv2dConfig {
            padding,
            stride: self.stride,
            ..Default::default()
        };

        candle_nn::Conv2d::new(self.weight.get()?.clone(), bias, config).forward(&xs)
    }
}
