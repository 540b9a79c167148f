//! Residual blocks

use candle_core::{Module, Result, Tensor};

use super::conv::Conv2d;
use super::layer::{sequential, Conditioning, Layer};
use super::linear::Linear;
use super::norm::GroupNorm;

/// Autoencoder residual block, no time conditioning
#[derive(Debug, Clone)]
pub struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

ldm_core::composite!(ResnetBlock {
    norm1,
    conv1,
    norm2,
    conv2,
    nin_shortcut,
});

impl ResnetBlock {
    pub fn new(in_channels: usize, out_channels: usize, groups: usize) -> Self {
        Self {
            norm1: GroupNorm::new(in_channels, groups).with_eps(1e-6),
            conv1: Conv2d::new(in_channels, out_channels, 3).with_padding(1),
            norm2: GroupNorm::new(out_channels, groups).with_eps(1e-6),
            conv2: Conv2d::new(out_channels, out_channels, 3).with_padding(1),
            nin_shortcut: (in_channels != out_channels)
                .then(|| Conv2d::new(in_channels, out_channels, 1)),
        }
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = candle_nn::ops::silu(&self.norm1.forward(xs)?)?;
        let h = self.conv1.forward(&h)?;
        let h = candle_nn::ops::silu(&self.norm2.forward(&h)?)?;
        let h = self.conv2.forward(&h)?;

        match &self.nin_shortcut {
            Some(shortcut) => shortcut.forward(xs)? + h,
            None => xs + h,
        }
    }
}

/// UNet residual block, conditioned on the time embedding
#[derive(Debug, Clone)]
pub struct ResBlock {
    in_layers: Vec<Layer>,
    emb_layers: Vec<Layer>,
    out_layers: Vec<Layer>,
    skip_connection: Option<Conv2d>,
}

ldm_core::composite!(ResBlock {
    in_layers,
    emb_layers,
    out_layers,
    skip_connection,
});

impl ResBlock {
    pub fn new(
        in_channels: usize,
        emb_channels: usize,
        out_channels: usize,
        groups: usize,
    ) -> Self {
        Self {
            in_layers: vec![
                GroupNorm::new(in_channels, groups).into(),
                Layer::Silu,
                Conv2d::new(in_channels, out_channels, 3).with_padding(1).into(),
            ],
            emb_layers: vec![Layer::Silu, Linear::new(emb_channels, out_channels).into()],
            out_layers: vec![
                GroupNorm::new(out_channels, groups).into(),
                Layer::Silu,
                Layer::Identity,
                Conv2d::new(out_channels, out_channels, 3).with_padding(1).into(),
            ],
            skip_connection: (in_channels != out_channels)
                .then(|| Conv2d::new(in_channels, out_channels, 1)),
        }
    }

    pub fn forward(&self, xs: &Tensor, emb: &Tensor) -> Result<Tensor> {
        let none = Conditioning::none();
        let h = sequential(&self.in_layers, xs, &none)?;

        // (b, c) broadcast over the spatial dims
        let emb = sequential(&self.emb_layers, emb, &none)?
            .unsqueeze(2)?
            .unsqueeze(3)?;
        let h = sequential(&self.out_layers, &h.broadcast_add(&emb)?, &none)?;

        match &self.skip_connection {
            Some(skip) => skip.forward(xs)? + h,
            None => xs + h,
        }
    }
}
